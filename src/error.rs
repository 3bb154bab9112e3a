use std::time::Duration;
use thiserror::Error;

/// Unified error taxonomy across the streaming pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection refused/reset, DNS failure, TLS failure.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// Inactivity or total-timeout exceeded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Non-2xx HTTP response, subdivided by [`HttpErrorKind`].
    #[error("http {status} ({kind:?}): {message}")]
    Http {
        status: u16,
        kind: HttpErrorKind,
        message: String,
    },

    /// SSE or provider chunk parse failure. Per-event fatal, per-stream not.
    #[error("parse: {0}")]
    Parse(String),

    /// The consumer callback returned an error, or exceeded its time budget.
    #[error("consumer: {0}")]
    Consumer(String),

    /// `StreamRecovery` exhausted `max_retries` reconnect attempts.
    #[error("recovery exhausted after {retries} attempts")]
    RecoveryExhausted { retries: u32 },

    /// Lookup failed for a stream id the registry doesn't know about.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// A caller-supplied option was invalid (e.g. `backpressure_threshold`
    /// outside `(0, 1]`).
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Subdivision of [`Error::Http`] by status-code semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    /// 401/403. Fatal.
    Auth,
    /// 429, honours `Retry-After`. Recoverable.
    RateLimit,
    /// 5xx. Recoverable.
    Service,
    /// Any other 4xx. Fatal.
    Validation,
}

impl Error {
    /// Build an [`Error::Http`] from a status code, classifying it per
    /// §7 of the streaming design: 401/403 fatal, 429 and 5xx recoverable,
    /// other 4xx fatal.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => HttpErrorKind::Auth,
            429 => HttpErrorKind::RateLimit,
            500..=599 => HttpErrorKind::Service,
            _ => HttpErrorKind::Validation,
        };
        Self::Http {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Whether [`crate::recovery::StreamRecovery`] should attempt a
    /// reconnect for this error, per the recoverable/non-recoverable split
    /// in the design (transport, timeout, rate-limit, and 5xx are
    /// recoverable; auth, validation, parse, consumer, and an exhausted
    /// recovery budget are not).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Http { kind, .. } => {
                matches!(kind, HttpErrorKind::RateLimit | HttpErrorKind::Service)
            }
            Self::Parse(_)
            | Self::Consumer(_)
            | Self::RecoveryExhausted { .. }
            | Self::StreamNotFound(_)
            | Self::InvalidOption(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(!Error::from_status(401, "x").is_recoverable());
        assert!(Error::from_status(429, "x").is_recoverable());
        assert!(Error::from_status(503, "x").is_recoverable());
        assert!(!Error::from_status(404, "x").is_recoverable());
    }

    #[test]
    fn transport_and_timeout_are_recoverable() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_recoverable());
    }

    #[test]
    fn recovery_exhausted_is_terminal() {
        assert!(!Error::RecoveryExhausted { retries: 3 }.is_recoverable());
    }
}
