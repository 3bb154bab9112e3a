//! Shared value types that flow through the streaming pipeline:
//! [`StreamChunk`], [`SseEvent`], finish reasons, and stream identity.

use crate::error::Error;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonically increasing identifier for a stream, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate the next stream id. Used by [`crate::engine::StreamingEngine`]
    /// when the caller doesn't supply one of its own.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Reason a stream (or a chunk within one) terminated.
///
/// `Stop`/`Length`/`Error`/`Cancelled` are the reasons this crate itself
/// produces; `Other` carries a provider-defined string through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Error,
    Cancelled,
    Other(String),
}

impl FinishReason {
    /// Parse a finish-reason string as delivered by a provider's chunk.
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "error" => Self::Error,
            "cancelled" | "canceled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Other(s) => s,
        }
    }

    /// Whether this reason signals the end of a stream. `complete` and `end`
    /// are provider-defined synonyms the batcher also treats as terminal.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Stop | Self::Length | Self::Error | Self::Cancelled => true,
            Self::Other(s) => matches!(s.as_str(), "complete" | "end"),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single canonical delivery unit in the pipeline.
///
/// Immutable once produced; ownership passes from hand to hand as the chunk
/// moves from the provider parser through the buffer/batcher to the
/// consumer.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    pub model: Option<String>,
    pub id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StreamChunk {
    /// A plain text delta chunk.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// The terminal "stop" chunk every successful stream ends with.
    pub fn stop() -> Self {
        Self {
            finish_reason: Some(FinishReason::Stop),
            ..Self::default()
        }
    }

    /// The terminal chunk a cancelled stream ends with.
    pub fn cancelled() -> Self {
        Self {
            finish_reason: Some(FinishReason::Cancelled),
            ..Self::default()
        }
    }

    /// The terminal chunk a failed stream ends with. Per the wire contract,
    /// `content` always begins with `"Error: "`.
    pub fn error(message: impl fmt::Display) -> Self {
        Self {
            content: format!("Error: {message}"),
            finish_reason: Some(FinishReason::Error),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.as_ref().is_some_and(FinishReason::is_terminal)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A parsed Server-Sent Event. Short-lived: handed to the `ParseChunk` hook
/// and then discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` sentinel some providers send
    /// instead of closing the connection.
    pub fn is_done_sentinel(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Result of handing one SSE event's `data` field to a provider's
/// chunk parser.
pub enum ParsedChunk {
    /// A canonical chunk to forward downstream.
    Chunk(StreamChunk),
    /// The provider's own done-marker, distinct from the SSE `[DONE]`
    /// sentinel the coordinator already handles.
    Done,
    /// Not an error, but nothing worth forwarding (e.g. a ping frame).
    Ignored,
}

/// Provider-supplied hook turning one SSE event's raw `data` payload into a
/// [`ParsedChunk`]. Must be pure and fast; providers are out of this
/// crate's scope, so callers box up whatever schema their provider uses.
pub type ParseChunkFn = Box<dyn Fn(&str) -> Result<ParsedChunk, Error> + Send + Sync>;

/// Optional post-parse hook that can veto a chunk before it reaches the
/// flow controller.
pub type ValidateChunkFn = Box<dyn Fn(&StreamChunk) -> bool + Send + Sync>;

/// Result of [`TransformChunkFn`]: either a replacement chunk or a request
/// to drop this one silently (not counted as buffer-dropped; see
/// `FlowController` accounting notes).
pub enum TransformOutcome {
    Keep(StreamChunk),
    Skip,
}

pub type TransformChunkFn = Box<dyn FnMut(StreamChunk) -> TransformOutcome + Send>;

/// Per-stream bookkeeping the coordinator maintains independent of flow
/// control or recovery: identity, timing, and feature flags.
#[derive(Debug, Clone, Serialize)]
pub struct StreamContext {
    pub stream_id: StreamId,
    pub provider: Option<String>,
    #[serde(skip)]
    pub start_time: Instant,
    pub chunks: u64,
    pub bytes: u64,
    pub errors: u64,
    pub flow_control: bool,
    pub batching: bool,
    pub detailed_metrics: bool,
}

impl StreamContext {
    pub fn new(stream_id: StreamId, provider: Option<String>) -> Self {
        Self {
            stream_id,
            provider,
            start_time: Instant::now(),
            chunks: 0,
            bytes: 0,
            errors: 0,
            flow_control: false,
            batching: false,
            detailed_metrics: false,
        }
    }

    pub fn record_chunk(&mut self, bytes: usize) {
        self.chunks += 1;
        self.bytes += bytes as u64;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }
}
