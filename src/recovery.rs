//! Stream resumption: checkpointing, a dedup window for post-reconnect
//! duplicates, and exponential backoff with jitter between reconnect
//! attempts. Grounded in the teacher's `client.rs` retry loop, generalized
//! from "retry this HTTP request" to "resume this stream from where it
//! left off."

use crate::error::Error;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Active,
    Recovering,
    Failed,
    Completed,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub checkpoint_interval_chunks: u64,
    pub dedup_window: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            multiplier: 2.0,
            checkpoint_interval_chunks: 100,
            dedup_window: 100,
        }
    }
}

/// A snapshot of stream position recovery can resume from.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub last_chunk_id: Option<String>,
    pub chunks_delivered: u64,
}

/// Per-stream recovery bookkeeping. Owned exclusively by that stream's
/// coordinator task — never shared.
pub struct StreamRecovery {
    config: RecoveryConfig,
    status: RecoveryStatus,
    last_chunk_id: Option<String>,
    dedup_window: VecDeque<String>,
    retry_count: u32,
    chunks_since_checkpoint: u64,
    last_checkpoint: Option<Checkpoint>,
}

impl StreamRecovery {
    /// Registers a stream with recovery tracking.
    pub fn init_recovery(config: RecoveryConfig) -> Self {
        Self {
            config,
            status: RecoveryStatus::Active,
            last_chunk_id: None,
            dedup_window: VecDeque::new(),
            retry_count: 0,
            chunks_since_checkpoint: 0,
            last_checkpoint: None,
        }
    }

    pub fn status(&self) -> RecoveryStatus {
        self.status
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.last_checkpoint.as_ref()
    }

    /// Whether `id` has already been delivered and should be suppressed.
    /// A chunk with no id is never considered a duplicate.
    pub fn is_duplicate(&self, id: &str) -> bool {
        self.dedup_window.iter().any(|seen| seen == id)
    }

    /// Update checkpoint state for a chunk that has already passed the
    /// dedup check and been delivered.
    pub fn record_chunk(&mut self, id: Option<&str>) {
        if let Some(id) = id {
            self.last_chunk_id = Some(id.to_string());
            if self.dedup_window.len() == self.config.dedup_window {
                self.dedup_window.pop_front();
            }
            self.dedup_window.push_back(id.to_string());
        }

        self.chunks_since_checkpoint += 1;
        if self.chunks_since_checkpoint >= self.config.checkpoint_interval_chunks {
            self.chunks_since_checkpoint = 0;
            self.last_checkpoint = Some(Checkpoint {
                last_chunk_id: self.last_chunk_id.clone(),
                chunks_delivered: self.dedup_window.len() as u64,
            });
        }
    }

    /// Classify a transport/HTTP error and decide whether a reconnect
    /// should be attempted. Transitions `status` accordingly.
    pub fn record_error(&mut self, error: &Error) -> bool {
        if !error.is_recoverable() {
            self.status = RecoveryStatus::Failed;
            return false;
        }
        if self.retry_count >= self.config.max_retries {
            self.status = RecoveryStatus::Failed;
            return false;
        }
        self.status = RecoveryStatus::Recovering;
        true
    }

    /// Mark a reconnect attempt as taken and compute the delay before the
    /// *next* one, per `delay = min(initial * multiplier^n, max) + jitter`.
    /// Jitter is additive, uniform in `[0, 25%]` of the base delay, mirroring
    /// the teacher's `fastrand`-based backoff jitter in `client.rs`.
    pub fn next_backoff(&mut self) -> Duration {
        let exp = self.config.multiplier.powi(self.retry_count as i32);
        let base = (self.config.initial_backoff.as_secs_f64() * exp)
            .min(self.config.max_backoff.as_secs_f64());
        let jitter = base * 0.25 * fastrand::f64();
        self.retry_count += 1;
        Duration::from_secs_f64(base + jitter)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries_exhausted(&self) -> bool {
        self.retry_count >= self.config.max_retries
    }

    /// Called once a reconnect actually starts streaming again.
    pub fn mark_resumed(&mut self) {
        self.status = RecoveryStatus::Active;
    }

    pub fn complete_stream(&mut self) {
        self.status = RecoveryStatus::Completed;
    }
}
