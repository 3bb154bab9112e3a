//! Adaptive batching of [`StreamChunk`]s before delivery to the consumer.
//!
//! A batch closes on whichever trigger fires first: accumulated size,
//! elapsed time since the batch opened, a terminal chunk, or an explicit
//! forced flush. The size/timeout targets retarget themselves from a
//! rolling window of recent chunk sizes and inter-arrival gaps so a burst
//! of small, fast chunks batches more aggressively than one of large,
//! slow chunks.

use crate::types::StreamChunk;
use std::time::{Duration, Instant};

const ADAPT_WINDOW: usize = 20;

/// Trigger that closed a batch, surfaced for metrics/debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    Size,
    Timeout,
    Terminal,
    Forced,
}

/// One closed batch of chunks plus why it closed.
#[derive(Debug)]
pub struct Batch {
    pub chunks: Vec<StreamChunk>,
    pub trigger: BatchTrigger,
}

/// Tuning knobs. `min_*`/`max_*` bound what adaptive retargeting can do to
/// `target_size`/`target_timeout`.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub initial_target_size: usize,
    pub min_target_size: usize,
    pub max_target_size: usize,
    pub initial_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub adaptive: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            initial_target_size: 5,
            min_target_size: 1,
            max_target_size: 20,
            initial_timeout: Duration::from_millis(25),
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(500),
            adaptive: true,
        }
    }
}

/// Adaptive batcher. Owned by one stream; not `Send`-shared across tasks —
/// [`crate::flow::FlowController`] drives it from its single consumer loop.
pub struct ChunkBatcher {
    config: BatcherConfig,
    target_size: usize,
    target_timeout: Duration,
    pending: Vec<StreamChunk>,
    opened_at: Option<Instant>,
    last_arrival: Option<Instant>,
    recent_sizes: Vec<usize>,
    recent_intervals: Vec<Duration>,
}

impl ChunkBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        let target_size = config.initial_target_size;
        let target_timeout = config.initial_timeout;
        Self {
            config,
            target_size,
            target_timeout,
            pending: Vec::new(),
            opened_at: None,
            last_arrival: None,
            recent_sizes: Vec::new(),
            recent_intervals: Vec::new(),
        }
    }

    /// Feed one chunk in. Returns a closed [`Batch`] if this chunk tripped
    /// the size or terminal trigger; otherwise `None` and the chunk is held
    /// pending (caller should separately poll [`Self::check_timeout`]).
    pub fn push(&mut self, chunk: StreamChunk, now: Instant) -> Option<Batch> {
        self.record_arrival(chunk.content.len(), now);
        let is_terminal = chunk.is_terminal();

        if self.pending.is_empty() {
            self.opened_at = Some(now);
        }
        self.pending.push(chunk);

        if is_terminal {
            return Some(self.close(BatchTrigger::Terminal));
        }
        if self.pending.len() >= self.target_size {
            return Some(self.close(BatchTrigger::Size));
        }
        None
    }

    /// Called periodically (e.g. against a `tokio::time::sleep_until`
    /// deadline) to close a batch that has sat open past its timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Batch> {
        let opened = self.opened_at?;
        if now.duration_since(opened) >= self.target_timeout {
            Some(self.close(BatchTrigger::Timeout))
        } else {
            None
        }
    }

    /// The instant the current batch's timeout trigger will fire, for a
    /// caller driving a `tokio::select!` timer. `None` when no batch is open.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.target_timeout)
    }

    /// Close the current batch immediately regardless of size/timeout,
    /// e.g. on cancellation or end-of-stream with no terminal chunk seen.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.close(BatchTrigger::Forced))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn target_timeout(&self) -> Duration {
        self.target_timeout
    }

    fn close(&mut self, trigger: BatchTrigger) -> Batch {
        self.opened_at = None;
        if self.config.adaptive {
            self.retarget();
        }
        Batch {
            chunks: std::mem::take(&mut self.pending),
            trigger,
        }
    }

    fn record_arrival(&mut self, size: usize, now: Instant) {
        push_bounded(&mut self.recent_sizes, size, ADAPT_WINDOW);
        if let Some(last) = self.last_arrival {
            push_bounded(&mut self.recent_intervals, now.duration_since(last), ADAPT_WINDOW);
        }
        self.last_arrival = Some(now);
    }

    /// Re-derive `target_size`/`target_timeout` from the last 20 chunk sizes
    /// and inter-arrival intervals, incrementally nudging the current
    /// targets rather than recomputing from scratch. Runs on every batch
    /// close (size, timeout, terminal, or forced), matching "every flush
    /// re-computes effective target/timeout."
    fn retarget(&mut self) {
        if self.recent_sizes.len() < ADAPT_WINDOW || self.recent_intervals.len() < ADAPT_WINDOW {
            return;
        }
        let avg_size = average(&self.recent_sizes);
        let avg_interval = average_duration(&self.recent_intervals);

        if avg_size > 1000.0 {
            self.target_size = self.target_size.saturating_sub(2).max(self.config.min_target_size);
        } else if avg_size < 100.0 {
            self.target_size = (self.target_size + 2).min(self.config.max_target_size);
        }

        if avg_interval < Duration::from_millis(10) {
            self.target_timeout = (self.target_timeout + Duration::from_millis(10))
                .min(self.config.max_timeout);
        } else if avg_interval > Duration::from_millis(100) {
            self.target_timeout = self
                .target_timeout
                .saturating_sub(Duration::from_millis(10))
                .max(self.config.min_timeout);
        }
    }
}

fn push_bounded<T>(buf: &mut Vec<T>, item: T, cap: usize) {
    buf.push(item);
    if buf.len() > cap {
        buf.remove(0);
    }
}

fn average(values: &[usize]) -> f64 {
    values.iter().sum::<usize>() as f64 / values.len() as f64
}

fn average_duration(values: &[Duration]) -> Duration {
    let total: Duration = values.iter().sum();
    total / values.len() as u32
}
