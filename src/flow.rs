//! Backpressure-aware bridge between the async producer side of a stream
//! (coordinator feeding parsed chunks in) and a synchronous consumer
//! callback. Owns the [`StreamBuffer`] and an optional [`ChunkBatcher`] for
//! its stream and tracks delivery metrics, including a circuit breaker that
//! aborts a stream whose consumer is failing persistently.

use crate::batcher::{BatcherConfig, ChunkBatcher};
use crate::buffer::{BufferStats, OverflowStrategy, PushOutcome, StreamBuffer};
use crate::error::Error;
use crate::types::StreamChunk;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome window size for the consumer circuit breaker.
const CIRCUIT_WINDOW: usize = 20;
/// Failure fraction within the window that trips the breaker.
const CIRCUIT_THRESHOLD: f64 = 0.5;

pub type ConsumerCallback = Box<dyn FnMut(StreamChunk) -> Result<(), Error> + Send>;

/// Periodic metrics hook, invoked after each delivery when the stream opted
/// into `track_detailed_metrics`.
pub type MetricsCallback = Box<dyn FnMut(&FlowMetrics) + Send>;

/// Point-in-time snapshot of a stream's flow-control state, safe to hand to
/// callers outside the pipeline (e.g. a status API).
#[derive(Debug, Clone, Serialize)]
pub struct FlowMetrics {
    pub buffer_fill_ratio: f64,
    pub buffer_pushed: u64,
    pub buffer_popped: u64,
    pub buffer_dropped: u64,
    pub bytes: u64,
    pub chunks_delivered: u64,
    pub consumer_errors: u64,
    pub batches_delivered: u64,
    pub backpressure_active: bool,
    pub backpressure_events: u64,
    pub avg_batch_size: f64,
    pub throughput_cps: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    pub buffer_capacity: usize,
    pub overflow_strategy: OverflowStrategy,
    /// Buffer fill ratio at or above which backpressure is reported active.
    pub backpressure_threshold: f64,
    /// Minimum spacing between batch deliveries; `None` disables rate limiting.
    pub min_delivery_interval: Option<Duration>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            overflow_strategy: OverflowStrategy::Drop,
            backpressure_threshold: 0.8,
            min_delivery_interval: None,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_capacity == 0 {
            return Err(Error::InvalidOption("buffer_capacity must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) || self.backpressure_threshold <= 0.0 {
            return Err(Error::InvalidOption(
                "backpressure_threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Drives one stream's buffer -> (optional batcher) -> consumer pipeline.
pub struct FlowController {
    buffer: StreamBuffer,
    batcher: Option<ChunkBatcher>,
    config: FlowConfig,
    created_at: Instant,
    detailed_metrics: bool,
    on_metrics: Option<MetricsCallback>,
    bytes_delivered: u64,
    chunks_delivered: u64,
    consumer_errors: u64,
    batches_delivered: u64,
    backpressure_events: u64,
    recent_outcomes: VecDeque<bool>,
    last_delivery: Option<Instant>,
}

impl FlowController {
    /// `batcher_config` of `None` disables batching entirely: every popped
    /// chunk is delivered to the consumer on its own, per spec's "owns a
    /// StreamBuffer and optional ChunkBatcher."
    pub fn new(
        config: FlowConfig,
        batcher_config: Option<BatcherConfig>,
        detailed_metrics: bool,
        on_metrics: Option<MetricsCallback>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            buffer: StreamBuffer::new(config.buffer_capacity, config.overflow_strategy),
            batcher: batcher_config.map(ChunkBatcher::new),
            config,
            created_at: Instant::now(),
            detailed_metrics,
            on_metrics,
            bytes_delivered: 0,
            chunks_delivered: 0,
            consumer_errors: 0,
            batches_delivered: 0,
            backpressure_events: 0,
            recent_outcomes: VecDeque::with_capacity(CIRCUIT_WINDOW),
            last_delivery: None,
        })
    }

    /// Accept a chunk from the producer side. Buffers it; if the buffer
    /// overflows under [`OverflowStrategy::Block`] the caller must wait and
    /// retry (typically by yielding to the consumer-drain loop first).
    /// Counts a `backpressure_events` hit whenever the fill ratio crosses
    /// the threshold after this push, regardless of whether it was enqueued.
    pub fn offer(&mut self, chunk: StreamChunk) -> PushOutcome {
        let outcome = self.buffer.push(chunk);
        if self.backpressure_active() {
            self.backpressure_events += 1;
        }
        outcome
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn fill_ratio(&self) -> f64 {
        self.buffer.fill_ratio()
    }

    pub fn backpressure_active(&self) -> bool {
        self.buffer.fill_ratio() >= self.config.backpressure_threshold
    }

    /// Drain everything currently buffered, delivering to `deliver` either
    /// through the batcher (when enabled) or one chunk at a time (when not).
    /// Call this from the stream's single consumer-side task loop, woken on
    /// buffer-not-empty or batch-timeout.
    pub fn drain(&mut self, now: Instant, deliver: &mut ConsumerCallback) -> Result<(), Error> {
        while !self.buffer.is_empty() {
            if self.rate_limited(now) {
                // Not enough time has elapsed since the last delivery; stop
                // draining without touching the buffer and let the caller's
                // timer wake it again later.
                break;
            }
            let chunk = self.buffer.pop().expect("buffer non-empty, just checked");
            match self.batcher.as_mut() {
                Some(batcher) => {
                    if let Some(batch) = batcher.push(chunk, now) {
                        self.deliver_chunks(batch.chunks, now, deliver)?;
                    }
                }
                None => self.deliver_chunks(vec![chunk], now, deliver)?,
            }
        }
        let timed_out = self.batcher.as_mut().and_then(|b| b.check_timeout(now));
        if let Some(batch) = timed_out {
            self.deliver_chunks(batch.chunks, now, deliver)?;
        }
        Ok(())
    }

    fn rate_limited(&self, now: Instant) -> bool {
        match (self.config.min_delivery_interval, self.last_delivery) {
            (Some(min_interval), Some(last)) => now.duration_since(last) < min_interval,
            _ => false,
        }
    }

    /// Force out whatever the batcher is holding, e.g. on stream completion
    /// or cancellation, bypassing the size/timeout triggers. A no-op when
    /// batching is disabled, since nothing is ever held back.
    pub fn flush(&mut self, now: Instant, deliver: &mut ConsumerCallback) -> Result<(), Error> {
        let flushed = self.batcher.as_mut().and_then(ChunkBatcher::flush);
        if let Some(batch) = flushed {
            self.deliver_chunks(batch.chunks, now, deliver)?;
        }
        Ok(())
    }

    fn deliver_chunks(
        &mut self,
        chunks: Vec<StreamChunk>,
        now: Instant,
        deliver: &mut ConsumerCallback,
    ) -> Result<(), Error> {
        self.last_delivery = Some(now);
        self.batches_delivered += 1;
        for chunk in chunks {
            self.bytes_delivered += chunk.content.len() as u64;
            let outcome = deliver(chunk);
            self.chunks_delivered += 1;
            self.record_outcome(outcome.is_ok());
            if let Err(err) = outcome {
                self.consumer_errors += 1;
                if self.circuit_open() {
                    return Err(Error::Consumer(format!(
                        "consumer failing persistently, aborting stream: {err}"
                    )));
                }
            }
        }
        if self.detailed_metrics && self.on_metrics.is_some() {
            // Build the snapshot before borrowing `on_metrics` mutably —
            // `backpressure_active()` needs an immutable `&self`.
            let metrics_snapshot = self.metrics(now);
            if let Some(on_metrics) = self.on_metrics.as_mut() {
                on_metrics(&metrics_snapshot);
            }
        }
        Ok(())
    }

    fn record_outcome(&mut self, ok: bool) {
        if self.recent_outcomes.len() == CIRCUIT_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(ok);
    }

    /// Whether consumer failures over the trailing window exceed the
    /// circuit-breaker threshold. Requires a full window so a stream's first
    /// few chunks can't trip it on a single early error.
    fn circuit_open(&self) -> bool {
        if self.recent_outcomes.len() < CIRCUIT_WINDOW {
            return false;
        }
        let failures = self.recent_outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent_outcomes.len() as f64 >= CIRCUIT_THRESHOLD
    }

    pub fn metrics(&self, now: Instant) -> FlowMetrics {
        snapshot(
            &self.buffer,
            self.bytes_delivered,
            self.chunks_delivered,
            self.consumer_errors,
            self.batches_delivered,
            self.backpressure_events,
            self.backpressure_active(),
            self.created_at,
            now,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn snapshot(
    buffer: &StreamBuffer,
    bytes: u64,
    chunks_delivered: u64,
    consumer_errors: u64,
    batches_delivered: u64,
    backpressure_events: u64,
    backpressure_active: bool,
    created_at: Instant,
    now: Instant,
) -> FlowMetrics {
    let stats = buffer.stats();
    let elapsed = now.saturating_duration_since(created_at);
    let avg_batch_size = if batches_delivered == 0 {
        0.0
    } else {
        chunks_delivered as f64 / batches_delivered as f64
    };
    let throughput_cps = if elapsed.as_secs_f64() == 0.0 {
        0.0
    } else {
        chunks_delivered as f64 / elapsed.as_secs_f64()
    };
    FlowMetrics {
        buffer_fill_ratio: buffer.fill_ratio(),
        buffer_pushed: stats.pushed,
        buffer_popped: stats.popped,
        buffer_dropped: stats.dropped,
        bytes,
        chunks_delivered,
        consumer_errors,
        batches_delivered,
        backpressure_active,
        backpressure_events,
        avg_batch_size,
        throughput_cps,
        duration_ms: elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_sink() -> ConsumerCallback {
        Box::new(|_chunk| Ok(()))
    }

    fn config() -> (FlowConfig, BatcherConfig) {
        (
            FlowConfig {
                buffer_capacity: 16,
                overflow_strategy: OverflowStrategy::Drop,
                backpressure_threshold: 0.5,
                min_delivery_interval: None,
            },
            BatcherConfig {
                adaptive: false,
                initial_target_size: 2,
                ..BatcherConfig::default()
            },
        )
    }

    fn controller(cfg: FlowConfig, batcher_cfg: BatcherConfig) -> FlowController {
        FlowController::new(cfg, Some(batcher_cfg), false, None).unwrap()
    }

    #[test]
    fn rejects_invalid_backpressure_threshold() {
        let (mut cfg, batcher_cfg) = config();
        cfg.backpressure_threshold = 0.0;
        assert!(FlowController::new(cfg, Some(batcher_cfg), false, None).is_err());
    }

    #[test]
    fn delivers_all_offered_chunks_in_order() {
        let (cfg, batcher_cfg) = config();
        let mut fc = controller(cfg, batcher_cfg);
        fc.offer(StreamChunk::text("a"));
        fc.offer(StreamChunk::text("b"));
        fc.offer(StreamChunk::stop());

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut deliver: ConsumerCallback = Box::new(move |chunk| {
            sink.lock().unwrap().push(chunk.content);
            Ok(())
        });

        fc.drain(Instant::now(), &mut deliver).unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec!["a", "b", ""]);
    }

    #[test]
    fn backpressure_active_once_fill_ratio_crosses_threshold() {
        let (cfg, batcher_cfg) = config();
        let mut fc = controller(cfg, batcher_cfg);
        for _ in 0..9 {
            fc.offer(StreamChunk::text("x"));
        }
        assert!(fc.backpressure_active());
        assert!(fc.metrics(Instant::now()).backpressure_events > 0);
    }

    #[test]
    fn circuit_breaker_aborts_after_majority_consumer_errors() {
        let (cfg, batcher_cfg) = config();
        let mut fc = controller(cfg, batcher_cfg);
        for _ in 0..30 {
            fc.offer(StreamChunk::text("x"));
        }
        let mut calls = 0;
        let mut deliver: ConsumerCallback = Box::new(move |_chunk| {
            calls += 1;
            if calls % 2 == 0 {
                Err(Error::Consumer("boom".into()))
            } else {
                Ok(())
            }
        });
        let result = fc.drain(Instant::now(), &mut deliver);
        assert!(result.is_err());
    }

    #[test]
    fn flush_delivers_partial_batch() {
        let (cfg, batcher_cfg) = config();
        let mut fc = controller(cfg, batcher_cfg);
        fc.offer(StreamChunk::text("solo"));
        let mut sink = ok_sink();
        fc.drain(Instant::now(), &mut sink).unwrap();
        // target_size 2, one chunk buffered: nothing delivered yet via drain.
        assert_eq!(fc.metrics(Instant::now()).chunks_delivered, 0);
        fc.flush(Instant::now(), &mut sink).unwrap();
        assert_eq!(fc.metrics(Instant::now()).chunks_delivered, 1);
    }

    #[test]
    fn disabling_batching_delivers_each_chunk_immediately() {
        let (cfg, _batcher_cfg) = config();
        let mut fc = FlowController::new(cfg, None, false, None).unwrap();
        fc.offer(StreamChunk::text("a"));
        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut deliver: ConsumerCallback = Box::new(move |chunk| {
            sink.lock().unwrap().push(chunk.content);
            Ok(())
        });
        // Unlike the batched case (target_size 2), a single chunk delivers
        // immediately with no batcher holding it back.
        fc.drain(Instant::now(), &mut deliver).unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn metrics_track_bytes_and_avg_batch_size() {
        let (cfg, batcher_cfg) = config();
        let mut fc = controller(cfg, batcher_cfg);
        fc.offer(StreamChunk::text("ab"));
        fc.offer(StreamChunk::text("cd"));
        let mut sink = ok_sink();
        fc.drain(Instant::now(), &mut sink).unwrap();
        let metrics = fc.metrics(Instant::now());
        assert_eq!(metrics.bytes, 4);
        assert!((metrics.avg_batch_size - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn detailed_metrics_invokes_on_metrics_callback() {
        let (cfg, batcher_cfg) = config();
        let calls = std::sync::Arc::new(std::sync::Mutex::new(0u32));
        let calls_sink = calls.clone();
        let on_metrics: MetricsCallback = Box::new(move |_metrics| {
            *calls_sink.lock().unwrap() += 1;
        });
        let mut fc = FlowController::new(cfg, Some(batcher_cfg), true, Some(on_metrics)).unwrap();
        fc.offer(StreamChunk::text("a"));
        fc.offer(StreamChunk::text("b"));
        let mut sink = ok_sink();
        fc.drain(Instant::now(), &mut sink).unwrap();
        assert!(*calls.lock().unwrap() > 0);
    }

    #[test]
    fn on_metrics_not_invoked_without_detailed_metrics() {
        let (cfg, batcher_cfg) = config();
        let calls = std::sync::Arc::new(std::sync::Mutex::new(0u32));
        let calls_sink = calls.clone();
        let on_metrics: MetricsCallback = Box::new(move |_metrics| {
            *calls_sink.lock().unwrap() += 1;
        });
        let mut fc = FlowController::new(cfg, Some(batcher_cfg), false, Some(on_metrics)).unwrap();
        fc.offer(StreamChunk::text("a"));
        fc.offer(StreamChunk::text("b"));
        let mut sink = ok_sink();
        fc.drain(Instant::now(), &mut sink).unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
