//! Option surface and presets for [`crate::engine::StreamingEngine`].
//!
//! Mirrors the teacher's `ClientBuilder`/`RequestBuilder` pattern: a plain
//! config struct with `Default`, a builder that sets fields fluently, and
//! an `from_env()` escape hatch for operators who'd rather tune via
//! environment variables than redeploy.

use crate::batcher::BatcherConfig;
use crate::buffer::OverflowStrategy;
use crate::error::Error;
use crate::flow::MetricsCallback;
use crate::types::{ParseChunkFn, TransformChunkFn, ValidateChunkFn};
use std::env;
use std::time::Duration;

/// Named bundles of defaults, chosen for a usage pattern rather than
/// tuned knob-by-knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPreset {
    /// Favor batch size over latency: wide buffer, aggressive batching.
    HighThroughput,
    /// Favor latency over batch size: small buffer, no batching.
    LowLatency,
    /// A middle ground suitable as a default; detailed metrics on.
    Balanced,
    /// Favor never losing a chunk over throughput; blocks rather than
    /// drops, and turns recovery on.
    Conservative,
}

/// Full option surface for one `start_stream` call. `parse_chunk_fn` is the
/// only field without a usable default — every other field has one, set by
/// [`StreamOptions::for_preset`] or [`StreamOptions::default`].
pub struct StreamOptions {
    pub parse_chunk_fn: Option<ParseChunkFn>,
    pub provider: Option<String>,
    pub timeout: Duration,
    pub recovery_id: Option<String>,
    pub stream_recovery: bool,
    pub transform_chunk_fn: Option<TransformChunkFn>,
    pub validate_chunk_fn: Option<ValidateChunkFn>,
    /// Periodic flow-metrics callback; only invoked when
    /// `track_detailed_metrics` is set.
    pub on_metrics: Option<MetricsCallback>,

    pub enable_flow_control: bool,
    pub buffer_capacity: usize,
    pub backpressure_threshold: f64,
    pub overflow_strategy: OverflowStrategy,
    pub rate_limit: Option<Duration>,

    pub enable_batching: bool,
    pub batch_config: BatcherConfig,

    pub track_detailed_metrics: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            parse_chunk_fn: None,
            provider: None,
            timeout: Duration::from_secs(300),
            recovery_id: None,
            stream_recovery: false,
            transform_chunk_fn: None,
            validate_chunk_fn: None,
            on_metrics: None,
            enable_flow_control: false,
            buffer_capacity: 100,
            backpressure_threshold: 0.8,
            overflow_strategy: OverflowStrategy::Drop,
            rate_limit: None,
            enable_batching: false,
            batch_config: BatcherConfig::default(),
            track_detailed_metrics: false,
        }
    }
}

impl StreamOptions {
    pub fn for_preset(preset: StreamPreset) -> Self {
        let base = Self::default();
        match preset {
            StreamPreset::HighThroughput => Self {
                enable_flow_control: true,
                buffer_capacity: 200,
                backpressure_threshold: 0.9,
                rate_limit: None,
                overflow_strategy: OverflowStrategy::Drop,
                enable_batching: true,
                batch_config: BatcherConfig {
                    initial_target_size: 10,
                    initial_timeout: Duration::from_millis(50),
                    adaptive: true,
                    ..BatcherConfig::default()
                },
                ..base
            },
            StreamPreset::LowLatency => Self {
                enable_flow_control: true,
                buffer_capacity: 20,
                backpressure_threshold: 0.7,
                rate_limit: None,
                overflow_strategy: OverflowStrategy::Drop,
                enable_batching: false,
                ..base
            },
            StreamPreset::Balanced => Self {
                enable_flow_control: true,
                buffer_capacity: 100,
                backpressure_threshold: 0.8,
                rate_limit: Some(Duration::from_millis(1)),
                overflow_strategy: OverflowStrategy::Drop,
                enable_batching: true,
                batch_config: BatcherConfig {
                    initial_target_size: 5,
                    initial_timeout: Duration::from_millis(25),
                    adaptive: true,
                    ..BatcherConfig::default()
                },
                track_detailed_metrics: true,
                ..base
            },
            StreamPreset::Conservative => Self {
                enable_flow_control: true,
                buffer_capacity: 50,
                backpressure_threshold: 0.6,
                rate_limit: Some(Duration::from_millis(2)),
                overflow_strategy: OverflowStrategy::Block,
                stream_recovery: true,
                track_detailed_metrics: true,
                ..base
            },
        }
    }

    /// Override preset/default fields from environment variables, in the
    /// spirit of the teacher's `ClientBuilder::from_env`. Unset variables
    /// leave the current value untouched; malformed ones are ignored.
    pub fn from_env(mut self) -> Self {
        if let Ok(raw) = env::var("LLM_STREAM_TIMEOUT_MS") {
            if let Ok(ms) = raw.parse::<u64>() {
                self.timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(raw) = env::var("LLM_STREAM_BUFFER_CAPACITY") {
            if let Ok(cap) = raw.parse::<usize>() {
                self.buffer_capacity = cap;
            }
        }
        if let Ok(raw) = env::var("LLM_STREAM_PRESET") {
            if let Some(preset) = parse_preset(&raw) {
                let preserved_timeout = self.timeout;
                let preserved_capacity = self.buffer_capacity;
                self = Self::for_preset(preset);
                self.timeout = preserved_timeout;
                self.buffer_capacity = preserved_capacity;
            }
        }
        self
    }

    pub fn with_parse_chunk_fn(mut self, f: ParseChunkFn) -> Self {
        self.parse_chunk_fn = Some(f);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stream_recovery(mut self, enabled: bool) -> Self {
        self.stream_recovery = enabled;
        self
    }

    pub fn with_on_metrics(mut self, f: MetricsCallback) -> Self {
        self.on_metrics = Some(f);
        self
    }

    /// Whether any advanced (flow-control or batching) option is set,
    /// which decides basic-mode vs advanced-mode in the engine.
    pub fn needs_advanced_pipeline(&self) -> bool {
        self.enable_flow_control || self.enable_batching
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.parse_chunk_fn.is_none() {
            return Err(Error::InvalidOption("parse_chunk_fn is required".into()));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) || self.backpressure_threshold <= 0.0 {
            return Err(Error::InvalidOption(
                "backpressure_threshold must be in (0, 1]".into(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::InvalidOption("buffer_capacity must be >= 1".into()));
        }
        Ok(())
    }
}

fn parse_preset(raw: &str) -> Option<StreamPreset> {
    match raw.to_ascii_lowercase().as_str() {
        "high_throughput" => Some(StreamPreset::HighThroughput),
        "low_latency" => Some(StreamPreset::LowLatency),
        "balanced" => Some(StreamPreset::Balanced),
        "conservative" => Some(StreamPreset::Conservative),
        _ => None,
    }
}
