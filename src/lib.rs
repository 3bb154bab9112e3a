//! Provider-agnostic streaming pipeline for LLM HTTP APIs.
//!
//! Ingests Server-Sent Events from an HTTP stream, parses provider-specific
//! chunk payloads through a caller-supplied hook, optionally batches and
//! rate-limits delivery, and survives slow consumers and transient network
//! failures via a bounded buffer and resumable-stream recovery.
//!
//! Concrete provider adapters (request/response schemas, auth headers,
//! endpoint URLs) are out of scope; callers supply a `parse_chunk_fn`.
//!
//! # Example
//! ```no_run
//! use futures::StreamExt;
//! use llm_stream_core::options::{StreamOptions, StreamPreset};
//! use llm_stream_core::engine::StreamingEngine;
//! use llm_stream_core::types::ParsedChunk;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), llm_stream_core::Error> {
//!     let engine = StreamingEngine::new(reqwest::Client::new());
//!     let options = StreamOptions::for_preset(StreamPreset::LowLatency)
//!         .with_parse_chunk_fn(Box::new(|data: &str| {
//!             Ok(ParsedChunk::Chunk(llm_stream_core::types::StreamChunk::text(data)))
//!         }));
//!
//!     let mut stream = engine.simple_stream(
//!         "https://example.invalid/v1/chat",
//!         serde_json::json!({"messages": []}),
//!         reqwest::header::HeaderMap::new(),
//!         options,
//!     )?;
//!
//!     while let Some(chunk) = stream.next().await {
//!         let chunk = chunk?;
//!         print!("{}", chunk.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod buffer;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod flow;
pub mod options;
pub mod recovery;
pub mod sse;
pub mod types;

pub use error::Error;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
