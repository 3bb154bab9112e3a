//! Single entry point for the streaming pipeline: examines options to pick
//! basic vs advanced mode, tracks active streams in a process-wide
//! registry, and exposes `start_stream`/`cancel_stream`/`get_stream_status`
//! plus the `simple_stream` `Stream`-adapter convenience.

use crate::coordinator::{StreamHandle, StreamStatus, StreamingCoordinator};
use crate::error::Error;
use crate::flow::ConsumerCallback;
use crate::options::StreamOptions;
use crate::types::{ParsedChunk, StreamChunk, StreamId};
use dashmap::DashMap;
use futures::Stream;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Facade over [`StreamingCoordinator`]. Cheap to clone: internals are
/// reference-counted, so callers typically hold one `StreamingEngine` per
/// process and clone it per task.
#[derive(Clone)]
pub struct StreamingEngine {
    http: reqwest::Client,
    registry: Arc<DashMap<StreamId, StreamHandle>>,
}

impl StreamingEngine {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            registry: Arc::new(DashMap::new()),
        }
    }

    pub fn start_stream(
        &self,
        url: impl Into<String>,
        body: serde_json::Value,
        headers: HeaderMap,
        consumer_callback: ConsumerCallback,
        options: StreamOptions,
    ) -> Result<StreamId, Error> {
        let handle = StreamingCoordinator::start_stream(
            self.http.clone(),
            url.into(),
            body,
            headers,
            consumer_callback,
            options,
        )?;
        let stream_id = handle.stream_id;
        self.registry.insert(stream_id, handle);
        Ok(stream_id)
    }

    pub fn cancel_stream(&self, stream_id: StreamId) -> Result<(), Error> {
        match self.registry.get(&stream_id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(Error::StreamNotFound(stream_id.to_string())),
        }
    }

    pub fn get_stream_status(&self, stream_id: StreamId) -> Result<StreamStatus, Error> {
        self.registry
            .get(&stream_id)
            .map(|handle| handle.status())
            .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))
    }

    /// Drop registry entries whose streams have reached a terminal status.
    /// The registry otherwise grows unbounded across a long-lived engine;
    /// callers can run this periodically or after `get_stream_status`
    /// reports a terminal state.
    pub fn reap_finished(&self) {
        self.registry.retain(|_, handle| {
            !matches!(
                handle.status(),
                StreamStatus::Completed | StreamStatus::Errored | StreamStatus::Cancelled
            )
        });
    }

    pub fn active_stream_count(&self) -> usize {
        self.registry.len()
    }

    /// Convenience wrapper adapting the callback-based [`Self::start_stream`]
    /// onto a pollable [`futures::Stream`], for callers that prefer
    /// `while let Some(chunk) = stream.next().await` over a callback.
    pub fn simple_stream(
        &self,
        url: impl Into<String>,
        body: serde_json::Value,
        headers: HeaderMap,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = Result<StreamChunk, Error>>, Error> {
        let (tx, rx) = mpsc::unbounded_channel::<Result<StreamChunk, Error>>();
        let callback: ConsumerCallback = Box::new(move |chunk| {
            let _ = tx.send(Ok(chunk));
            Ok(())
        });
        self.start_stream(url, body, headers, callback, options)?;
        Ok(UnboundedReceiverStream::new(rx))
    }
}

/// Build a [`crate::types::ParseChunkFn`] from a provider's raw JSON
/// shape via a closure that extracts a text delta and optional finish
/// reason. A thin convenience so callers don't hand-roll the `ParsedChunk`
/// dispatch for the common "one JSON object per event" provider shape.
pub fn json_text_delta_parser<F>(extract: F) -> crate::types::ParseChunkFn
where
    F: Fn(&serde_json::Value) -> Option<(String, Option<String>)> + Send + Sync + 'static,
{
    Box::new(move |data: &str| {
        let value: serde_json::Value = serde_json::from_str(data)?;
        match extract(&value) {
            Some((content, finish_reason)) => {
                let mut chunk = StreamChunk::text(content);
                chunk.finish_reason = finish_reason.map(|s| crate::types::FinishReason::parse(&s));
                Ok(ParsedChunk::Chunk(chunk))
            }
            None => Ok(ParsedChunk::Ignored),
        }
    })
}
