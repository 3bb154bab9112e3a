//! End-to-end orchestration of one streaming HTTP request: opens the POST,
//! feeds the response body through [`SseParser`], runs the provider's
//! chunk parser, and pushes canonical chunks through an optional
//! [`FlowController`] to the consumer. Owns cancellation and, when
//! enabled, hands transport failures to [`StreamRecovery`] for reconnect.

use crate::error::Error;
use crate::flow::{ConsumerCallback, FlowConfig, FlowController};
use crate::options::StreamOptions;
use crate::recovery::{RecoveryConfig, StreamRecovery};
use crate::sse::SseParser;
use crate::types::{ParsedChunk, StreamChunk, StreamContext, StreamId};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Coarse lifecycle state of a stream, as exposed by `get_stream_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StreamStatus {
    Initialized,
    Connecting,
    Streaming,
    Recovering,
    Draining,
    Completed,
    Errored,
    Cancelled,
}

/// Bounded deadline the consumer gets to drain already-buffered chunks
/// after a cancellation before the coordinator gives up on it.
const CANCEL_DRAIN_DEADLINE: Duration = Duration::from_millis(250);

/// Handle returned by [`StreamingCoordinator::start_stream`]. Cheap to
/// clone-by-reference-counting internals; used by
/// [`crate::engine::StreamingEngine`]'s registry for cancellation and
/// status lookups.
pub struct StreamHandle {
    pub stream_id: StreamId,
    cancel_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<StreamStatus>,
}

impl StreamHandle {
    /// Idempotent: repeated calls after the first are no-ops.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn status(&self) -> StreamStatus {
        *self.status_rx.borrow()
    }
}

/// Bridges a popped/batched chunk to the consumer, either directly (basic
/// mode) or through a [`FlowController`] (advanced mode, when flow control
/// or batching is enabled).
enum Delivery {
    Direct(ConsumerCallback),
    Flow(Box<FlowController>, ConsumerCallback),
}

impl Delivery {
    fn offer(&mut self, chunk: StreamChunk, now: Instant) -> Result<(), Error> {
        match self {
            Self::Direct(consumer) => consumer(chunk),
            Self::Flow(flow, consumer) => {
                flow.offer(chunk);
                flow.drain(now, consumer)
            }
        }
    }

    fn finish(&mut self, now: Instant) -> Result<(), Error> {
        if let Self::Flow(flow, consumer) = self {
            flow.flush(now, consumer)?;
        }
        Ok(())
    }
}

/// Outcome of one HTTP attempt's read loop.
enum AttemptOutcome {
    /// Saw `[DONE]` or the body closed cleanly.
    Completed,
    /// A transport/HTTP-level failure; recovery (if enabled) decides next.
    Failed(Error),
    Cancelled,
}

pub struct StreamingCoordinator;

impl StreamingCoordinator {
    /// Start a stream. Spawns a dedicated `tokio::task` that owns the
    /// request's entire lifecycle and returns immediately with a handle the
    /// caller can poll or cancel.
    pub fn start_stream(
        http: reqwest::Client,
        url: String,
        body: serde_json::Value,
        headers: HeaderMap,
        consumer_callback: ConsumerCallback,
        mut options: StreamOptions,
    ) -> Result<StreamHandle, Error> {
        options.validate()?;
        let stream_id = StreamId::next();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(StreamStatus::Initialized);

        tokio::spawn(run_stream(
            http,
            url,
            body,
            headers,
            consumer_callback,
            options,
            stream_id,
            cancel_rx,
            status_tx,
        ));

        Ok(StreamHandle {
            stream_id,
            cancel_tx,
            status_rx,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    http: reqwest::Client,
    url: String,
    body: serde_json::Value,
    headers: HeaderMap,
    consumer_callback: ConsumerCallback,
    mut options: StreamOptions,
    stream_id: StreamId,
    mut cancel_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<StreamStatus>,
) {
    let mut context = StreamContext::new(stream_id, options.provider.clone());
    context.flow_control = options.enable_flow_control;
    context.batching = options.enable_batching;
    context.detailed_metrics = options.track_detailed_metrics;

    let mut transform_chunk_fn = options.transform_chunk_fn.take();
    let on_metrics = options.on_metrics.take();

    let parse_chunk_fn = match &options.parse_chunk_fn {
        Some(f) => f,
        None => {
            tracing::error!(%stream_id, "start_stream called without parse_chunk_fn");
            return;
        }
    };

    let mut recovery = options.stream_recovery.then(|| {
        StreamRecovery::init_recovery(RecoveryConfig::default())
    });

    let mut delivery = if options.needs_advanced_pipeline() {
        let flow_config = FlowConfig {
            buffer_capacity: options.buffer_capacity,
            overflow_strategy: options.overflow_strategy,
            backpressure_threshold: options.backpressure_threshold,
            min_delivery_interval: options.rate_limit,
        };
        let batcher_config = options.enable_batching.then(|| options.batch_config.clone());
        match FlowController::new(
            flow_config,
            batcher_config,
            options.track_detailed_metrics,
            on_metrics,
        ) {
            Ok(fc) => Delivery::Flow(Box::new(fc), consumer_callback),
            Err(err) => {
                tracing::error!(%stream_id, error = %err, "invalid flow control options");
                return;
            }
        }
    } else {
        Delivery::Direct(consumer_callback)
    };

    let _ = status_tx.send(StreamStatus::Connecting);
    tracing::info!(%stream_id, url = %url, "starting stream");

    let mut parser = SseParser::new();
    let final_status;

    loop {
        let _ = status_tx.send(StreamStatus::Streaming);
        let outcome = run_attempt(
            &http,
            &url,
            &body,
            &headers,
            options.timeout,
            &mut parser,
            parse_chunk_fn,
            options.validate_chunk_fn.as_deref(),
            transform_chunk_fn.as_mut(),
            &mut delivery,
            recovery.as_mut(),
            &mut context,
            &mut cancel_rx,
        )
        .await;

        match outcome {
            AttemptOutcome::Completed => {
                let now = Instant::now();
                let _ = delivery.offer(StreamChunk::stop(), now);
                let _ = delivery.finish(now);
                if let Some(r) = recovery.as_mut() {
                    r.complete_stream();
                }
                final_status = StreamStatus::Completed;
                break;
            }
            AttemptOutcome::Cancelled => {
                let now = Instant::now();
                let _ = delivery.offer(StreamChunk::cancelled(), now);
                let _ = delivery.finish(now);
                final_status = StreamStatus::Cancelled;
                break;
            }
            AttemptOutcome::Failed(err) => {
                let recoverable = recovery
                    .as_mut()
                    .map(|r| r.record_error(&err))
                    .unwrap_or(false);

                if !recoverable {
                    let now = Instant::now();
                    let _ = delivery.offer(StreamChunk::error(&err), now);
                    let _ = delivery.finish(now);
                    final_status = StreamStatus::Errored;
                    tracing::error!(%stream_id, error = %err, "stream failed, not recoverable");
                    break;
                }

                let _ = status_tx.send(StreamStatus::Recovering);
                let backoff = recovery.as_mut().unwrap().next_backoff();
                tracing::warn!(%stream_id, error = %err, backoff_ms = backoff.as_millis() as u64, "reconnecting");

                let cancelled = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => true,
                    () = tokio::time::sleep(backoff) => false,
                };
                if cancelled {
                    let now = Instant::now();
                    let _ = delivery.offer(StreamChunk::cancelled(), now);
                    let _ = delivery.finish(now);
                    final_status = StreamStatus::Cancelled;
                    break;
                }
                parser.reset();
                recovery.as_mut().unwrap().mark_resumed();
            }
        }
    }

    let _ = status_tx.send(final_status);
    tracing::info!(%stream_id, status = ?final_status, "stream finished");
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    http: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    headers: &HeaderMap,
    timeout: Duration,
    parser: &mut SseParser,
    parse_chunk_fn: &crate::types::ParseChunkFn,
    validate_chunk_fn: Option<&(dyn Fn(&StreamChunk) -> bool + Send + Sync)>,
    mut transform_chunk_fn: Option<&mut crate::types::TransformChunkFn>,
    delivery: &mut Delivery,
    mut recovery: Option<&mut StreamRecovery>,
    context: &mut StreamContext,
    cancel_rx: &mut watch::Receiver<bool>,
) -> AttemptOutcome {
    let send_fut = http
        .post(url)
        .headers(headers.clone())
        .json(body)
        .send();

    let response = tokio::select! {
        biased;
        _ = cancel_rx.changed() => return AttemptOutcome::Cancelled,
        result = tokio::time::timeout(timeout, send_fut) => result,
    };

    let response = match response {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => return AttemptOutcome::Failed(Error::Transport(err)),
        Err(_elapsed) => return AttemptOutcome::Failed(Error::Timeout(timeout)),
    };

    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return AttemptOutcome::Failed(Error::from_status(status.as_u16(), message));
    }

    let mut body_stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_rx.changed() => return AttemptOutcome::Cancelled,
            item = tokio::time::timeout(timeout, body_stream.next()) => item,
        };

        let item = match next {
            Ok(item) => item,
            Err(_elapsed) => return AttemptOutcome::Failed(Error::Timeout(timeout)),
        };

        let Some(chunk_result) = item else {
            if let Some(event) = parser.flush() {
                if process_event(
                    &event,
                    parse_chunk_fn,
                    validate_chunk_fn,
                    match transform_chunk_fn.as_mut() {
                        Some(b) => Some(&mut ***b as &mut (dyn FnMut(StreamChunk) -> crate::types::TransformOutcome + Send)),
                        None => None,
                    },
                    delivery,
                    recovery.as_deref_mut(),
                    context,
                ) {
                    return AttemptOutcome::Completed;
                }
            }
            return AttemptOutcome::Completed;
        };

        let bytes = match chunk_result {
            Ok(bytes) => bytes,
            Err(err) => return AttemptOutcome::Failed(Error::Transport(err)),
        };
        context.record_chunk(bytes.len());

        for event in parser.parse_chunk(&bytes) {
            if process_event(
                &event,
                parse_chunk_fn,
                validate_chunk_fn,
                match transform_chunk_fn.as_mut() {
                    Some(b) => Some(&mut ***b as &mut (dyn FnMut(StreamChunk) -> crate::types::TransformOutcome + Send)),
                    None => None,
                },
                delivery,
                recovery.as_deref_mut(),
                context,
            ) {
                return AttemptOutcome::Completed;
            }
        }
    }
}

/// Handle one parsed SSE event. Returns `true` when this event signals
/// end-of-stream (the `[DONE]` sentinel) and the read loop should stop.
fn process_event(
    event: &crate::types::SseEvent,
    parse_chunk_fn: &crate::types::ParseChunkFn,
    validate_chunk_fn: Option<&(dyn Fn(&StreamChunk) -> bool + Send + Sync)>,
    transform_chunk_fn: Option<&mut (dyn FnMut(StreamChunk) -> crate::types::TransformOutcome + Send)>,
    delivery: &mut Delivery,
    recovery: Option<&mut StreamRecovery>,
    context: &mut StreamContext,
) -> bool {
    if event.is_done_sentinel() {
        return true;
    }

    match parse_chunk_fn(&event.data) {
        Ok(ParsedChunk::Chunk(chunk)) => {
            if let Some(validate) = validate_chunk_fn {
                if !validate(&chunk) {
                    tracing::debug!("dropping chunk that failed validate_chunk_fn");
                    return false;
                }
            }

            let chunk = match transform_chunk_fn {
                Some(transform) => match transform(chunk) {
                    crate::types::TransformOutcome::Keep(chunk) => chunk,
                    crate::types::TransformOutcome::Skip => {
                        tracing::debug!("transform_chunk_fn requested skip");
                        return false;
                    }
                },
                None => chunk,
            };

            if let Some(recovery) = recovery {
                if let Some(id) = chunk.id.as_deref() {
                    if recovery.is_duplicate(id) {
                        tracing::debug!(id, "dropping duplicate chunk seen pre-reconnect");
                        return false;
                    }
                }
                recovery.record_chunk(chunk.id.as_deref());
            }

            let _ = delivery.offer(chunk, Instant::now());
        }
        Ok(ParsedChunk::Done | ParsedChunk::Ignored) => {}
        Err(err) => {
            context.record_error();
            tracing::debug!(error = %err, "parse_chunk_fn failed for event, skipping");
        }
    }
    false
}
