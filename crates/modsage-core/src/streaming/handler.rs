//! Progressive stream consumption with recovery and progress reporting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt, stream};
use modsage_abstraction::ServerError;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sanitize::{LineEndingNormalizer, strip_control_chars};
use super::types::{StreamCallbacks, StreamOptions, StreamOutcome, StreamProgress, StreamingContext};
use crate::error::StreamError;
use crate::metrics::{MetricsSink, NoopMetrics, StreamMetric, emit_stream};

#[derive(Debug, Default)]
struct Tally {
    content: String,
    chunks: usize,
    bytes: usize,
    last_progress: Option<Instant>,
}

/// Consumes chunk streams one chunk at a time, in source order.
#[derive(Clone)]
pub struct StreamingHandler {
    options: StreamOptions,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for StreamingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingHandler").field("options", &self.options).finish_non_exhaustive()
    }
}

impl StreamingHandler {
    /// Creates a handler with the given options.
    #[must_use]
    pub fn new(options: StreamOptions) -> Self {
        Self { options, metrics: Arc::new(NoopMetrics) }
    }

    /// Sets the sink receiving one `StreamMetric` per stream.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The handler's options.
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Consumes `chunks` to completion.
    ///
    /// Each chunk is sanitized, written to the sink, passed to `on_chunk` and
    /// counted toward progress. Recoverable errors are retried with
    /// exponential backoff while recovery is enabled and retries remain.
    /// The sink is flushed on every exit path and one metric is emitted.
    ///
    /// # Errors
    /// `Cancelled` when `cancel` fires, `Server` for an unrecoverable chunk
    /// error, `Sink` when writing to the sink fails.
    pub async fn process_stream<S>(
        &self,
        chunks: S,
        callbacks: &mut StreamCallbacks<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, StreamError>
    where
        S: Stream<Item = Result<String, ServerError>> + Send,
    {
        let mut ctx = StreamingContext::new();
        let mut tally = Tally::default();
        debug!(session_id = %ctx.session_id, "Stream started");

        let mut result = self.consume(chunks, callbacks, cancel, &mut ctx, &mut tally).await;

        if let Some(sink) = callbacks.sink.as_mut() {
            if let Err(e) = sink.flush().await {
                if result.is_ok() {
                    result = Err(StreamError::Sink(e));
                } else {
                    warn!(session_id = %ctx.session_id, error = %e, "Failed to flush stream sink");
                }
            }
        }

        let duration = ctx.started.elapsed();
        let metric = self.metric(&ctx, &tally, duration, result.as_ref().err());
        emit_stream(self.metrics.as_ref(), &metric);

        match result {
            Ok(()) => {
                if let Some(on_progress) = callbacks.on_progress.as_mut() {
                    on_progress(&StreamProgress {
                        session_id: ctx.session_id,
                        chunks_processed: tally.chunks,
                        bytes_processed: tally.bytes,
                        elapsed: duration,
                        percent_complete: Some(100.0),
                        status: format!("Completed: {} chunks, {} bytes", tally.chunks, tally.bytes),
                    });
                }
                debug!(
                    session_id = %ctx.session_id,
                    chunks = tally.chunks,
                    bytes = tally.bytes,
                    retries = ctx.retry_count,
                    duration_ms = duration.as_millis(),
                    "Stream completed"
                );
                Ok(StreamOutcome { content: tally.content, metrics: metric, recovered_errors: ctx.errors })
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, chunks = tally.chunks, "Stream failed");
                Err(e)
            }
        }
    }

    async fn consume<S>(
        &self,
        chunks: S,
        callbacks: &mut StreamCallbacks<'_>,
        cancel: &CancellationToken,
        ctx: &mut StreamingContext,
        tally: &mut Tally,
    ) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<String, ServerError>> + Send,
    {
        let mut chunks = std::pin::pin!(chunks);
        let mut normalizer = LineEndingNormalizer::default();

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Cancelled),
                item = chunks.next() => item,
            };

            match item {
                None => break,
                Some(Ok(raw)) => {
                    let text = normalizer.push(&strip_control_chars(&raw));
                    self.deliver(&text, callbacks, ctx, tally).await?;
                }
                Some(Err(err)) => {
                    ctx.errors.push(err.to_string());
                    let recoverable = self.options.enable_error_recovery
                        && err.is_recoverable_in_stream()
                        && ctx.retry_count < self.options.max_retries;
                    if !recoverable {
                        return Err(StreamError::Server(err));
                    }

                    let delay = self.options.backoff(ctx.retry_count);
                    ctx.retry_count += 1;
                    warn!(
                        session_id = %ctx.session_id,
                        retry = ctx.retry_count,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Recovering from stream error"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(StreamError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(tail) = normalizer.finish() {
            self.deliver(tail, callbacks, ctx, tally).await?;
        }
        Ok(())
    }

    async fn deliver(
        &self,
        text: &str,
        callbacks: &mut StreamCallbacks<'_>,
        ctx: &StreamingContext,
        tally: &mut Tally,
    ) -> Result<(), StreamError> {
        if text.is_empty() {
            return Ok(());
        }

        tally.content.push_str(text);
        tally.chunks += 1;
        tally.bytes += text.len();

        if let Some(sink) = callbacks.sink.as_mut() {
            sink.write_all(text.as_bytes()).await?;
        }
        if let Some(on_chunk) = callbacks.on_chunk.as_mut() {
            on_chunk(text);
        }

        let due = tally.last_progress.is_none_or(|at| at.elapsed() >= self.options.progress_interval);
        if due {
            if let Some(on_progress) = callbacks.on_progress.as_mut() {
                tally.last_progress = Some(Instant::now());
                on_progress(&StreamProgress {
                    session_id: ctx.session_id,
                    chunks_processed: tally.chunks,
                    bytes_processed: tally.bytes,
                    elapsed: ctx.started.elapsed(),
                    percent_complete: None,
                    status: format!("Streaming: {} chunks, {} bytes", tally.chunks, tally.bytes),
                });
            }
        }
        Ok(())
    }

    fn metric(
        &self,
        ctx: &StreamingContext,
        tally: &Tally,
        duration: Duration,
        error: Option<&StreamError>,
    ) -> StreamMetric {
        let secs = duration.as_secs_f64();
        StreamMetric {
            session_id: ctx.session_id,
            recorded_at: Utc::now(),
            duration,
            chunks: tally.chunks,
            bytes: tally.bytes,
            errors: ctx.errors.len() + usize::from(matches!(error, Some(StreamError::Sink(_)))),
            retries: ctx.retry_count,
            average_chunk_size: if tally.chunks == 0 {
                0.0
            } else {
                tally.bytes as f64 / tally.chunks as f64
            },
            throughput_bytes_per_sec: if secs > 0.0 { tally.bytes as f64 / secs } else { 0.0 },
            success: error.is_none(),
            error: error.map(ToString::to_string),
        }
    }
}

/// Replays `text` as a chunk stream of `chunk_size` characters with `delay` between chunks.
pub fn replay_chunks(
    text: &str,
    chunk_size: usize,
    delay: Duration,
) -> impl Stream<Item = Result<String, ServerError>> + Send + 'static {
    let chars: Vec<char> = text.chars().collect();
    let pieces: Vec<String> =
        chars.chunks(chunk_size.max(1)).map(|piece| piece.iter().collect()).collect();

    stream::iter(pieces.into_iter().enumerate()).then(move |(index, piece)| async move {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(piece)
    })
}
