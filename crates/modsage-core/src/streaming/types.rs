//! Stream options, progress snapshots and per-stream context.

use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::metrics::StreamMetric;

/// Tuning for one `process_stream` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Minimum interval between progress notifications.
    pub progress_interval: Duration,
    /// Whether recoverable chunk errors are retried.
    pub enable_error_recovery: bool,
    /// Recoveries allowed per stream.
    pub max_retries: u32,
    /// Backoff base; retry `n` waits `base * 2^n`.
    pub retry_base_delay: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for StreamOptions {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            enable_error_recovery: config.enable_error_recovery,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

impl StreamOptions {
    /// Backoff before recovery number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_base_delay.saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }
}

/// Progress snapshot handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamProgress {
    /// Correlation id of the stream.
    pub session_id: Uuid,
    /// Chunks processed so far.
    pub chunks_processed: usize,
    /// Sanitized bytes processed so far.
    pub bytes_processed: usize,
    /// Time since the stream started.
    pub elapsed: Duration,
    /// `Some(100.0)` on completion; the total is unknown before that.
    pub percent_complete: Option<f64>,
    /// Human-readable status line.
    pub status: String,
}

/// Per-stream state, discarded when the stream ends.
#[derive(Debug, Clone)]
pub struct StreamingContext {
    /// Correlation id.
    pub session_id: Uuid,
    /// When processing started.
    pub started: Instant,
    /// Recoveries performed.
    pub retry_count: u32,
    /// Every error observed, in order.
    pub errors: Vec<String>,
}

impl StreamingContext {
    /// Starts a context with a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self { session_id: Uuid::new_v4(), started: Instant::now(), retry_count: 0, errors: Vec::new() }
    }
}

impl Default for StreamingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-supplied observers. All are optional.
#[derive(Default)]
pub struct StreamCallbacks<'a> {
    /// Invoked with each sanitized, non-empty fragment, in source order.
    pub on_chunk: Option<&'a mut (dyn FnMut(&str) + Send)>,
    /// Invoked with throttled progress snapshots and once at completion.
    pub on_progress: Option<&'a mut (dyn FnMut(&StreamProgress) + Send)>,
    /// Receives every fragment; flushed when the stream ends.
    pub sink: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
}

impl<'a> StreamCallbacks<'a> {
    /// Sets the per-fragment callback.
    #[must_use]
    pub fn on_chunk(mut self, callback: &'a mut (dyn FnMut(&str) + Send)) -> Self {
        self.on_chunk = Some(callback);
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn on_progress(mut self, callback: &'a mut (dyn FnMut(&StreamProgress) + Send)) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Sets the output sink.
    #[must_use]
    pub fn sink(mut self, sink: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Result of a completed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// The sanitized concatenation of every fragment.
    pub content: String,
    /// Completion metric, also sent to the metrics sink.
    pub metrics: StreamMetric,
    /// Errors that were recovered from.
    pub recovered_errors: Vec<String>,
}
