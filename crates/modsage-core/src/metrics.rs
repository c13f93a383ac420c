//! Metric records and the passive sinks that receive them.
//!
//! Components emit one record per preprocessing run, stream and request.
//! Recording never affects control flow: sink failures are logged and dropped
//! by the `emit_*` helpers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use modsage_abstraction::TaskType;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors a sink may report.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The sink cannot accept records right now.
    #[error("Metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Emitted once per preprocessing run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessingMetric {
    /// When the run finished.
    pub recorded_at: DateTime<Utc>,
    /// Task the content was prepared for.
    pub task: TaskType,
    /// Token estimate of the unfiltered rendering.
    pub original_tokens: usize,
    /// Token estimate of the final content.
    pub final_tokens: usize,
    /// `final_tokens / original_tokens`.
    pub compression_ratio: f64,
    /// Number of sections built.
    pub sections: usize,
    /// Wall time spent.
    pub duration: Duration,
}

/// Emitted once per processed stream, on success or failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetric {
    /// Correlation id of the stream.
    pub session_id: Uuid,
    /// When the stream ended.
    pub recorded_at: DateTime<Utc>,
    /// Wall time from first poll to completion.
    pub duration: Duration,
    /// Chunks processed.
    pub chunks: usize,
    /// Bytes processed after sanitization.
    pub bytes: usize,
    /// Errors observed, recovered or not.
    pub errors: usize,
    /// Recoveries performed.
    pub retries: u32,
    /// `bytes / chunks`.
    pub average_chunk_size: f64,
    /// `bytes / duration` in bytes per second.
    pub throughput_bytes_per_sec: f64,
    /// Whether the stream completed.
    pub success: bool,
    /// Terminal error message, if the stream failed.
    pub error: Option<String>,
}

/// Emitted once per `analyze` / `analyze_streaming` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetric {
    /// When the request finished.
    pub recorded_at: DateTime<Utc>,
    /// Model that served (or would have served) the request.
    pub model: String,
    /// Requested task.
    pub task: TaskType,
    /// Wall time of the request.
    pub duration: Duration,
    /// Whether the result came from the cache.
    pub cache_hit: bool,
    /// Whether the streaming entry point was used.
    pub streaming: bool,
    /// Whether the request succeeded.
    pub success: bool,
    /// Whether the caller cancelled.
    pub cancelled: bool,
    /// Prompt tokens reported by the server.
    pub prompt_tokens: u32,
    /// Completion tokens reported by the server.
    pub completion_tokens: u32,
}

/// A passive consumer of metric records.
pub trait MetricsSink: Send + Sync {
    /// Records a preprocessing run.
    fn record_preprocessing(&self, metric: &PreprocessingMetric) -> Result<(), MetricsError>;

    /// Records a finished stream.
    fn record_stream(&self, metric: &StreamMetric) -> Result<(), MetricsError>;

    /// Records a finished request.
    fn record_request(&self, metric: &RequestMetric) -> Result<(), MetricsError>;
}

/// Records a preprocessing metric, logging any sink failure.
pub fn emit_preprocessing(sink: &dyn MetricsSink, metric: &PreprocessingMetric) {
    if let Err(e) = sink.record_preprocessing(metric) {
        warn!(error = %e, "Failed to record preprocessing metric");
    }
}

/// Records a stream metric, logging any sink failure.
pub fn emit_stream(sink: &dyn MetricsSink, metric: &StreamMetric) {
    if let Err(e) = sink.record_stream(metric) {
        warn!(error = %e, session_id = %metric.session_id, "Failed to record stream metric");
    }
}

/// Records a request metric, logging any sink failure.
pub fn emit_request(sink: &dyn MetricsSink, metric: &RequestMetric) {
    if let Err(e) = sink.record_request(metric) {
        warn!(error = %e, model = %metric.model, "Failed to record request metric");
    }
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_preprocessing(&self, _metric: &PreprocessingMetric) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_stream(&self, _metric: &StreamMetric) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_request(&self, _metric: &RequestMetric) -> Result<(), MetricsError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Records {
    preprocessing: Vec<PreprocessingMetric>,
    streams: Vec<StreamMetric>,
    requests: Vec<RequestMetric>,
}

/// Aggregate view over retained request metrics.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MetricsSummary {
    /// Requests recorded.
    pub requests: usize,
    /// Requests that succeeded.
    pub successes: usize,
    /// Requests answered from cache.
    pub cache_hits: usize,
    /// Mean request duration in milliseconds.
    pub average_duration_ms: f64,
    /// Prompt plus completion tokens over all requests.
    pub total_tokens: u64,
    /// Streams recorded.
    pub streams: usize,
    /// Preprocessing runs recorded.
    pub preprocessing_runs: usize,
}

/// Keeps records in memory for a retention window.
#[derive(Debug)]
pub struct InMemoryMetrics {
    retention: Duration,
    records: Mutex<Records>,
}

impl InMemoryMetrics {
    /// Creates a sink keeping records for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self { retention, records: Mutex::new(Records::default()) }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retained preprocessing records, oldest first.
    pub fn preprocessing(&self) -> Vec<PreprocessingMetric> {
        self.records().preprocessing.clone()
    }

    /// Retained stream records, oldest first.
    pub fn streams(&self) -> Vec<StreamMetric> {
        self.records().streams.clone()
    }

    /// Retained request records, oldest first.
    pub fn requests(&self) -> Vec<RequestMetric> {
        self.records().requests.clone()
    }

    /// Aggregates the retained records.
    pub fn summary(&self) -> MetricsSummary {
        let records = self.records();
        let requests = &records.requests;
        let total_ms: f64 = requests.iter().map(|r| r.duration.as_secs_f64() * 1000.0).sum();

        MetricsSummary {
            requests: requests.len(),
            successes: requests.iter().filter(|r| r.success).count(),
            cache_hits: requests.iter().filter(|r| r.cache_hit).count(),
            average_duration_ms: if requests.is_empty() {
                0.0
            } else {
                total_ms / requests.len() as f64
            },
            total_tokens: requests
                .iter()
                .map(|r| u64::from(r.prompt_tokens) + u64::from(r.completion_tokens))
                .sum(),
            streams: records.streams.len(),
            preprocessing_runs: records.preprocessing.len(),
        }
    }

    /// Drops records older than the retention window at `now`. Returns how many were dropped.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = now - retention;

        let mut records = self.records();
        let before =
            records.preprocessing.len() + records.streams.len() + records.requests.len();
        records.preprocessing.retain(|m| m.recorded_at >= cutoff);
        records.streams.retain(|m| m.recorded_at >= cutoff);
        records.requests.retain(|m| m.recorded_at >= cutoff);
        before - (records.preprocessing.len() + records.streams.len() + records.requests.len())
    }

    /// Spawns the periodic retention sweep. It stops when `shutdown` is cancelled.
    pub fn start_retention_loop(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let dropped = metrics.prune_expired(Utc::now());
                        if dropped > 0 {
                            debug!(dropped, "Pruned expired metrics");
                        }
                    }
                }
            }
        })
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_preprocessing(&self, metric: &PreprocessingMetric) -> Result<(), MetricsError> {
        self.records().preprocessing.push(metric.clone());
        Ok(())
    }

    fn record_stream(&self, metric: &StreamMetric) -> Result<(), MetricsError> {
        self.records().streams.push(metric.clone());
        Ok(())
    }

    fn record_request(&self, metric: &RequestMetric) -> Result<(), MetricsError> {
        self.records().requests.push(metric.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(at: DateTime<Utc>, success: bool, cache_hit: bool) -> RequestMetric {
        RequestMetric {
            recorded_at: at,
            model: "llama3".to_string(),
            task: TaskType::Quick,
            duration: Duration::from_millis(200),
            cache_hit,
            streaming: false,
            success,
            cancelled: false,
            prompt_tokens: 10,
            completion_tokens: 5,
        }
    }

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn record_preprocessing(&self, _: &PreprocessingMetric) -> Result<(), MetricsError> {
            Err(MetricsError::Unavailable("down".to_string()))
        }

        fn record_stream(&self, _: &StreamMetric) -> Result<(), MetricsError> {
            Err(MetricsError::Unavailable("down".to_string()))
        }

        fn record_request(&self, _: &RequestMetric) -> Result<(), MetricsError> {
            Err(MetricsError::Unavailable("down".to_string()))
        }
    }

    #[test]
    fn test_summary() {
        let metrics = InMemoryMetrics::new(Duration::from_secs(60));
        let now = Utc::now();
        metrics.record_request(&request(now, true, false)).unwrap();
        metrics.record_request(&request(now, true, true)).unwrap();
        metrics.record_request(&request(now, false, false)).unwrap();

        let summary = metrics.summary();
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.successes, 2);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.total_tokens, 45);
        assert!((summary.average_duration_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_prune_expired() {
        let metrics = InMemoryMetrics::new(Duration::from_secs(60));
        let now = Utc::now();
        metrics.record_request(&request(now - chrono::Duration::seconds(120), true, false)).unwrap();
        metrics.record_request(&request(now, true, false)).unwrap();

        assert_eq!(metrics.prune_expired(now), 1);
        assert_eq!(metrics.requests().len(), 1);
    }

    #[test]
    fn test_emit_swallows_sink_errors() {
        emit_request(&FailingSink, &request(Utc::now(), true, false));
    }

    #[tokio::test]
    async fn test_retention_loop_stops_on_cancel() {
        let metrics = Arc::new(InMemoryMetrics::new(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();
        let handle = metrics.start_retention_loop(Duration::from_millis(5), shutdown.clone());

        metrics
            .record_request(&request(Utc::now() - chrono::Duration::seconds(600), true, false))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(metrics.requests().is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
