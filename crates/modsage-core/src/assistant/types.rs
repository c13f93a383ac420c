//! Request results and cached payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use modsage_abstraction::{ModelUsage, TaskType};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// The payload stored in the response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    /// Generated text.
    pub content: String,
    /// Model that produced it.
    pub model_used: String,
    /// Usage reported when it was produced.
    pub token_usage: Option<ModelUsage>,
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOutcome {
    /// Content was produced (or served from cache).
    Completed,
    /// A step failed; see `errors`.
    Failed,
    /// The caller cancelled.
    Cancelled,
}

/// Result of `analyze` / `analyze_streaming`.
///
/// Failures are data: `success` is false and `errors` holds at least one
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Whether content was produced.
    pub success: bool,
    /// How the request ended.
    pub outcome: AnalysisOutcome,
    /// Generated text; may be partial when a stream failed.
    pub content: String,
    /// Model that served the request, after fallback.
    pub model_used: String,
    /// Requested task.
    pub task: TaskType,
    /// When the request started.
    pub started_at: DateTime<Utc>,
    /// When the request finished.
    pub completed_at: DateTime<Utc>,
    /// Wall time of the request.
    pub duration: Duration,
    /// Usage reported by the server, when available.
    pub token_usage: Option<ModelUsage>,
    /// Whether the content came from the cache.
    pub cache_hit: bool,
    /// The request's cache key.
    pub cache_key: String,
    /// Sampling temperature used.
    pub temperature: f32,
    /// Whether the streaming entry point was used.
    pub streaming_used: bool,
    /// Whether a fallback model replaced the requested one.
    pub fallback_used: bool,
    /// User-facing error messages.
    pub errors: Vec<String>,
    /// Non-fatal notes (fallbacks, recovered stream errors).
    pub warnings: Vec<String>,
}

impl AnalysisResult {
    pub(crate) fn pending(
        task: TaskType,
        model: String,
        temperature: f32,
        streaming_used: bool,
        cache_key: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            success: false,
            outcome: AnalysisOutcome::Failed,
            content: String::new(),
            model_used: model,
            task,
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
            token_usage: None,
            cache_hit: false,
            cache_key,
            temperature,
            streaming_used,
            fallback_used: false,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn succeed(&mut self, content: String, usage: Option<ModelUsage>) {
        self.success = true;
        self.outcome = AnalysisOutcome::Completed;
        self.content = content;
        self.token_usage = usage;
    }

    pub(crate) fn fail(&mut self, err: &AnalysisError) {
        self.success = false;
        self.outcome =
            if err.is_cancelled() { AnalysisOutcome::Cancelled } else { AnalysisOutcome::Failed };
        self.errors.push(err.user_message());
    }

    pub(crate) fn finish(&mut self, duration: Duration) {
        self.completed_at = Utc::now();
        self.duration = duration;
    }
}
