//! Content preprocessing.
//!
//! Turns a `ScanResult` into a token-budgeted prompt body in four stages:
//! prioritize sections, render them, filter lines for the task, then enforce
//! the hard token budget. Each stage only sees the previous stage's output.

mod filter;
mod sections;
mod tokens;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use modsage_abstraction::{ScanResult, TaskType};
use serde::Serialize;
use tracing::debug;

pub use filter::filter_content;
pub use sections::{
    ContentSection, PrioritizedSections, PriorityBucket, SectionKind, generate_optimized_content,
    prioritize_sections,
};
pub use tokens::{TRUNCATION_NOTICE, estimate_tokens, optimize_content};

use crate::metrics::{MetricsSink, NoopMetrics, PreprocessingMetric, emit_preprocessing};

/// Step names recorded in `PreprocessedContent::optimization_steps`.
pub const STEP_PRIORITIZE: &str = "prioritize_sections";
/// Rendering step.
pub const STEP_RENDER: &str = "generate_optimized_content";
/// Filtering step.
pub const STEP_FILTER: &str = "filter_content";
/// Budget step.
pub const STEP_BUDGET: &str = "optimize_token_budget";

/// The per-request output of preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessedContent {
    /// Task the content was prepared for.
    pub task: TaskType,
    /// The final prompt body.
    pub content: String,
    /// Token estimate of the unfiltered rendering.
    pub original_tokens: usize,
    /// Token estimate of `content`.
    pub final_tokens: usize,
    /// `final_tokens / original_tokens`, or 1 when there was nothing to compress.
    pub compression_ratio: f64,
    /// Stage names in the order they ran.
    pub optimization_steps: Vec<String>,
    /// The sections the content was rendered from.
    pub sections: PrioritizedSections,
}

/// Converts scan results into prompt bodies.
#[derive(Clone)]
pub struct ContentPreprocessor {
    max_tokens: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for ContentPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPreprocessor").field("max_tokens", &self.max_tokens).finish_non_exhaustive()
    }
}

impl ContentPreprocessor {
    /// Creates a preprocessor budgeting against `max_tokens`.
    #[must_use]
    pub fn new(max_tokens: u32) -> Self {
        Self { max_tokens, metrics: Arc::new(NoopMetrics) }
    }

    /// Sets the sink receiving one `PreprocessingMetric` per run.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The token budget for `task`, as a fraction of the configured maximum.
    #[must_use]
    pub fn max_tokens_for_task(&self, task: TaskType) -> usize {
        let fraction = match task {
            TaskType::Quick => 0.5,
            TaskType::Summary => 0.6,
            TaskType::Conflicts | TaskType::Performance => 0.8,
            TaskType::Full => 0.9,
            TaskType::Custom => 0.7,
        };
        (f64::from(self.max_tokens) * fraction) as usize
    }

    /// Runs the full pipeline for `scan` and `task`.
    pub fn preprocess(&self, scan: &ScanResult, task: TaskType) -> PreprocessedContent {
        let started = Instant::now();
        let mut steps = Vec::with_capacity(4);

        let sections = prioritize_sections(scan, task);
        steps.push(STEP_PRIORITIZE.to_string());

        let rendered = generate_optimized_content(&sections, task);
        steps.push(STEP_RENDER.to_string());
        let original_tokens = estimate_tokens(&rendered);

        let filtered = filter_content(&rendered, task);
        steps.push(STEP_FILTER.to_string());

        let budget = self.max_tokens_for_task(task);
        let content = optimize_content(&filtered, budget);
        steps.push(STEP_BUDGET.to_string());

        let final_tokens = estimate_tokens(&content);
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            final_tokens as f64 / original_tokens as f64
        };

        debug!(
            task = %task,
            sections = sections.total_sections(),
            original_tokens,
            final_tokens,
            budget,
            compression_ratio,
            "Preprocessed scan content"
        );
        emit_preprocessing(
            self.metrics.as_ref(),
            &PreprocessingMetric {
                recorded_at: Utc::now(),
                task,
                original_tokens,
                final_tokens,
                compression_ratio,
                sections: sections.total_sections(),
                duration: started.elapsed(),
            },
        );

        PreprocessedContent {
            task,
            content,
            original_tokens,
            final_tokens,
            compression_ratio,
            optimization_steps: steps,
            sections,
        }
    }
}
