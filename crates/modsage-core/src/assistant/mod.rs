//! The analysis orchestrator.
//!
//! `AiAssistant` composes the preprocessor, response cache, session pool and
//! streaming handler into one request pipeline:
//!
//! ```text
//! preprocess -> cache lookup -> (hit: done)
//!                            -> (miss: resolve model -> acquire session
//!                                      -> model call -> cache store -> release)
//! ```
//!
//! Every failure becomes data in `AnalysisResult`. Sessions are released on
//! every path.

mod catalog;
mod prompt;
mod retry;
mod types;

pub use catalog::{FALLBACK_MODELS, ModelCatalog, ModelResolution, model_matches, resolve_model};
pub use prompt::build_prompt;
pub use retry::{is_retryable, with_retry};
pub use types::{AnalysisOutcome, AnalysisResult, CachedAnalysis};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use modsage_abstraction::{
    ClientFactory, ErrorKind, GenerateOptions, ModelClient, ModelResponse, ModelUsage, ScanResult,
    ServerError, TaskType, TimeoutCategory,
};
use modsage_models::OllamaClientFactory;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{ResponseCache, generate_key};
use crate::config::AppConfig;
use crate::error::{AnalysisError, SessionError, StreamError};
use crate::metrics::{InMemoryMetrics, MetricsSink, RequestMetric, emit_request};
use crate::preprocess::ContentPreprocessor;
use crate::session::{SessionLease, SessionManager};
use crate::streaming::{StreamCallbacks, StreamOptions, StreamingHandler, replay_chunks};

const STANDARD_TIER: &str = "standard";
const WARM_UP_PROMPT: &str = "Reply with OK.";

/// Cancellation scope that also fires once `ceiling` elapses.
struct Deadline {
    token: CancellationToken,
    ceiling: Duration,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn new(parent: &CancellationToken, ceiling: Duration) -> Self {
        let token = parent.child_token();
        let expire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            expire.cancel();
        });
        Self { token, ceiling, timer }
    }

    /// Reports a cancellation the caller did not request as a timeout.
    fn classify(&self, err: AnalysisError, parent: &CancellationToken) -> AnalysisError {
        if err.is_cancelled() && !parent.is_cancelled() {
            AnalysisError::Timeout { seconds: self.ceiling.as_secs() }
        } else {
            err
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

fn is_connection_failure(err: &AnalysisError) -> bool {
    let server = match err {
        AnalysisError::Server(e) | AnalysisError::Stream(StreamError::Server(e)) => e,
        _ => return false,
    };
    matches!(server.kind, ErrorKind::Connect | ErrorKind::Network | ErrorKind::Timeout)
}

/// A model-not-found answer from the call itself, before any output was produced.
fn is_model_not_found(err: &AnalysisError) -> bool {
    matches!(err, AnalysisError::Server(e) if e.kind == ErrorKind::ModelNotFound)
}

/// Setup failures the streaming entry point returns as `Err` instead of data.
fn aborts_stream(err: &AnalysisError) -> bool {
    err.is_cancelled()
        || matches!(
            err,
            AnalysisError::Session(SessionError::Connect { .. } | SessionError::ShutDown)
                | AnalysisError::NoSuitableFallback { .. }
        )
}

async fn generate_once(
    client: Arc<dyn ModelClient>,
    prompt: &str,
    options: GenerateOptions,
    cancel: CancellationToken,
) -> Result<ModelResponse, AnalysisError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AnalysisError::Cancelled),
        response = client.generate_text(prompt, options) => response.map_err(AnalysisError::Server),
    }
}

struct Streamed {
    content: String,
    terminal: Option<Option<ModelUsage>>,
    recovered: Vec<String>,
}

/// Runs analyses of scan results against the model server.
pub struct AiAssistant {
    config: AppConfig,
    cache: ResponseCache,
    preprocessor: ContentPreprocessor,
    sessions: SessionManager,
    streaming: StreamingHandler,
    catalog: ModelCatalog,
    metrics: Arc<InMemoryMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AiAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiAssistant")
            .field("base_url", &self.config.ai.base_url)
            .field("cache", &self.cache)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AiAssistant {
    /// Creates an assistant talking to the Ollama server at `config.ai.base_url`.
    ///
    /// # Errors
    /// Returns a `ServerError` if the HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        let factory = OllamaClientFactory::new(config.ai.base_url.clone(), config.timeouts.probe())?;
        Ok(Self::with_factory(config, Arc::new(factory)))
    }

    /// Creates an assistant opening model clients through `factory`.
    pub fn with_factory(config: AppConfig, factory: Arc<dyn ClientFactory>) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new(Duration::from_secs(config.metrics.retention_secs)));
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let cache = ResponseCache::new(&config.cache);
        let preprocessor = ContentPreprocessor::new(config.ai.max_tokens).with_metrics(Arc::clone(&sink));
        let sessions =
            SessionManager::new(Arc::clone(&factory), config.sessions.clone(), config.timeouts.probe());
        let streaming = StreamingHandler::new(StreamOptions::from(&config.streaming)).with_metrics(sink);
        let catalog =
            ModelCatalog::new(factory, config.ai.lightweight_model.clone(), config.ai.model_list_ttl());

        Self {
            config,
            cache,
            preprocessor,
            sessions,
            streaming,
            catalog,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The response cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The session pool.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The installed-model catalog.
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Recorded metrics.
    pub fn metrics(&self) -> &Arc<InMemoryMetrics> {
        &self.metrics
    }

    /// Starts session maintenance and metrics retention. Calling it again is a no-op.
    pub fn start(&self) {
        self.sessions.start();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_empty() && !self.shutdown.is_cancelled() {
            let interval = Duration::from_secs(self.config.metrics.cleanup_interval_secs);
            tasks.push(self.metrics.start_retention_loop(interval, self.shutdown.child_token()));
        }
    }

    /// Stops background tasks and disposes every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        self.sessions.shutdown().await;
        info!("AI assistant shut down");
    }

    /// The configured model for `task`, or the standard-tier model when unmapped.
    pub fn recommended_model(&self, task: TaskType) -> String {
        let ai = &self.config.ai;
        ai.task_tiers
            .get(task.as_str())
            .and_then(|tier| ai.model_tiers.get(tier))
            .or_else(|| ai.model_tiers.get(STANDARD_TIER))
            .cloned()
            .unwrap_or_else(|| ai.lightweight_model.clone())
    }

    /// Returns `true` if a session for the lightweight model can be opened and probed.
    ///
    /// Waits at most the probe timeout for a free slot.
    pub async fn is_available(&self) -> bool {
        let cancel = self.shutdown.child_token();
        let model = &self.config.ai.lightweight_model;
        let acquired = tokio::time::timeout(self.config.timeouts.probe(), self.sessions.acquire(model, &cancel)).await;
        let mut lease = match acquired {
            Ok(Ok(lease)) => lease,
            Ok(Err(err)) => {
                debug!(model = %model, error = %err, "AI server not available");
                return false;
            }
            Err(_) => {
                debug!(model = %model, "No free session slot for the availability probe");
                return false;
            }
        };

        let probe = tokio::time::timeout(self.config.timeouts.probe(), lease.client().probe()).await;
        let available = matches!(probe, Ok(Ok(())));
        if !available {
            lease.mark_unhealthy();
        }
        self.sessions.release(lease);
        available
    }

    /// Analyzes `scan` with a blocking model call.
    ///
    /// Never fails: errors, timeouts and cancellation are reported in the result.
    pub async fn analyze(
        &self,
        scan: &ScanResult,
        task: TaskType,
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let started = Instant::now();
        let (prompt, mut result) = self.prepare(scan, task, model_override, false);

        if let Some(cached) = self.cache.get::<CachedAnalysis>(&result.cache_key).await {
            debug!(key = %result.cache_key, model = %cached.model_used, "Serving analysis from cache");
            result.cache_hit = true;
            result.model_used = cached.model_used;
            result.succeed(cached.content, cached.token_usage);
            return self.finish(result, started);
        }

        match self.generate_blocking(&prompt, task, &mut result, cancel).await {
            Ok(response) => self.store_and_succeed(&mut result, response.content, response.usage).await,
            Err(err) => result.fail(&err),
        }
        self.finish(result, started)
    }

    /// Analyzes `scan`, delivering the response through `callbacks` as it arrives.
    ///
    /// A cache hit is replayed as a chunk stream so callers see the same
    /// behaviour either way. The response is cached only once the server's
    /// terminal record arrives.
    ///
    /// # Errors
    /// `Cancelled` when the caller cancels, and setup failures that leave
    /// nothing to stream: the server is unreachable, the pool is shut down, or
    /// no model is installed.
    pub async fn analyze_streaming(
        &self,
        scan: &ScanResult,
        task: TaskType,
        callbacks: &mut StreamCallbacks<'_>,
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();
        let (prompt, mut result) = self.prepare(scan, task, model_override, true);

        if let Some(cached) = self.cache.get::<CachedAnalysis>(&result.cache_key).await {
            debug!(key = %result.cache_key, model = %cached.model_used, "Replaying cached analysis");
            result.cache_hit = true;
            result.model_used = cached.model_used;
            let replayed =
                self.replay(&mut result, &cached.content, cached.token_usage, callbacks, cancel).await;
            if let Err(err) = replayed {
                return Err(self.abort(result, started, err));
            }
            return Ok(self.finish(result, started));
        }

        if !self.config.ai.streaming_enabled {
            match self.generate_blocking(&prompt, task, &mut result, cancel).await {
                Ok(response) => {
                    result
                        .warnings
                        .push("Streaming is disabled; the response was generated in one piece.".to_string());
                    self.store(&result, &response.content, response.usage).await;
                    let replayed =
                        self.replay(&mut result, &response.content, response.usage, callbacks, cancel).await;
                    if let Err(err) = replayed {
                        return Err(self.abort(result, started, err));
                    }
                }
                Err(err) if aborts_stream(&err) => return Err(self.abort(result, started, err)),
                Err(err) => result.fail(&err),
            }
            return Ok(self.finish(result, started));
        }

        let model = match self.resolve(&mut result, cancel).await {
            Ok(model) => model,
            Err(err) => return Err(self.abort(result, started, err)),
        };

        let deadline = Deadline::new(cancel, self.timeout_for(task));
        let mut streamed = self.stream_model(&model, &prompt, callbacks, &deadline).await;
        if streamed.as_ref().is_err_and(is_model_not_found) {
            if let Some(fallback) = self.fallback_after_not_found(&model, &deadline.token).await {
                Self::record_fallback(&mut result, &fallback);
                streamed = self.stream_model(&fallback.model, &prompt, callbacks, &deadline).await;
            }
        }
        let streamed = streamed.map_err(|err| deadline.classify(err, cancel));

        match streamed {
            Ok(streamed) => {
                result.warnings.extend(
                    streamed.recovered.iter().map(|e| format!("Recovered from stream error: {e}")),
                );
                match streamed.terminal {
                    Some(usage) => self.store_and_succeed(&mut result, streamed.content, usage).await,
                    None => {
                        result.content = streamed.content;
                        result.fail(&AnalysisError::IncompleteStream);
                    }
                }
            }
            Err(err) if aborts_stream(&err) => return Err(self.abort(result, started, err)),
            Err(err) => result.fail(&err),
        }
        Ok(self.finish(result, started))
    }

    /// Validates that `model` (or the lightweight model) answers, loading it on the server.
    ///
    /// Transient server errors are retried with exponential backoff.
    ///
    /// # Errors
    /// The final error once retries are exhausted, a timeout, or `Cancelled`.
    pub async fn warm_up(&self, model: Option<&str>, cancel: &CancellationToken) -> Result<String, AnalysisError> {
        let requested = model.map_or_else(|| self.config.ai.lightweight_model.clone(), str::to_string);
        let resolution = self.resolve_name(&requested, cancel).await?;

        let options = GenerateOptions { temperature: Some(0.0), max_tokens: Some(1) };
        let deadline = Deadline::new(cancel, self.config.timeouts.for_category(TimeoutCategory::Standard));
        let mut model = resolution.model;
        let mut warmed = self.generate_with_session(&model, WARM_UP_PROMPT, options, &deadline, "warm_up").await;
        if warmed.as_ref().is_err_and(is_model_not_found) {
            if let Some(fallback) = self.fallback_after_not_found(&model, &deadline.token).await {
                model = fallback.model;
                warmed = self.generate_with_session(&model, WARM_UP_PROMPT, options, &deadline, "warm_up").await;
            }
        }
        warmed.map_err(|err| deadline.classify(err, cancel))?;

        info!(model = %model, "Model warmed up");
        Ok(model)
    }

    fn prepare(
        &self,
        scan: &ScanResult,
        task: TaskType,
        model_override: Option<&str>,
        streaming: bool,
    ) -> (String, AnalysisResult) {
        let requested = model_override.map_or_else(|| self.recommended_model(task), str::to_string);
        let preprocessed = self.preprocessor.preprocess(scan, task);
        let prompt = build_prompt(task, &preprocessed);
        let temperature = self.config.ai.temperature;
        let key = generate_key(&prompt, &requested, temperature, &[task.as_str()]);
        debug!(
            task = %task,
            model = %requested,
            prompt_len = prompt.len(),
            streaming,
            "Prepared analysis request"
        );
        (prompt, AnalysisResult::pending(task, requested, temperature, streaming, key))
    }

    fn timeout_for(&self, task: TaskType) -> Duration {
        self.config.timeouts.for_category(task.timeout_category())
    }

    fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: Some(self.config.ai.temperature),
            max_tokens: Some(self.config.ai.max_tokens),
        }
    }

    async fn resolve_name(
        &self,
        requested: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelResolution, AnalysisError> {
        let installed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            installed = self.catalog.models() => installed,
        };
        match installed {
            Ok(installed) => resolve_model(requested, &installed),
            Err(err) => {
                warn!(model = %requested, error = %err, "Could not list installed models");
                Ok(ModelResolution::requested(requested))
            }
        }
    }

    /// Resolves `result.model_used` against the installed models, recording any fallback.
    async fn resolve(&self, result: &mut AnalysisResult, cancel: &CancellationToken) -> Result<String, AnalysisError> {
        let resolution = self.resolve_name(&result.model_used, cancel).await?;
        Self::record_fallback(result, &resolution);
        Ok(resolution.model)
    }

    fn record_fallback(result: &mut AnalysisResult, resolution: &ModelResolution) {
        let Some(replaced) = &resolution.replaced else {
            return;
        };
        warn!(requested = %replaced, fallback = %resolution.model, "Requested model not installed");
        result.warnings.push(format!(
            "Model '{replaced}' is not installed; used '{}' instead.",
            resolution.model
        ));
        result.fallback_used = true;
        result.model_used.clone_from(&resolution.model);
    }

    /// Re-lists the installed models after the server reported `model` missing.
    ///
    /// Returns the replacement, or `None` when the fresh list cannot be fetched,
    /// still contains `model`, or offers no fallback.
    async fn fallback_after_not_found(&self, model: &str, cancel: &CancellationToken) -> Option<ModelResolution> {
        let refreshed = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            refreshed = self.catalog.refresh() => refreshed,
        };
        let installed = match refreshed {
            Ok(installed) => installed,
            Err(err) => {
                warn!(model = %model, error = %err, "Could not refresh installed models");
                return None;
            }
        };
        resolve_model(model, &installed).ok().filter(|resolution| resolution.replaced.is_some())
    }

    async fn generate_blocking(
        &self,
        prompt: &str,
        task: TaskType,
        result: &mut AnalysisResult,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AnalysisError> {
        let model = self.resolve(result, cancel).await?;
        let deadline = Deadline::new(cancel, self.timeout_for(task));
        let options = self.generate_options();
        let mut response = self.generate_with_session(&model, prompt, options, &deadline, "generate_text").await;
        if response.as_ref().is_err_and(is_model_not_found) {
            if let Some(fallback) = self.fallback_after_not_found(&model, &deadline.token).await {
                Self::record_fallback(result, &fallback);
                response =
                    self.generate_with_session(&fallback.model, prompt, options, &deadline, "generate_text").await;
            }
        }
        let response = response.map_err(|err| deadline.classify(err, cancel))?;

        if response.content.trim().is_empty() {
            return Err(AnalysisError::Server(ServerError::new(
                ErrorKind::Decode,
                "Model returned an empty response",
            )));
        }
        Ok(response)
    }

    async fn generate_with_session(
        &self,
        model: &str,
        prompt: &str,
        options: GenerateOptions,
        deadline: &Deadline,
        operation: &str,
    ) -> Result<ModelResponse, AnalysisError> {
        let mut lease = self.sessions.acquire(model, &deadline.token).await?;
        let client = Arc::clone(lease.client());
        let response = with_retry(&self.config.retry, operation, &deadline.token, |_| {
            generate_once(Arc::clone(&client), prompt, options, deadline.token.clone())
        })
        .await;

        if response.as_ref().is_err_and(is_connection_failure) {
            lease.mark_unhealthy();
        }
        self.sessions.release(lease);
        response
    }

    async fn stream_model(
        &self,
        model: &str,
        prompt: &str,
        callbacks: &mut StreamCallbacks<'_>,
        deadline: &Deadline,
    ) -> Result<Streamed, AnalysisError> {
        let mut lease = self.sessions.acquire(model, &deadline.token).await?;
        let streamed = self.stream_with_lease(&lease, prompt, callbacks, &deadline.token).await;
        if streamed.as_ref().is_err_and(is_connection_failure) {
            lease.mark_unhealthy();
        }
        self.sessions.release(lease);
        streamed
    }

    async fn stream_with_lease(
        &self,
        lease: &SessionLease,
        prompt: &str,
        callbacks: &mut StreamCallbacks<'_>,
        cancel: &CancellationToken,
    ) -> Result<Streamed, AnalysisError> {
        let chunks = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            chunks = lease.client().generate_stream(prompt, self.generate_options()) => chunks?,
        };

        let mut terminal = None;
        let text = chunks.map(|record| {
            record.map(|chunk| {
                if chunk.done {
                    terminal = Some(chunk.usage);
                }
                chunk.text
            })
        });
        let outcome = self.streaming.process_stream(text, callbacks, cancel).await?;

        Ok(Streamed { content: outcome.content, terminal, recovered: outcome.recovered_errors })
    }

    /// Streams `content` through the handler; only cancellation is returned as `Err`.
    async fn replay(
        &self,
        result: &mut AnalysisResult,
        content: &str,
        usage: Option<ModelUsage>,
        callbacks: &mut StreamCallbacks<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        let streaming = &self.config.streaming;
        let chunks = replay_chunks(
            content,
            streaming.replay_chunk_size,
            Duration::from_millis(streaming.replay_delay_ms),
        );
        match self.streaming.process_stream(chunks, callbacks, cancel).await {
            Ok(outcome) => result.succeed(outcome.content, usage),
            Err(StreamError::Cancelled) => return Err(AnalysisError::Cancelled),
            Err(err) => result.fail(&err.into()),
        }
        Ok(())
    }

    async fn store(&self, result: &AnalysisResult, content: &str, usage: Option<ModelUsage>) {
        let cached = CachedAnalysis {
            content: content.to_string(),
            model_used: result.model_used.clone(),
            token_usage: usage,
        };
        self.cache.set(&result.cache_key, &cached).await;
    }

    async fn store_and_succeed(&self, result: &mut AnalysisResult, content: String, usage: Option<ModelUsage>) {
        self.store(result, &content, usage).await;
        result.succeed(content, usage);
    }

    /// Records and reports a request that ends in `Err`.
    fn abort(&self, mut result: AnalysisResult, started: Instant, err: AnalysisError) -> AnalysisError {
        result.fail(&err);
        let _ = self.finish(result, started);
        err
    }

    fn finish(&self, mut result: AnalysisResult, started: Instant) -> AnalysisResult {
        result.finish(started.elapsed());
        let cancelled = result.outcome == AnalysisOutcome::Cancelled;
        if result.success {
            info!(
                task = %result.task,
                model = %result.model_used,
                cache_hit = result.cache_hit,
                streaming = result.streaming_used,
                duration_ms = result.duration.as_millis(),
                "Analysis completed"
            );
        } else if cancelled {
            info!(task = %result.task, model = %result.model_used, "Analysis cancelled");
        } else {
            error!(
                task = %result.task,
                model = %result.model_used,
                errors = ?result.errors,
                "Analysis failed"
            );
        }

        emit_request(
            self.metrics.as_ref(),
            &RequestMetric {
                recorded_at: Utc::now(),
                model: result.model_used.clone(),
                task: result.task,
                duration: result.duration,
                cache_hit: result.cache_hit,
                streaming: result.streaming_used,
                success: result.success,
                cancelled,
                prompt_tokens: result.token_usage.map_or(0, |u| u.prompt_tokens),
                completion_tokens: result.token_usage.map_or(0, |u| u.completion_tokens),
            },
        );
        result
    }
}
