//! In-process mock of the model server for testing and offline development.
//!
//! A `MockServer` holds the state a real server would have (installed models,
//! reachability) plus a script of responses. `MockClientFactory` hands out
//! `MockModelClient`s bound to one model that all talk to the same server.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use modsage_abstraction::{
    ChunkStream, ClientFactory, ErrorKind, GenerateOptions, ModelClient, ModelResponse,
    ModelUsage, ServerError, StreamChunk,
};
use tracing::debug;

/// Shared state of the mock server.
#[derive(Debug, Default)]
pub struct MockServer {
    models: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    unhealthy_models: Mutex<HashSet<String>>,
    responses: Mutex<VecDeque<Result<String, ServerError>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamChunk, ServerError>>>>,
    latency: Mutex<Duration>,
    probe_latency: Mutex<Duration>,
    prompts: Mutex<Vec<(String, String)>>,
    generate_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    clients_created: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockServer {
    /// Creates a reachable server with no installed models.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a reachable server with the given installed models.
    #[must_use]
    pub fn with_models(models: &[&str]) -> Arc<Self> {
        let server = Self::new();
        server.set_models(models);
        server
    }

    /// Replaces the installed model list.
    pub fn set_models(&self, models: &[&str]) {
        *lock(&self.models) = models.iter().map(|m| (*m).to_string()).collect();
    }

    /// Makes every request fail with a connect error while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Makes probes from clients bound to `model` fail while `false`.
    pub fn set_model_healthy(&self, model: &str, healthy: bool) {
        let mut unhealthy = lock(&self.unhealthy_models);
        if healthy {
            unhealthy.remove(model);
        } else {
            unhealthy.insert(model.to_string());
        }
    }

    /// Adds a latency to every blocking generation.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Adds a latency to every probe.
    pub fn set_probe_latency(&self, latency: Duration) {
        *lock(&self.probe_latency) = latency;
    }

    /// Queues the outcome of the next blocking generation.
    pub fn push_response(&self, outcome: Result<String, ServerError>) {
        lock(&self.responses).push_back(outcome);
    }

    /// Queues the records of the next streaming generation.
    pub fn push_stream(&self, records: Vec<Result<StreamChunk, ServerError>>) {
        lock(&self.streams).push_back(records);
    }

    /// Number of blocking generations served (including failed ones).
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of streaming generations started.
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Number of probes received.
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Number of clients created by factories of this server.
    pub fn clients_created(&self) -> usize {
        self.clients_created.load(Ordering::SeqCst)
    }

    /// The `(model, prompt)` pairs received so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        lock(&self.prompts).clone()
    }

    /// A factory whose clients talk to this server.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> MockClientFactory {
        MockClientFactory { server: Arc::clone(self) }
    }

    fn check_reachable(&self) -> Result<(), ServerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ServerError::new(ErrorKind::Connect, "Mock server not reachable"));
        }
        Ok(())
    }

    fn check_installed(&self, model: &str) -> Result<(), ServerError> {
        let models = lock(&self.models);
        let latest = format!("{model}:latest");
        if models.iter().any(|m| m == model || *m == latest) {
            return Ok(());
        }
        Err(ServerError::from_status(404, format!("Model '{model}' not found")))
    }

    fn next_text(&self, model: &str, prompt: &str) -> Result<String, ServerError> {
        lock(&self.responses).pop_front().unwrap_or_else(|| {
            Ok(format!(
                "Mock analysis from {model} over {} prompt words.",
                prompt.split_whitespace().count()
            ))
        })
    }
}

/// Factory producing `MockModelClient`s.
#[derive(Debug, Clone)]
pub struct MockClientFactory {
    server: Arc<MockServer>,
}

impl ClientFactory for MockClientFactory {
    fn create(&self, model: &str) -> Result<Arc<dyn ModelClient>, ServerError> {
        self.server.clients_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockModelClient {
            model_id: model.to_string(),
            server: Arc::clone(&self.server),
        }))
    }
}

/// A mock client bound to one model.
#[derive(Debug, Clone)]
pub struct MockModelClient {
    model_id: String,
    server: Arc<MockServer>,
}

#[allow(clippy::cast_possible_truncation)]
fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn probe(&self) -> Result<(), ServerError> {
        self.server.probe_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.server.probe_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.server.check_reachable()?;
        if lock(&self.server.unhealthy_models).contains(&self.model_id) {
            return Err(ServerError::from_status(503, "Mock probe failure"));
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, ServerError> {
        self.server.check_reachable()?;
        Ok(lock(&self.server.models).clone())
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, ServerError> {
        debug!(model_id = %self.model_id, options = ?options, "MockModelClient generating text");
        self.server.generate_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.server.prompts).push((self.model_id.clone(), prompt.to_string()));
        self.server.check_reachable()?;

        let latency = *lock(&self.server.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.server.check_installed(&self.model_id)?;
        let content = self.server.next_text(&self.model_id, prompt)?;

        Ok(ModelResponse {
            usage: Some(ModelUsage::new(word_count(prompt), word_count(&content))),
            content,
            model_id: self.model_id.clone(),
            total_duration_ns: None,
            load_duration_ns: None,
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ChunkStream, ServerError> {
        debug!(model_id = %self.model_id, options = ?options, "MockModelClient starting stream");
        self.server.stream_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.server.prompts).push((self.model_id.clone(), prompt.to_string()));
        self.server.check_reachable()?;
        self.server.check_installed(&self.model_id)?;

        let scripted = lock(&self.server.streams).pop_front();
        let records = match scripted {
            Some(records) => records,
            None => {
                let text = self.server.next_text(&self.model_id, prompt)?;
                let mut records: Vec<_> = text
                    .split_inclusive(' ')
                    .map(|word| Ok(StreamChunk { text: word.to_string(), ..StreamChunk::default() }))
                    .collect();
                records.push(Ok(StreamChunk {
                    text: String::new(),
                    done: true,
                    usage: Some(ModelUsage::new(word_count(prompt), word_count(&text))),
                }));
                records
            }
        };

        Ok(Box::pin(stream::iter(records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let server = MockServer::with_models(&["llama3"]);
        server.push_response(Err(ServerError::from_status(502, "bad gateway")));
        server.push_response(Ok("second".to_string()));

        let client = server.factory().create("llama3").unwrap();
        let first = client.generate_text("p", GenerateOptions::default()).await;
        assert_eq!(first.unwrap_err().status, Some(502));
        let second = client.generate_text("p", GenerateOptions::default()).await.unwrap();
        assert_eq!(second.content, "second");
        assert_eq!(server.generate_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_model_is_not_found() {
        let server = MockServer::with_models(&["llama3:latest"]);
        let factory = server.factory();

        assert!(factory.create("llama3").unwrap().generate_text("p", GenerateOptions::default()).await.is_ok());
        let err = factory
            .create("ghost")
            .unwrap()
            .generate_text("p", GenerateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotFound);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let server = MockServer::with_models(&["llama3"]);
        server.set_reachable(false);
        let client = server.factory().create("llama3").unwrap();
        assert_eq!(client.probe().await.unwrap_err().kind, ErrorKind::Connect);
    }

    #[tokio::test]
    async fn test_default_stream_ends_with_terminal_record() {
        let server = MockServer::with_models(&["llama3"]);
        server.push_response(Ok("a b c".to_string()));
        let client = server.factory().create("llama3").unwrap();

        let records: Vec<_> =
            client.generate_stream("p", GenerateOptions::default()).await.unwrap().collect().await;
        let text: String = records.iter().map(|r| r.as_ref().unwrap().text.as_str()).collect();
        assert_eq!(text, "a b c");
        assert!(records.last().unwrap().as_ref().unwrap().done);
    }
}
