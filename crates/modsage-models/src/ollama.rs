//! Ollama model client.
//!
//! This module provides an implementation of the `ModelClient` trait for Ollama's local API:
//! `GET /api/tags` for reachability and model listing, `POST /api/generate` for blocking and
//! newline-delimited streaming generation.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use modsage_abstraction::{
    ChunkStream, ErrorKind, GenerateOptions, ModelClient, ModelResponse, ServerError,
};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::ndjson::{GenerateRecord, NdjsonStream};

/// Default Ollama server address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ollama client bound to one model.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    /// The model ID (e.g., "llama3.1:8b").
    model_id: String,
    /// The base URL for the Ollama API (default: "http://localhost:11434").
    base_url: String,
    /// HTTP client for making requests. Cloning shares the connection pool.
    client: Client,
    /// Ceiling for `probe` and `list_models`.
    probe_timeout: Duration,
}

impl OllamaClient {
    /// Creates a new `OllamaClient` against the default server URL.
    #[must_use]
    pub fn new(model_id: String) -> Self {
        Self::with_base_url(model_id, DEFAULT_BASE_URL.to_string())
    }

    /// Creates a new `OllamaClient` with a custom base URL.
    ///
    /// # Arguments
    /// * `model_id` - The Ollama model ID to use
    /// * `base_url` - The base URL for the Ollama API (e.g., "http://192.168.1.100:11434")
    #[must_use]
    pub fn with_base_url(model_id: String, base_url: String) -> Self {
        Self::with_http_client(model_id, base_url, Client::new())
    }

    /// Creates a new `OllamaClient` that shares an existing HTTP client.
    #[must_use]
    pub fn with_http_client(model_id: String, base_url: String, client: Client) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { model_id, base_url, client, probe_timeout: DEFAULT_PROBE_TIMEOUT }
    }

    /// Overrides the timeout used by `probe` and `list_models`.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// The base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn build_request(&self, prompt: &str, options: GenerateOptions, stream: bool) -> OllamaGenerateRequest {
        OllamaGenerateRequest {
            model: self.model_id.clone(),
            prompt: prompt.to_string(),
            stream,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        }
    }

    /// Classifies a `reqwest` failure by the client's own signals.
    fn transport_error(&self, e: &reqwest::Error) -> ServerError {
        if e.is_timeout() {
            ServerError::new(ErrorKind::Timeout, format!("Request to Ollama timed out: {e}"))
        } else if e.is_connect() {
            ServerError::new(
                ErrorKind::Connect,
                format!(
                    "Ollama server not reachable at {}. Start it with 'ollama serve'.",
                    self.base_url
                ),
            )
        } else if e.is_decode() {
            ServerError::new(ErrorKind::Decode, format!("Failed to parse response: {e}"))
        } else {
            ServerError::new(ErrorKind::Network, format!("Network error: {e}"))
        }
    }

    /// Turns a non-success response into a classified error.
    async fn status_error(&self, response: Response) -> ServerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<OllamaError>(&body).map_or(body, |e| e.error);

        error!(
            status = %status,
            error = %detail,
            model_id = %self.model_id,
            "Ollama API returned error status"
        );

        let message = if status.as_u16() == 404 {
            format!(
                "Model '{}' not found. Pull it with 'ollama pull {}'.",
                self.model_id, self.model_id
            )
        } else {
            format!("API error ({status}): {detail}")
        };
        ServerError::from_status(status.as_u16(), message)
    }

    async fn fetch_tags(&self) -> Result<OllamaTagsResponse, ServerError> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        response.json::<OllamaTagsResponse>().await.map_err(|e| self.transport_error(&e))
    }

    async fn post_generate(&self, request: &OllamaGenerateRequest) -> Result<Response, ServerError> {
        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, base_url = %self.base_url, "Failed to connect to Ollama");
                self.transport_error(&e)
            })?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        Ok(response)
    }
}

// Ollama API request/response structures
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>, // max_tokens equivalent
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn probe(&self) -> Result<(), ServerError> {
        self.fetch_tags().await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<String>, ServerError> {
        let tags = self.fetch_tags().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, ServerError> {
        debug!(
            model_id = %self.model_id,
            prompt_len = prompt.len(),
            options = ?options,
            "OllamaClient generating text"
        );

        let request = self.build_request(prompt, options, false);
        let response = self.post_generate(&request).await?;

        let record: GenerateRecord = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse Ollama API response");
            self.transport_error(&e)
        })?;

        if let Some(message) = record.error {
            return Err(ServerError::new(ErrorKind::Http, message));
        }

        let usage = record.usage();
        let model_id = if record.model.is_empty() { self.model_id.clone() } else { record.model };

        Ok(ModelResponse {
            content: record.response,
            model_id,
            usage,
            total_duration_ns: record.total_duration,
            load_duration_ns: record.load_duration,
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ChunkStream, ServerError> {
        debug!(
            model_id = %self.model_id,
            prompt_len = prompt.len(),
            options = ?options,
            "OllamaClient starting stream"
        );

        let request = self.build_request(prompt, options, true);
        let response = self.post_generate(&request).await?;

        let this = self.clone();
        let body = response.bytes_stream().map_err(move |e| this.transport_error(&e));
        Ok(Box::pin(NdjsonStream::new(Box::pin(body))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use modsage_abstraction::ModelUsage;

    #[test]
    fn test_ollama_client_new() {
        let client = OllamaClient::new("llama3".to_string());
        assert_eq!(client.model_id(), "llama3");
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            OllamaClient::with_base_url("llama3".to_string(), "http://10.0.0.5:11434/".to_string());
        assert_eq!(client.endpoint("api/tags"), "http://10.0.0.5:11434/api/tags");
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"models": [{"name": "llama3:latest"}, {"name": "mistral:7b"}]}"#)
            .create_async()
            .await;

        let client = OllamaClient::with_base_url("llama3".to_string(), server.url());
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3:latest", "mistral:7b"]);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_connect_error() {
        let client =
            OllamaClient::with_base_url("llama3".to_string(), "http://127.0.0.1:1".to_string());
        let err = client.probe().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connect);
        assert!(err.message.contains("ollama serve"));
    }

    #[tokio::test]
    async fn test_generate_text_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "llama3",
                "stream": false,
                "options": {"num_predict": 256}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model": "llama3", "response": "No conflicts found.", "done": true,
                    "prompt_eval_count": 40, "eval_count": 5,
                    "total_duration": 1500000000, "load_duration": 20000000}"#,
            )
            .create_async()
            .await;

        let client = OllamaClient::with_base_url("llama3".to_string(), server.url());
        let options = GenerateOptions { temperature: Some(0.3), max_tokens: Some(256) };
        let response = client.generate_text("Analyze", options).await.unwrap();

        assert_eq!(response.content, "No conflicts found.");
        assert_eq!(response.model_id, "llama3");
        assert_eq!(response.usage, Some(ModelUsage::new(40, 5)));
        assert_eq!(response.total_duration_ns, Some(1_500_000_000));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_text_model_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(404)
            .with_body(r#"{"error": "model 'ghost' not found, try pulling it first"}"#)
            .create_async()
            .await;

        let client = OllamaClient::with_base_url("ghost".to_string(), server.url());
        let err = client.generate_text("Hi", GenerateOptions::default()).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ModelNotFound);
        assert_eq!(err.status, Some(404));
        assert!(err.message.contains("ollama pull ghost"));
    }

    #[tokio::test]
    async fn test_generate_text_transient_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = OllamaClient::with_base_url("llama3".to_string(), server.url());
        let err = client.generate_text("Hi", GenerateOptions::default()).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_generate_stream_yields_records_in_order() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "{\"model\":\"llama3\",\"response\":\"Two \",\"done\":false}\n",
            "{\"model\":\"llama3\",\"response\":\"mods \",\"done\":false}\n",
            "{\"model\":\"llama3\",\"response\":\"clash.\",\"done\":false}\n",
            "{\"model\":\"llama3\",\"response\":\"\",\"done\":true,\"prompt_eval_count\":10,\"eval_count\":3}\n",
        );
        let _mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(body)
            .create_async()
            .await;

        let client = OllamaClient::with_base_url("llama3".to_string(), server.url());
        let stream = client.generate_stream("Go", GenerateOptions::default()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;

        let text: String = chunks.iter().map(|c| c.as_ref().unwrap().text.as_str()).collect();
        assert_eq!(text, "Two mods clash.");
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.usage, Some(ModelUsage::new(10, 3)));
    }
}
