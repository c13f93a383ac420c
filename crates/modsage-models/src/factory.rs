//! Client factory for opening per-model Ollama clients.
//!
//! All clients created by one factory share a single pooled `reqwest::Client`,
//! so sessions for different models reuse TCP connections to the same server.

use std::sync::Arc;
use std::time::Duration;

use modsage_abstraction::{ClientFactory, ErrorKind, ModelClient, ServerError};
use reqwest::Client;
use tracing::debug;

use crate::OllamaClient;

/// Factory producing `OllamaClient`s bound to a base URL.
#[derive(Debug, Clone)]
pub struct OllamaClientFactory {
    base_url: String,
    http: Client,
    probe_timeout: Duration,
}

impl OllamaClientFactory {
    /// Creates a factory for the server at `base_url`.
    ///
    /// # Errors
    /// Returns a `ServerError` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, probe_timeout: Duration) -> Result<Self, ServerError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                ServerError::new(ErrorKind::Network, format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self { base_url: base_url.into(), http, probe_timeout })
    }

    /// The server address clients are bound to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ClientFactory for OllamaClientFactory {
    fn create(&self, model: &str) -> Result<Arc<dyn ModelClient>, ServerError> {
        debug!(model_id = %model, base_url = %self.base_url, "Creating Ollama client");
        let client =
            OllamaClient::with_http_client(model.to_string(), self.base_url.clone(), self.http.clone())
                .with_probe_timeout(self.probe_timeout);
        Ok(Arc::new(client))
    }
}
