//! Installed-model catalog and fallback selection.

use std::sync::Arc;
use std::time::Duration;

use modsage_abstraction::{ClientFactory, ServerError};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AnalysisError;

/// Known-good models tried in order when the requested one is not installed.
pub const FALLBACK_MODELS: [&str; 7] =
    ["llama3.2:3b", "llama3.2", "llama3.1:8b", "llama3", "mistral", "phi3", "gemma2"];

#[derive(Debug, Clone)]
struct Snapshot {
    models: Vec<String>,
    expires_at: Instant,
}

/// The server's model list, cached until an explicit expiry time.
pub struct ModelCatalog {
    factory: Arc<dyn ClientFactory>,
    lookup_model: String,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCatalog")
            .field("lookup_model", &self.lookup_model)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ModelCatalog {
    /// Creates a catalog listing models through a client bound to `lookup_model`.
    pub fn new(factory: Arc<dyn ClientFactory>, lookup_model: impl Into<String>, ttl: Duration) -> Self {
        Self { factory, lookup_model: lookup_model.into(), ttl, snapshot: RwLock::new(None) }
    }

    /// The installed models, fetched again once the cached list expires.
    pub async fn models(&self) -> Result<Vec<String>, ServerError> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.expires_at > Instant::now() {
                return Ok(snapshot.models.clone());
            }
        }

        let mut slot = self.snapshot.write().await;
        if let Some(snapshot) = slot.as_ref() {
            if snapshot.expires_at > Instant::now() {
                return Ok(snapshot.models.clone());
            }
        }
        let models = self.fetch().await?;
        *slot = Some(Snapshot { models: models.clone(), expires_at: Instant::now() + self.ttl });
        Ok(models)
    }

    /// Fetches the model list now, replacing any cached one.
    pub async fn refresh(&self) -> Result<Vec<String>, ServerError> {
        let models = self.fetch().await?;
        *self.snapshot.write().await =
            Some(Snapshot { models: models.clone(), expires_at: Instant::now() + self.ttl });
        Ok(models)
    }

    /// Drops the cached list.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    async fn fetch(&self) -> Result<Vec<String>, ServerError> {
        let client = self.factory.create(&self.lookup_model)?;
        let models = client.list_models().await?;
        debug!(count = models.len(), "Fetched installed model list");
        Ok(models)
    }
}

/// Returns `true` if `installed` satisfies a request for `requested`.
///
/// An untagged name matches its `:latest` tag and vice versa.
pub fn model_matches(requested: &str, installed: &str) -> bool {
    let strip = |name: &str| name.strip_suffix(":latest").unwrap_or(name).to_string();
    requested == installed || strip(requested) == strip(installed)
}

/// The model chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResolution {
    /// Model to call.
    pub model: String,
    /// The requested model, when a fallback replaced it.
    pub replaced: Option<String>,
}

impl ModelResolution {
    /// The requested model, unchanged.
    pub fn requested(model: &str) -> Self {
        Self { model: model.to_string(), replaced: None }
    }
}

/// Picks the model to call when `requested` may not be installed.
///
/// Tries the requested model, then each fallback in order, then the first
/// installed model.
///
/// # Errors
/// `NoSuitableFallback` naming every candidate when nothing is installed.
pub fn resolve_model(requested: &str, installed: &[String]) -> Result<ModelResolution, AnalysisError> {
    let present = |candidate: &str| installed.iter().any(|m| model_matches(candidate, m));
    if present(requested) {
        return Ok(ModelResolution::requested(requested));
    }

    let mut attempted = vec![requested.to_string()];
    for candidate in FALLBACK_MODELS {
        if model_matches(candidate, requested) {
            continue;
        }
        attempted.push(candidate.to_string());
        if present(candidate) {
            return Ok(ModelResolution {
                model: candidate.to_string(),
                replaced: Some(requested.to_string()),
            });
        }
    }

    match installed.first() {
        Some(first) => Ok(ModelResolution { model: first.clone(), replaced: Some(requested.to_string()) }),
        None => Err(AnalysisError::NoSuitableFallback { attempted }),
    }
}
