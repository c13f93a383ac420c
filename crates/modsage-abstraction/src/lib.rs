//! Model server abstraction layer for modsage.
//!
//! This crate defines the types shared between the orchestration core and the
//! concrete model-server clients: the scan result handed over by the scanner,
//! task descriptors, wire-level request/response shapes, the classified
//! `ServerError`, and the `ModelClient` / `ClientFactory` traits.

pub mod scan;
pub mod task;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scan::{ConfigFile, ScanResult, ScannedFile};
pub use task::{ParseTaskTypeError, TaskType, TimeoutCategory};

/// Classification of a failure at the transport boundary.
///
/// Kinds are derived from the HTTP status code or from the HTTP client's own
/// timeout/connect/decode signals, never from the text of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The server could not be reached at all.
    Connect,
    /// The request did not complete in time.
    Timeout,
    /// Transient server-side failure (HTTP 500, 502, 504).
    Transient,
    /// The server is unavailable or out of resources (HTTP 503, 429).
    Unavailable,
    /// The requested model is not present on the server (HTTP 404).
    ModelNotFound,
    /// Any other non-success HTTP status.
    Http,
    /// The response body could not be decoded.
    Decode,
    /// Connection dropped or another I/O failure mid-request.
    Network,
}

impl ErrorKind {
    /// Classifies a non-success HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::ModelNotFound,
            429 | 503 => Self::Unavailable,
            500 | 502 | 504 => Self::Transient,
            _ => Self::Http,
        }
    }
}

/// An error reported by a model-server client.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?} error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ServerError {
    /// Classified error kind.
    pub kind: ErrorKind,
    /// HTTP status code, when the server answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Human-readable detail.
    pub message: String,
}

impl ServerError {
    /// Creates an error of the given kind without a status code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into() }
    }

    /// Creates an error from a non-success HTTP status and response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::from_status(status), status: Some(status), message: message.into() }
    }

    /// Returns `true` for the upstream status categories that may succeed on retry:
    /// internal error, bad gateway, service unavailable and gateway timeout.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, Some(500 | 502 | 503 | 504))
    }

    /// Returns `true` if a stream may keep being consumed after this error.
    #[must_use]
    pub fn is_recoverable_in_stream(&self) -> bool {
        self.is_retryable() || matches!(self.kind, ErrorKind::Timeout | ErrorKind::Network)
    }
}

/// Generation options sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
}

/// Token accounting reported by the model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,
    /// Number of tokens in the completion.
    pub completion_tokens: u32,
    /// Total number of tokens used.
    pub total_tokens: u32,
}

impl ModelUsage {
    /// Builds usage from the server's prompt and completion counts.
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }
}

/// The response from a blocking generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated content.
    pub content: String,
    /// The model that produced the content.
    pub model_id: String,
    /// Token usage, when reported by the server.
    pub usage: Option<ModelUsage>,
    /// Total server-side duration in nanoseconds.
    pub total_duration_ns: Option<u64>,
    /// Model load duration in nanoseconds.
    pub load_duration_ns: Option<u64>,
}

/// One record of a streaming generation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial response text carried by this record (may be empty).
    pub text: String,
    /// Whether this is the terminal record.
    pub done: bool,
    /// Token usage, reported on the terminal record.
    pub usage: Option<ModelUsage>,
}

/// A lazy, finite, non-restartable sequence of streaming records.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ServerError>> + Send>>;

/// A network client bound to one model on the model server.
///
/// Implementations must be `Send + Sync` so sessions can be loaned across tasks.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Returns the model this client is bound to.
    fn model_id(&self) -> &str;

    /// Lightweight reachability probe against the server.
    async fn probe(&self) -> Result<(), ServerError>;

    /// Lists the model names available on the server.
    async fn list_models(&self) -> Result<Vec<String>, ServerError>;

    /// Generates a complete response for the prompt.
    async fn generate_text(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, ServerError>;

    /// Starts a streaming generation for the prompt.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ChunkStream, ServerError>;
}

/// Opens model clients on demand.
pub trait ClientFactory: Send + Sync {
    /// Creates a client bound to `model`. Reachability is verified separately via `probe`.
    fn create(&self, model: &str) -> Result<Arc<dyn ModelClient>, ServerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_status() {
        assert_eq!(ErrorKind::from_status(404), ErrorKind::ModelNotFound);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Unavailable);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::Unavailable);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::Http);
    }

    #[test]
    fn test_retryable_status_set() {
        for status in [500, 502, 503, 504] {
            assert!(ServerError::from_status(status, "boom").is_retryable(), "{status}");
        }
        for status in [400, 401, 404, 429] {
            assert!(!ServerError::from_status(status, "boom").is_retryable(), "{status}");
        }
        assert!(!ServerError::new(ErrorKind::Connect, "refused").is_retryable());
    }

    #[test]
    fn test_recoverable_in_stream() {
        assert!(ServerError::new(ErrorKind::Timeout, "slow").is_recoverable_in_stream());
        assert!(ServerError::new(ErrorKind::Network, "reset").is_recoverable_in_stream());
        assert!(ServerError::from_status(502, "bad gateway").is_recoverable_in_stream());
        assert!(!ServerError::new(ErrorKind::Decode, "garbage").is_recoverable_in_stream());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::from_status(503, "overloaded");
        assert_eq!(err.to_string(), "Unavailable error (HTTP 503): overloaded");

        let err = ServerError::new(ErrorKind::Connect, "refused");
        assert_eq!(err.to_string(), "Connect error: refused");
    }

    #[test]
    fn test_model_usage_total() {
        let usage = ModelUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }
}
