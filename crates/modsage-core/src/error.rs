//! Error types for the analysis core.

use modsage_abstraction::{ErrorKind, ServerError};
use thiserror::Error;

/// Errors raised by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The caller cancelled while waiting for a pool slot or a probe.
    #[error("Session acquisition cancelled")]
    Cancelled,

    /// A new session could not be opened or failed its reachability probe.
    #[error("Failed to open session for model '{model}': {source}")]
    Connect {
        /// Model the session was requested for.
        model: String,
        /// Underlying client error.
        #[source]
        source: ServerError,
    },

    /// The manager has been shut down.
    #[error("Session manager is shut down")]
    ShutDown,
}

/// Errors raised by the streaming handler.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The chunk source failed with an unrecoverable error or exhausted its retries.
    #[error("Stream failed: {0}")]
    Server(#[from] ServerError),

    /// Writing to the output sink failed.
    #[error("Stream sink error: {0}")]
    Sink(#[from] std::io::Error),

    /// The caller cancelled the stream.
    #[error("Stream cancelled")]
    Cancelled,
}

/// Errors raised at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The caller cancelled the request.
    #[error("Analysis cancelled")]
    Cancelled,

    /// The task-category ceiling elapsed.
    #[error("Analysis timed out after {seconds}s")]
    Timeout {
        /// The ceiling that elapsed.
        seconds: u64,
    },

    /// A session could not be acquired.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The model server returned an error.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Stream processing failed.
    #[error(transparent)]
    Stream(StreamError),

    /// Neither the requested model nor any fallback is installed.
    #[error("No suitable fallback model found (attempted: {})", attempted.join(", "))]
    NoSuitableFallback {
        /// Every candidate that was tried, in order.
        attempted: Vec<String>,
    },

    /// The stream ended without a terminal record.
    #[error("Model stream ended before completion")]
    IncompleteStream,
}

impl From<StreamError> for AnalysisError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Cancelled => Self::Cancelled,
            other => Self::Stream(other),
        }
    }
}

impl AnalysisError {
    /// Returns `true` if the caller cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Session(SessionError::Cancelled))
    }

    /// The human-readable message placed in `AnalysisResult::errors`.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled | Self::Session(SessionError::Cancelled) => {
                "Analysis was cancelled by the user.".to_string()
            }
            Self::Timeout { seconds } => format!(
                "Request timed out after {seconds} seconds. The model may still be loading or the \
                 server is overloaded. Try again or reduce the request complexity."
            ),
            Self::Server(err)
            | Self::Stream(StreamError::Server(err))
            | Self::Session(SessionError::Connect { source: err, .. }) => server_message(err),
            Self::NoSuitableFallback { .. } | Self::IncompleteStream => self.to_string(),
            other => format!("Analysis failed: {other}"),
        }
    }
}

fn server_message(err: &ServerError) -> String {
    match err.kind {
        ErrorKind::Unavailable => format!(
            "AI service is unavailable or out of resources. Please try again later. ({})",
            err.message
        ),
        ErrorKind::Transient => format!(
            "The AI server reported a transient error. Please retry. ({})",
            err.message
        ),
        ErrorKind::Timeout => format!(
            "Request to the AI server timed out. Try again or reduce the request complexity. ({})",
            err.message
        ),
        ErrorKind::Connect => format!("Cannot reach the AI server: {}", err.message),
        ErrorKind::ModelNotFound => format!("Model not available: {}", err.message),
        ErrorKind::Http | ErrorKind::Decode | ErrorKind::Network => {
            format!("Analysis failed: {err}")
        }
    }
}
