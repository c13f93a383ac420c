//! modsage core - AI orchestration for modded-installation analysis.
//!
//! This crate provides:
//! - A disk-backed response cache with TTL and LRU eviction
//! - Content preprocessing of scan results into token-budgeted prompts
//! - Per-model session pooling with health checks
//! - Streaming response handling with recovery and progress reporting
//! - The `AiAssistant` orchestrator tying them together
//!
//! # Example
//!
//! ```rust,no_run
//! use modsage_core::{AiAssistant, TaskType, config::load_config};
//! use modsage_abstraction::ScanResult;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config(std::path::Path::new("modsage.toml"))?;
//!     let assistant = AiAssistant::new(config)?;
//!     assistant.start();
//!
//!     let scan = ScanResult::empty("/srv/pack");
//!     let result = assistant.analyze(&scan, TaskType::Quick, None, &CancellationToken::new()).await;
//!     println!("{}", result.content);
//!
//!     assistant.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod assistant;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod preprocess;
pub mod session;
pub mod streaming;
pub mod telemetry;

pub use assistant::{AiAssistant, AnalysisOutcome, AnalysisResult, CachedAnalysis};
pub use cache::{ResponseCache, generate_key};
pub use config::{AppConfig, ConfigError, load_config};
pub use error::{AnalysisError, SessionError, StreamError};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use modsage_abstraction::TaskType;
pub use preprocess::{ContentPreprocessor, PreprocessedContent};
pub use session::{SessionLease, SessionManager};
pub use streaming::{StreamCallbacks, StreamingHandler};
pub use telemetry::{LogFormat, init_tracing};
