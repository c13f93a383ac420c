//! Model-server clients for modsage.
//!
//! This crate provides concrete implementations of the `ModelClient` and
//! `ClientFactory` traits.
//!
//! # Supported Backends
//!
//! - **Ollama**: Local models via Ollama's HTTP API (no API key, local execution)
//! - **Mock**: In-process server for tests and offline development

pub mod factory;
pub mod mock;
pub mod ndjson;
pub mod ollama;

pub use factory::OllamaClientFactory;
pub use mock::{MockClientFactory, MockModelClient, MockServer};
pub use ndjson::NdjsonStream;
pub use ollama::{DEFAULT_BASE_URL, OllamaClient};
