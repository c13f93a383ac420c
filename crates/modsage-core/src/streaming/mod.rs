//! Streaming response handling.
//!
//! A single consumer drains each stream in source order. Chunks are never
//! processed concurrently, so `on_chunk` sees fragments exactly as produced.

mod handler;
mod sanitize;
mod types;

pub use handler::{StreamingHandler, replay_chunks};
pub use sanitize::{LineEndingNormalizer, strip_control_chars};
pub use types::{StreamCallbacks, StreamOptions, StreamOutcome, StreamProgress, StreamingContext};
