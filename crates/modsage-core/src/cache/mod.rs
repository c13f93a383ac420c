//! Response cache.
//!
//! Analysis results are cached on disk, one JSON envelope per key, so repeated
//! requests with identical prompt, model, temperature and task skip the model
//! server entirely. The cache is a best-effort optimization: concurrent writers
//! of the same key race with last-writer-wins, and no failure escapes it.

mod key;
mod store;
mod types;

pub use key::{CACHE_SCHEMA_VERSION, generate_key};
pub use store::ResponseCache;
pub use types::{CacheEntry, CacheStatistics, CleanupReport};
