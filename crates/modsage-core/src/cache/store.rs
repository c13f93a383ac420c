//! File-backed response cache with expiry and LRU-by-size eviction.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CacheEntry, CacheStatistics, CleanupReport};
use crate::config::CacheSettings;

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Error)]
enum EntryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt entry: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    enabled: bool,
    directory: PathBuf,
    max_size_bytes: u64,
    default_ttl: Duration,
    counters: Mutex<Counters>,
    size_check_pending: AtomicBool,
}

/// Content-addressed cache storing one JSON envelope file per key.
///
/// Every failure inside the cache is logged and degraded: reads become misses
/// and writes are dropped. Clones share the same directory and counters.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    /// Creates a cache from configuration.
    #[must_use]
    pub fn new(settings: &CacheSettings) -> Self {
        Self::with_size_cap(settings, settings.max_size_bytes())
    }

    /// Creates a cache with an explicit byte cap instead of `max_size_mb`.
    #[must_use]
    pub fn with_size_cap(settings: &CacheSettings, max_size_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled: settings.enabled,
                directory: settings.directory.clone(),
                max_size_bytes,
                default_ttl: settings.default_ttl(),
                counters: Mutex::new(Counters::default()),
                size_check_pending: AtomicBool::new(false),
            }),
        }
    }

    /// A cache that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&CacheSettings { enabled: false, ..CacheSettings::default() })
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// The directory holding entry files.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Looks up `key`, refreshing its last-access time on a hit.
    ///
    /// Missing, expired, unreadable and undecodable entries are all misses.
    /// Expired entries are deleted.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.inner.enabled {
            return None;
        }
        let Some(path) = self.entry_path(key) else {
            warn!(key = %key, "Rejected malformed cache key");
            self.record_miss();
            return None;
        };

        let now = Utc::now();
        let mut entry = match read_entry(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                self.record_miss();
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache entry, treating as miss");
                self.record_miss();
                return None;
            }
        };

        if entry.is_expired(now) {
            debug!(key = %key, expired_at = %entry.expires_at, "Cache entry expired");
            remove_file(&path).await;
            self.record_miss();
            return None;
        }

        let value = match serde_json::from_str::<T>(&entry.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached payload does not match requested type");
                self.record_miss();
                return None;
            }
        };

        entry.last_accessed = now;
        if let Err(e) = write_entry(&path, &entry).await {
            warn!(key = %key, error = %e, "Failed to refresh cache entry access time");
        }

        debug!(key = %key, "Cache hit");
        self.record_hit();
        Some(value)
    }

    /// Stores `value` under `key` with the configured expiry.
    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) {
        self.set_with_ttl(key, value, self.inner.default_ttl).await;
    }

    /// Stores `value` under `key`, expiring after `ttl`.
    ///
    /// Schedules a background size check that runs `cleanup` when the
    /// directory exceeds the cap.
    pub async fn set_with_ttl<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.inner.enabled {
            return;
        }
        let Some(path) = self.entry_path(key) else {
            warn!(key = %key, "Rejected malformed cache key");
            return;
        };

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache value");
                return;
            }
        };

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            created_at: now,
            last_accessed: now,
            expires_at,
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.inner.directory).await {
            warn!(directory = %self.inner.directory.display(), error = %e, "Failed to create cache directory");
            return;
        }
        if let Err(e) = write_entry(&path, &entry).await {
            warn!(key = %key, error = %e, "Failed to write cache entry");
            return;
        }

        debug!(key = %key, bytes = entry.payload.len(), "Stored cache entry");
        self.schedule_size_check();
    }

    /// Deletes the entry for `key`. Returns `true` if a file was removed.
    pub async fn remove(&self, key: &str) -> bool {
        if !self.inner.enabled {
            return false;
        }
        match self.entry_path(key) {
            Some(path) => remove_file(&path).await,
            None => false,
        }
    }

    /// Deletes every entry. Returns the number of files removed.
    pub async fn clear(&self) -> usize {
        if !self.inner.enabled {
            return 0;
        }
        let mut removed = 0;
        for path in self.list_files(&[ENTRY_EXTENSION, TEMP_EXTENSION]).await {
            if remove_file(&path).await {
                removed += 1;
            }
        }
        info!(removed, "Cleared response cache");
        removed
    }

    /// Current counters and on-disk footprint.
    pub async fn statistics(&self) -> CacheStatistics {
        let (hits, misses, last_cleanup) = {
            let counters = self.counters();
            (counters.hits, counters.misses, counters.last_cleanup)
        };

        let mut total_entries = 0;
        let mut total_size_bytes = 0;
        if self.inner.enabled {
            for path in self.list_files(&[ENTRY_EXTENSION]).await {
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    total_entries += 1;
                    total_size_bytes += meta.len();
                }
            }
        }

        let lookups = hits + misses;
        CacheStatistics {
            hits,
            misses,
            total_entries,
            total_size_bytes,
            last_cleanup,
            hit_ratio: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    /// Two-phase cleanup.
    ///
    /// First deletes expired and corrupt entries, then, while the remaining
    /// size exceeds the cap, deletes valid entries oldest access first.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if !self.inner.enabled {
            return report;
        }

        let now = Utc::now();
        let mut live: Vec<(DateTime<Utc>, u64, PathBuf)> = Vec::new();
        for path in self.list_files(&[ENTRY_EXTENSION]).await {
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            match read_entry(&path).await {
                Ok(Some(entry)) if entry.is_expired(now) => {
                    if remove_file(&path).await {
                        report.expired += 1;
                    }
                }
                Ok(Some(entry)) => live.push((entry.last_accessed, size, path)),
                Ok(None) => {}
                Err(EntryError::Parse(e)) => {
                    debug!(path = %path.display(), error = %e, "Removing corrupt cache entry");
                    if remove_file(&path).await {
                        report.corrupt += 1;
                    }
                }
                Err(EntryError::Io(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }

        let mut total: u64 = live.iter().map(|(_, size, _)| size).sum();
        if total > self.inner.max_size_bytes {
            live.sort_by_key(|(accessed, _, _)| *accessed);
            for (_, size, path) in &live {
                if total <= self.inner.max_size_bytes {
                    break;
                }
                if remove_file(path).await {
                    total -= size;
                    report.evicted += 1;
                }
            }
        }

        report.remaining_entries = live.len() - report.evicted;
        report.remaining_bytes = total;
        self.counters().last_cleanup = Some(Utc::now());

        info!(
            expired = report.expired,
            corrupt = report.corrupt,
            evicted = report.evicted,
            remaining_entries = report.remaining_entries,
            remaining_bytes = report.remaining_bytes,
            "Cache cleanup completed"
        );
        report
    }

    fn schedule_size_check(&self) {
        if self.inner.size_check_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let mut size = 0;
            for path in cache.list_files(&[ENTRY_EXTENSION]).await {
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    size += meta.len();
                }
            }
            if size > cache.inner.max_size_bytes {
                debug!(size, cap = cache.inner.max_size_bytes, "Cache over size cap");
                cache.cleanup().await;
            }
            cache.inner.size_check_pending.store(false, Ordering::Release);
        });
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        let valid = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.inner.directory.join(format!("{key}.{ENTRY_EXTENSION}")))
    }

    async fn list_files(&self, extensions: &[&str]) -> Vec<PathBuf> {
        let mut dir = match tokio::fs::read_dir(&self.inner.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(directory = %self.inner.directory.display(), error = %e, "Failed to list cache directory");
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext));
            if matches {
                files.push(path);
            }
        }
        files
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.inner.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_hit(&self) {
        self.counters().hits += 1;
    }

    fn record_miss(&self) {
        self.counters().misses += 1;
    }
}

async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, EntryError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes through a uniquely named temporary file so readers never see a partial entry.
async fn write_entry(path: &Path, entry: &CacheEntry) -> Result<(), EntryError> {
    let bytes = serde_json::to_vec(entry)?;
    let temp = path.with_extension(format!("{}.{TEMP_EXTENSION}", Uuid::new_v4().simple()));
    tokio::fs::write(&temp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            false
        }
    }
}
