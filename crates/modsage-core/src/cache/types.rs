//! On-disk entry envelope and statistics types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The JSON envelope stored in one file per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The entry's key (also its file stem).
    pub key: String,
    /// The cached value, serialized as JSON text.
    pub payload: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry was last read or written.
    pub last_accessed: DateTime<Utc>,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns `true` if the entry is past its expiry time at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CacheStatistics {
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// Entry files currently on disk.
    pub total_entries: usize,
    /// Aggregate size of entry files in bytes.
    pub total_size_bytes: u64,
    /// When `cleanup` last completed.
    pub last_cleanup: Option<DateTime<Utc>>,
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub hit_ratio: f64,
}

/// What a `cleanup` pass removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupReport {
    /// Entries removed because they had expired.
    pub expired: usize,
    /// Files removed because they could not be parsed.
    pub corrupt: usize,
    /// Valid entries evicted to get under the size cap.
    pub evicted: usize,
    /// Entries left on disk.
    pub remaining_entries: usize,
    /// Bytes left on disk.
    pub remaining_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".to_string(),
            payload: "1".to_string(),
            created_at: now,
            last_accessed: now,
            expires_at: now + Duration::seconds(5),
        };
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::seconds(5)));
    }
}
