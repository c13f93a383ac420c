//! Integration tests for the response cache.

use std::time::Duration;

use modsage_core::cache::{ResponseCache, generate_key};
use modsage_core::config::CacheSettings;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    text: String,
    score: u32,
}

fn settings(dir: &TempDir) -> CacheSettings {
    CacheSettings { directory: dir.path().to_path_buf(), ..CacheSettings::default() }
}

fn payload(text: &str) -> Payload {
    Payload { text: text.repeat(20), score: 7 }
}

#[tokio::test]
async fn test_lru_eviction_spares_recently_accessed() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(&settings(&temp_dir));

    for key in ["k1", "k2", "k3"] {
        cache.set(key, &payload(key)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let touched: Option<Payload> = cache.get("k1").await;
    assert!(touched.is_some());

    let total = cache.statistics().await.total_size_bytes;
    let tight = ResponseCache::with_size_cap(&settings(&temp_dir), total - 1);
    let report = tight.cleanup().await;

    assert_eq!(report.evicted, 1);
    assert_eq!(report.remaining_entries, 2);
    assert!(report.remaining_bytes < total);
    assert!(tight.get::<Payload>("k2").await.is_none());
    assert!(tight.get::<Payload>("k1").await.is_some());
    assert!(tight.get::<Payload>("k3").await.is_some());
}

#[tokio::test]
async fn test_eviction_order_follows_access_time() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(&settings(&temp_dir));

    for key in ["a", "b", "c", "d"] {
        cache.set(key, &payload(key)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for key in ["c", "a"] {
        let _: Option<Payload> = cache.get(key).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Access order is now b, d, c, a. A cap of one entry keeps only the newest.
    let single = cache.statistics().await.total_size_bytes / 4 + 16;
    let tight = ResponseCache::with_size_cap(&settings(&temp_dir), single);
    let report = tight.cleanup().await;

    assert_eq!(report.evicted, 3);
    assert!(tight.get::<Payload>("a").await.is_some());
    for evicted in ["b", "c", "d"] {
        assert!(tight.get::<Payload>(evicted).await.is_none(), "{evicted} should be evicted");
    }
}

#[tokio::test]
async fn test_disabled_cache_is_inert() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(&CacheSettings { enabled: false, ..settings(&temp_dir) });

    cache.set("key", &payload("x")).await;
    cache.set("key", &payload("y")).await;
    assert!(cache.get::<Payload>("key").await.is_none());
    assert!(cache.get::<Payload>("key").await.is_none());

    let stats = cache.statistics().await;
    assert_eq!(stats.total_entries, 0);
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_expired_entry_removed_on_read() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ResponseCache::new(&settings(&temp_dir));

    cache.set_with_ttl("short", &payload("s"), Duration::from_millis(20)).await;
    cache.set("long", &payload("l")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(cache.get::<Payload>("short").await.is_none());
    assert_eq!(cache.get::<Payload>("long").await, Some(payload("l")));
    assert!(!temp_dir.path().join("short.json").exists());
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let key = generate_key("prompt", "llama3.2:3b", 0.3, &["quick"]);

    ResponseCache::new(&settings(&temp_dir)).set(&key, &payload("persisted")).await;
    let reopened = ResponseCache::new(&settings(&temp_dir));
    assert_eq!(reopened.get::<Payload>(&key).await, Some(payload("persisted")));
}

#[test]
fn test_key_changes_with_each_argument() {
    let base = generate_key("content", "llama3", 0.3, &["quick"]);
    let variants = [
        generate_key("content!", "llama3", 0.3, &["quick"]),
        generate_key("content", "llama3:8b", 0.3, &["quick"]),
        generate_key("content", "llama3", 0.4, &["quick"]),
        generate_key("content", "llama3", 0.3, &["full"]),
        generate_key("content", "llama3", 0.3, &[]),
    ];

    assert_eq!(base, generate_key("content", "llama3", 0.3, &["quick"]));
    for variant in &variants {
        assert_ne!(&base, variant);
    }
}
