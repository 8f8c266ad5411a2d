//! File-backed store behind the single-flight facade.

use super::key;
use bytes::Bytes;
use palisade_cache::{EntryStore, FsCache, Lookup, ResponseCache};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fs_cache(dir: &std::path::Path, ttl: Duration) -> ResponseCache {
    let store = FsCache::new(dir, 1 << 20, 1000).unwrap();
    ResponseCache::builder("fs", Arc::new(store))
        .ttl(ttl)
        .grace(Duration::from_millis(200))
        .build()
}

#[tokio::test]
async fn committed_entry_roundtrips_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let cache = fs_cache(dir.path(), Duration::from_secs(60));
    let k = key("SELECT number FROM system.numbers LIMIT 10");
    let payload = Bytes::from(vec![7u8; 4096]);

    let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
        panic!("expected miss");
    };
    guard
        .commit(payload.clone(), "application/octet-stream".into(), "gzip".into())
        .await
        .unwrap();

    let Lookup::Hit(entry) = cache.get(&k).await.unwrap() else {
        panic!("expected hit");
    };
    assert_eq!(entry.payload, payload);
    assert_eq!(entry.content_type, "application/octet-stream");
    assert_eq!(entry.content_encoding, "gzip");
}

#[tokio::test]
async fn entries_survive_cache_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let k = key("SELECT 1");
    {
        let cache = fs_cache(dir.path(), Duration::from_secs(60));
        let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
            panic!("expected miss");
        };
        guard
            .commit(Bytes::from_static(b"Ok.\n"), "text/plain".into(), String::new())
            .await
            .unwrap();
    }

    // A fresh instance over the same directory serves the entry.
    let cache = fs_cache(dir.path(), Duration::from_secs(60));
    let Lookup::Hit(entry) = cache.get(&k).await.unwrap() else {
        panic!("expected hit after reopen");
    };
    assert_eq!(entry.payload.as_ref(), b"Ok.\n");
}

#[tokio::test]
async fn expired_entry_misses_again() {
    let dir = tempfile::tempdir().unwrap();
    let cache = fs_cache(dir.path(), Duration::from_millis(40));
    let k = key("SELECT now()");

    let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
        panic!("expected miss");
    };
    guard
        .commit(Bytes::from_static(b"x"), String::new(), String::new())
        .await
        .unwrap();
    assert!(matches!(cache.get(&k).await.unwrap(), Lookup::Hit(_)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(cache.get(&k).await.unwrap(), Lookup::Miss(_)));
}

#[tokio::test]
async fn distinct_keys_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let cache = fs_cache(dir.path(), Duration::from_secs(60));

    let mut base = key("SELECT 1");
    let Lookup::Miss(guard) = cache.get(&base).await.unwrap() else {
        panic!("expected miss");
    };
    guard
        .commit(Bytes::from_static(b"one"), String::new(), String::new())
        .await
        .unwrap();

    // Same query, different database: a different entry.
    base.database = "reports".into();
    assert!(matches!(cache.get(&base).await.unwrap(), Lookup::Miss(_)));
}

#[tokio::test]
async fn sweeper_enforces_the_item_bound() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsCache::new(dir.path(), 1 << 20, 3)
        .unwrap()
        .sweep_interval(Duration::from_millis(25));
    let shutdown = CancellationToken::new();
    store.start(shutdown.clone());
    let stats_store = Arc::new(store);
    let cache = ResponseCache::builder("fs", Arc::clone(&stats_store) as Arc<dyn EntryStore>)
        .ttl(Duration::from_secs(60))
        .build();

    for i in 0..10 {
        let k = key(&format!("SELECT {i}"));
        if let Lookup::Miss(guard) = cache.get(&k).await.unwrap() {
            guard
                .commit(Bytes::from(vec![0u8; 128]), String::new(), String::new())
                .await
                .unwrap();
        }
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = cache.stats().await;
    assert!(stats.items <= 3, "items = {}", stats.items);
    shutdown.cancel();
}
