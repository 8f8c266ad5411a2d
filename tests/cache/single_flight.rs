//! Leader election and follower outcomes under concurrency.

use super::key;
use bytes::Bytes;
use palisade_cache::{Lookup, MemoryKv, ResponseCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn memory_cache(grace: Duration) -> Arc<ResponseCache> {
    Arc::new(
        ResponseCache::builder("mem", Arc::new(MemoryKv::new()))
            .ttl(Duration::from_secs(60))
            .grace(grace)
            .build(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_misses_elect_exactly_one_leader() {
    let cache = memory_cache(Duration::from_secs(1));
    let k = key("SELECT expensive()");
    let upstream_calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        let k = k.clone();
        let upstream_calls = Arc::clone(&upstream_calls);
        handles.push(tokio::spawn(async move {
            match cache.get(&k).await.unwrap() {
                Lookup::Miss(guard) => {
                    // Simulated upstream execution.
                    upstream_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    guard
                        .commit(Bytes::from_static(b"result"), String::new(), String::new())
                        .await
                        .unwrap();
                    Bytes::from_static(b"result")
                }
                Lookup::Hit(entry) => entry.payload,
                other => panic!(
                    "unexpected outcome: {}",
                    match other {
                        Lookup::Failed(m) => format!("failed: {m}"),
                        Lookup::GraceExpired => "grace expired".into(),
                        _ => unreachable!(),
                    }
                ),
            }
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().as_ref(), b"result");
    }
    // Exactly one task contacted the upstream.
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_observe_the_leaders_error() {
    let cache = memory_cache(Duration::from_secs(1));
    let k = key("SELECT broken()");

    let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
        panic!("expected miss");
    };

    let follower = {
        let cache = Arc::clone(&cache);
        let k = k.clone();
        tokio::spawn(async move { cache.get(&k).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    guard.rollback("table does not exist".into()).await.unwrap();

    match follower.await.unwrap() {
        Lookup::Failed(message) => assert_eq!(message, "table does not exist"),
        _ => panic!("follower must see the rollback error without re-running"),
    }
}

#[tokio::test]
async fn follower_gives_up_after_grace() {
    let cache = memory_cache(Duration::from_millis(50));
    let k = key("SELECT eternal()");

    let Lookup::Miss(_leader_guard) = cache.get(&k).await.unwrap() else {
        panic!("expected miss");
    };

    let started = std::time::Instant::now();
    match cache.get(&k).await.unwrap() {
        Lookup::GraceExpired => {}
        _ => panic!("expected grace expiry"),
    }
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
    assert!(waited < Duration::from_millis(500), "waited {waited:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_leader_does_not_wedge_the_key() {
    let cache = memory_cache(Duration::from_millis(400));
    let k = key("SELECT flaky()");

    {
        let Lookup::Miss(_guard) = cache.get(&k).await.unwrap() else {
            panic!("expected miss");
        };
        // Guard dropped without commit or rollback (client vanished).
    }

    // The key is immediately fillable again.
    let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
        panic!("expected a fresh leader");
    };
    guard
        .commit(Bytes::from_static(b"second try"), String::new(), String::new())
        .await
        .unwrap();
    assert!(matches!(cache.get(&k).await.unwrap(), Lookup::Hit(_)));
}

#[tokio::test]
async fn tombstone_prevents_stampede_then_expires() {
    let cache = Arc::new(
        ResponseCache::builder("mem", Arc::new(MemoryKv::new()))
            .ttl(Duration::from_secs(60))
            .grace(Duration::from_millis(100))
            .negative_ttl(Duration::from_millis(60))
            .build(),
    );
    let k = key("SELECT 1/0");

    let Lookup::Miss(guard) = cache.get(&k).await.unwrap() else {
        panic!("expected miss");
    };
    guard.rollback("division by zero".into()).await.unwrap();

    // Within the negative TTL the error is served as-is.
    assert!(matches!(cache.get(&k).await.unwrap(), Lookup::Failed(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(cache.get(&k).await.unwrap(), Lookup::Miss(_)));
}
