//! Key/value entry store.
//!
//! Entries are stored as a small JSON envelope
//! `{"l":<int>, "t":<string>, "enc":<string>, "payload":<base64>}`;
//! base64 because the transport preserves only valid UTF-8. Expiry is
//! delegated to the store's own TTL support. The in-memory
//! [`MemoryKv`] implementation backs tests and single-process
//! deployments; network stores implement [`KeyValueStore`] the same
//! way.

use crate::{CacheEntry, CacheError, CacheStats, EntryStore, Stored};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Minimal TTL-aware KV seam the envelope cache is generic over.
pub trait KeyValueStore: Send + Sync {
    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>>;
    fn store(&self, key: &str, value: String, ttl: Duration)
        -> BoxFuture<'_, Result<(), CacheError>>;
    fn stats(&self) -> BoxFuture<'_, CacheStats>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "l")]
    length: u64,
    #[serde(rename = "t")]
    content_type: String,
    #[serde(rename = "enc")]
    content_encoding: String,
    payload: String,
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Envelope cache over any [`KeyValueStore`].
pub struct KvCache<S> {
    store: S,
}

impl<S: KeyValueStore> KvCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> EntryStore for KvCache<S> {
    fn get(&self, fingerprint: &str) -> BoxFuture<'_, Result<Option<Stored>, CacheError>> {
        let key = fingerprint.to_string();
        async move {
            let Some(raw) = self.store.fetch(&key).await? else {
                return Ok(None);
            };
            let envelope: Envelope = serde_json::from_str(&raw)?;
            if let Some(message) = envelope.error {
                // TTL already enforced by the store; any readable
                // tombstone is still live.
                return Ok(Some(Stored::Failure {
                    message,
                    expires: SystemTime::now(),
                }));
            }
            let payload = BASE64
                .decode(envelope.payload.as_bytes())
                .map_err(|err| CacheError::Corrupt(format!("invalid payload base64: {err}")))?;
            if payload.len() as u64 != envelope.length {
                return Err(CacheError::Corrupt(format!(
                    "payload length {} does not match envelope length {}",
                    payload.len(),
                    envelope.length
                )));
            }
            Ok(Some(Stored::Success(CacheEntry {
                payload: Bytes::from(payload),
                content_type: envelope.content_type,
                content_encoding: envelope.content_encoding,
                created: SystemTime::now(),
                expires: None,
            })))
        }
        .boxed()
    }

    fn put(&self, fingerprint: &str, stored: Stored) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = fingerprint.to_string();
        async move {
            let now = SystemTime::now();
            let (envelope, ttl) = match stored {
                Stored::Success(entry) => {
                    let ttl = entry
                        .expires
                        .and_then(|at| at.duration_since(now).ok())
                        .unwrap_or(Duration::from_secs(60));
                    (
                        Envelope {
                            length: entry.payload.len() as u64,
                            content_type: entry.content_type,
                            content_encoding: entry.content_encoding,
                            payload: BASE64.encode(&entry.payload),
                            error: None,
                        },
                        ttl,
                    )
                }
                Stored::Failure { message, expires } => {
                    let ttl = expires
                        .duration_since(now)
                        .unwrap_or(Duration::from_millis(100));
                    (
                        Envelope {
                            length: 0,
                            content_type: String::new(),
                            content_encoding: String::new(),
                            payload: String::new(),
                            error: Some(message),
                        },
                        ttl,
                    )
                }
            };
            let raw = serde_json::to_string(&envelope)?;
            self.store.store(&key, raw, ttl).await
        }
        .boxed()
    }

    fn stats(&self) -> BoxFuture<'_, CacheStats> {
        self.store.stats()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

/// In-memory TTL map.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: DashMap<String, (String, Instant)>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = key.to_string();
        async move {
            let Some(pair) = self.map.get(&key) else {
                return Ok(None);
            };
            let (value, expires) = pair.value().clone();
            drop(pair);
            if Instant::now() >= expires {
                self.map.remove(&key);
                return Ok(None);
            }
            Ok(Some(value))
        }
        .boxed()
    }

    fn store(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        async move {
            self.map.insert(key, (value, Instant::now() + ttl));
            Ok(())
        }
        .boxed()
    }

    fn stats(&self) -> BoxFuture<'_, CacheStats> {
        async move {
            let now = Instant::now();
            self.map.retain(|_, (_, expires)| *expires > now);
            let size = self.map.iter().map(|e| e.value().0.len() as u64).sum();
            CacheStats {
                size_bytes: size,
                items: self.map.len() as u64,
            }
        }
        .boxed()
    }
}

// MemoryKv can be used directly as an EntryStore for convenience.
impl EntryStore for MemoryKv {
    fn get(&self, fingerprint: &str) -> BoxFuture<'_, Result<Option<Stored>, CacheError>> {
        let cache = KvCache { store: SelfRef(self) };
        let key = fingerprint.to_string();
        async move { cache.get(&key).await }.boxed()
    }

    fn put(&self, fingerprint: &str, stored: Stored) -> BoxFuture<'_, Result<(), CacheError>> {
        let cache = KvCache { store: SelfRef(self) };
        let key = fingerprint.to_string();
        async move { cache.put(&key, stored).await }.boxed()
    }

    fn stats(&self) -> BoxFuture<'_, CacheStats> {
        KeyValueStore::stats(self)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

/// Borrowed adapter so [`MemoryKv`] can serve as its own envelope
/// cache without cloning.
struct SelfRef<'a>(&'a MemoryKv);

impl KeyValueStore for SelfRef<'_> {
    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        self.0.fetch(key)
    }

    fn store(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        self.0.store(key, value, ttl)
    }

    fn stats(&self) -> BoxFuture<'_, CacheStats> {
        KeyValueStore::stats(self.0)
    }
}
