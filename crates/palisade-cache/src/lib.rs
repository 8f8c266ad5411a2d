//! Response cache for the palisade proxy.
//!
//! The cache is content-addressed by [`CacheKey`] and polymorphic over
//! storage backends: a file-backed store with an eviction sweeper and
//! a key/value store speaking a small JSON envelope. On top of either
//! backend, [`ResponseCache`] adds single-flight semantics: concurrent
//! misses for one key elect a leader that performs the upstream
//! request while followers wait on its outcome, bounded by the
//! configured grace time. Failed fills are published as short-lived
//! tombstones so a misbehaving query does not stampede the backend.

mod error;
mod fs;
mod key;
mod kv;
mod transaction;

pub use error::CacheError;
pub use fs::FsCache;
pub use key::CacheKey;
pub use kv::{KeyValueStore, KvCache, MemoryKv};
pub use transaction::TransactionState;

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use transaction::{follow, Begin, FollowOutcome, TransactionRegistry};

/// Default lifetime of a rolled-back (negative) entry.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_millis(500);

/// How long a pending transaction is honored before being treated as
/// abandoned. Generous enough to outlive any sane execution deadline.
const PENDING_DEADLINE: Duration = Duration::from_secs(60);

/// A committed response body plus its content metadata. Immutable
/// after commit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: bytes::Bytes,
    pub content_type: String,
    pub content_encoding: String,
    pub created: SystemTime,
    /// `None` when the backend manages expiry itself (KV TTLs).
    pub expires: Option<SystemTime>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires, Some(at) if now >= at)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// What a backend holds under a fingerprint: a committed response or a
/// negative (rolled-back) result.
#[derive(Debug, Clone)]
pub enum Stored {
    Success(CacheEntry),
    Failure {
        message: String,
        expires: SystemTime,
    },
}

/// Aggregate size of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size_bytes: u64,
    pub items: u64,
}

/// Storage backend seam. Implementations must be linearizable per
/// fingerprint and filter out expired entries on read.
pub trait EntryStore: Send + Sync {
    fn get(&self, fingerprint: &str) -> BoxFuture<'_, Result<Option<Stored>, CacheError>>;
    fn put(&self, fingerprint: &str, stored: Stored) -> BoxFuture<'_, Result<(), CacheError>>;
    fn stats(&self) -> BoxFuture<'_, CacheStats>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// Valid entry; stream it back.
    Hit(CacheEntry),
    /// A leader recently failed with this message; returned as-is
    /// without re-running the query.
    Failed(String),
    /// This request is the leader and must resolve the guard.
    Miss(FillGuard),
    /// A leader exists but did not finish within the grace period.
    GraceExpired,
}

/// Single-flight cache over a storage backend.
pub struct ResponseCache {
    name: String,
    store: Arc<dyn EntryStore>,
    transactions: Arc<TransactionRegistry>,
    ttl: Duration,
    grace: Duration,
    negative_ttl: Duration,
}

impl ResponseCache {
    pub fn builder(name: impl Into<String>, store: Arc<dyn EntryStore>) -> ResponseCacheBuilder {
        ResponseCacheBuilder {
            name: name.into(),
            store,
            ttl: Duration::from_secs(60),
            grace: Duration::from_secs(5),
            negative_ttl: DEFAULT_NEGATIVE_TTL,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// TTL committed entries are published with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn stats(&self) -> BoxFuture<'_, CacheStats> {
        self.store.stats()
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Atomic lookup with single-flight coalescing.
    ///
    /// Exactly one of the returned variants carries a [`FillGuard`];
    /// its holder is the only caller that may contact the upstream for
    /// this key until the guard is resolved.
    pub async fn get(&self, key: &CacheKey) -> Result<Lookup, CacheError> {
        let fingerprint = key.fingerprint();
        loop {
            match self.store.get(&fingerprint).await? {
                Some(Stored::Success(entry)) => return Ok(Lookup::Hit(entry)),
                Some(Stored::Failure { message, .. }) => return Ok(Lookup::Failed(message)),
                None => {}
            }

            match self.transactions.begin(&fingerprint, PENDING_DEADLINE) {
                Begin::Leader => {
                    return Ok(Lookup::Miss(FillGuard {
                        store: Arc::clone(&self.store),
                        transactions: Arc::clone(&self.transactions),
                        fingerprint,
                        ttl: self.ttl,
                        negative_ttl: self.negative_ttl,
                        resolved: false,
                    }))
                }
                Begin::Follower(receiver) => match follow(receiver, self.grace).await {
                    // The entry is now in the store; loop around and
                    // read it.
                    FollowOutcome::Completed => continue,
                    // The leader vanished without a result; retry and
                    // possibly take over.
                    FollowOutcome::Vanished => continue,
                    FollowOutcome::Failed(message) => return Ok(Lookup::Failed(message)),
                    FollowOutcome::GraceExpired => return Ok(Lookup::GraceExpired),
                },
            }
        }
    }

    /// Number of in-flight fills, exposed for observability.
    pub fn pending_transactions(&self) -> usize {
        self.transactions.pending()
    }
}

pub struct ResponseCacheBuilder {
    name: String,
    store: Arc<dyn EntryStore>,
    ttl: Duration,
    grace: Duration,
    negative_ttl: Duration,
}

impl ResponseCacheBuilder {
    /// Lifetime of committed entries. Default: 60 s.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bounded wait a follower spends on a pending fill. Default: 5 s.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Lifetime of negative (rolled-back) entries. Default: 500 ms.
    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    pub fn build(self) -> ResponseCache {
        ResponseCache {
            name: self.name,
            store: self.store,
            transactions: Arc::new(TransactionRegistry::new()),
            ttl: self.ttl,
            grace: self.grace,
            negative_ttl: self.negative_ttl,
        }
    }
}

/// Held by the single leader filling a key.
///
/// Dropping the guard unresolved (client vanished, fill aborted)
/// cancels the transaction so waiting followers restart their lookup
/// instead of hanging.
pub struct FillGuard {
    store: Arc<dyn EntryStore>,
    transactions: Arc<TransactionRegistry>,
    fingerprint: String,
    ttl: Duration,
    negative_ttl: Duration,
    resolved: bool,
}

impl FillGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Publishes the assembled response under the key and wakes
    /// followers.
    pub async fn commit(
        mut self,
        payload: bytes::Bytes,
        content_type: String,
        content_encoding: String,
    ) -> Result<(), CacheError> {
        let now = SystemTime::now();
        let entry = CacheEntry {
            payload,
            content_type,
            content_encoding,
            created: now,
            expires: Some(now + self.ttl),
        };
        self.store
            .put(&self.fingerprint, Stored::Success(entry))
            .await?;
        self.transactions.complete(&self.fingerprint);
        self.resolved = true;
        Ok(())
    }

    /// Publishes a short-lived tombstone carrying the error message
    /// and fails the transaction; followers receive the message as-is.
    pub async fn rollback(mut self, message: String) -> Result<(), CacheError> {
        let stored = Stored::Failure {
            message: message.clone(),
            expires: SystemTime::now() + self.negative_ttl,
        };
        self.store.put(&self.fingerprint, stored).await?;
        self.transactions.fail(&self.fingerprint, message);
        self.resolved = true;
        Ok(())
    }
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.transactions.cancel(&self.fingerprint);
        }
    }
}
