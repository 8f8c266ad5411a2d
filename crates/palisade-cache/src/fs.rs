//! File-backed entry store.
//!
//! Each entry lives in one file named by the key fingerprint: a
//! little-endian u32 header length, a JSON header, then the raw
//! payload. A background sweeper bounds the directory's total byte
//! size and file count and drops expired entries.

use crate::{CacheEntry, CacheError, CacheStats, EntryStore, Stored};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    #[serde(rename = "kind")]
    kind: EntryKind,
    #[serde(rename = "ct")]
    content_type: String,
    #[serde(rename = "ce")]
    content_encoding: String,
    created_ms: u64,
    expires_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Ok,
    Err,
}

/// File-backed cache store with a byte/item-bounded eviction sweeper.
pub struct FsCache {
    dir: PathBuf,
    max_size_bytes: u64,
    max_items: u64,
    sweep_interval: Duration,
    size_bytes: Arc<AtomicU64>,
    items: Arc<AtomicU64>,
}

impl FsCache {
    /// Opens (creating if needed) the cache directory.
    pub fn new(
        dir: impl Into<PathBuf>,
        max_size_bytes: u64,
        max_items: u64,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_size_bytes,
            max_items,
            sweep_interval: Duration::from_secs(3),
            size_bytes: Arc::new(AtomicU64::new(0)),
            items: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Test knob: how often the sweeper wakes up.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Spawns the eviction sweeper; it dies with the generation token.
    pub fn start(&self, shutdown: CancellationToken) {
        let dir = self.dir.clone();
        let max_size = self.max_size_bytes;
        let max_items = self.max_items;
        let size_gauge = Arc::clone(&self.size_bytes);
        let item_gauge = Arc::clone(&self.items);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) =
                    sweep(&dir, max_size, max_items, &size_gauge, &item_gauge).await
                {
                    warn!(dir = %dir.display(), %err, "cache sweep failed");
                }
            }
        });
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }
}

impl EntryStore for FsCache {
    fn get(&self, fingerprint: &str) -> BoxFuture<'_, Result<Option<Stored>, CacheError>> {
        let path = self.path_for(fingerprint);
        async move {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let stored = decode_entry(&raw)?;
            let expired = match &stored {
                Stored::Success(entry) => entry.is_expired(SystemTime::now()),
                Stored::Failure { expires, .. } => SystemTime::now() >= *expires,
            };
            if expired {
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
            Ok(Some(stored))
        }
        .boxed()
    }

    fn put(&self, fingerprint: &str, stored: Stored) -> BoxFuture<'_, Result<(), CacheError>> {
        let path = self.path_for(fingerprint);
        let tmp = self.dir.join(format!("{fingerprint}.tmp"));
        let size_gauge = Arc::clone(&self.size_bytes);
        let item_gauge = Arc::clone(&self.items);
        async move {
            let raw = encode_entry(&stored)?;
            let len = raw.len() as u64;
            // Write-then-rename publishes the entry atomically; a
            // concurrent get never sees a half-written file.
            tokio::fs::write(&tmp, &raw).await?;
            tokio::fs::rename(&tmp, &path).await?;
            size_gauge.fetch_add(len, Ordering::Relaxed);
            item_gauge.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        .boxed()
    }

    fn stats(&self) -> BoxFuture<'_, CacheStats> {
        async move {
            CacheStats {
                size_bytes: self.size_bytes.load(Ordering::Relaxed),
                items: self.items.load(Ordering::Relaxed),
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

fn encode_entry(stored: &Stored) -> Result<Vec<u8>, CacheError> {
    let (header, payload) = match stored {
        Stored::Success(entry) => (
            FileHeader {
                kind: EntryKind::Ok,
                content_type: entry.content_type.clone(),
                content_encoding: entry.content_encoding.clone(),
                created_ms: to_ms(entry.created),
                expires_ms: entry.expires.map(to_ms).unwrap_or(u64::MAX),
                error: None,
            },
            entry.payload.as_ref(),
        ),
        Stored::Failure { message, expires } => (
            FileHeader {
                kind: EntryKind::Err,
                content_type: String::new(),
                content_encoding: String::new(),
                created_ms: to_ms(SystemTime::now()),
                expires_ms: to_ms(*expires),
                error: Some(message.clone()),
            },
            &[][..],
        ),
    };
    let header = serde_json::to_vec(&header)?;
    let mut raw = Vec::with_capacity(4 + header.len() + payload.len());
    raw.extend_from_slice(&(header.len() as u32).to_le_bytes());
    raw.extend_from_slice(&header);
    raw.extend_from_slice(payload);
    Ok(raw)
}

fn decode_entry(raw: &[u8]) -> Result<Stored, CacheError> {
    if raw.len() < 4 {
        return Err(CacheError::Corrupt("file shorter than its length prefix".into()));
    }
    let header_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + header_len {
        return Err(CacheError::Corrupt("truncated header".into()));
    }
    let header: FileHeader = serde_json::from_slice(&raw[4..4 + header_len])?;
    let payload = Bytes::copy_from_slice(&raw[4 + header_len..]);

    match header.kind {
        EntryKind::Ok => Ok(Stored::Success(CacheEntry {
            payload,
            content_type: header.content_type,
            content_encoding: header.content_encoding,
            created: from_ms(header.created_ms),
            expires: (header.expires_ms != u64::MAX).then(|| from_ms(header.expires_ms)),
        })),
        EntryKind::Err => Ok(Stored::Failure {
            message: header.error.unwrap_or_default(),
            expires: from_ms(header.expires_ms),
        }),
    }
}

fn to_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// One sweep: drop expired files, then evict oldest-first until the
/// directory fits the configured bounds, then refresh the stats.
async fn sweep(
    dir: &Path,
    max_size: u64,
    max_items: u64,
    size_gauge: &AtomicU64,
    item_gauge: &AtomicU64,
) -> Result<(), CacheError> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    let now = SystemTime::now();
    while let Some(dirent) = reader.next_entry().await? {
        let path = dirent.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            continue;
        }
        let meta = match dirent.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }

        // Peek at the header to drop expired entries eagerly.
        if let Ok(raw) = tokio::fs::read(&path).await {
            match decode_entry(&raw) {
                Ok(Stored::Success(entry)) if entry.is_expired(now) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                Ok(Stored::Failure { expires, .. }) if now >= expires => {
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "dropping unreadable cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                Ok(_) => {}
            }
        }

        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        entries.push((path, meta.len(), modified));
    }

    // Oldest first, so eviction removes the least recently written.
    entries.sort_by_key(|(_, _, modified)| *modified);

    let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum();
    let mut count = entries.len() as u64;
    let mut cursor = 0;
    while (total > max_size || count > max_items) && cursor < entries.len() {
        let (path, len, _) = &entries[cursor];
        if tokio::fs::remove_file(path).await.is_ok() {
            total -= len;
            count -= 1;
        }
        cursor += 1;
    }

    size_gauge.store(total, Ordering::Relaxed);
    item_gauge.store(count, Ordering::Relaxed);
    Ok(())
}
