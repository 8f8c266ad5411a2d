//! Content-addressed cache keys.

use xxhash_rust::xxh3::Xxh3;

/// Everything that makes two requests cache-equivalent.
///
/// Keys equate iff all fields equate; the hex fingerprint is what
/// backends use to name entries on disk or in a KV store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Normalized query text.
    pub query: Vec<u8>,
    /// Client `Accept-Encoding`, since the stored payload may be
    /// pre-compressed.
    pub accept_encoding: String,
    pub default_format: String,
    pub database: String,
    pub compress: String,
    pub enable_http_compression: String,
    /// Cache namespace, so distinct caches sharing a store never
    /// collide.
    pub namespace: String,
    pub extremes: String,
    pub max_result_rows: String,
    pub result_overflow_mode: String,
    /// Digest of the user's parameter-override group.
    pub param_group_hash: String,
    /// Digest of the frontend credentials, so users never share
    /// entries.
    pub credentials_hash: String,
}

impl CacheKey {
    /// 16-byte digest of all fields, rendered as 32 hex characters.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Xxh3::new();
        for field in [
            self.query.as_slice(),
            self.accept_encoding.as_bytes(),
            self.default_format.as_bytes(),
            self.database.as_bytes(),
            self.compress.as_bytes(),
            self.enable_http_compression.as_bytes(),
            self.namespace.as_bytes(),
            self.extremes.as_bytes(),
            self.max_result_rows.as_bytes(),
            self.result_overflow_mode.as_bytes(),
            self.param_group_hash.as_bytes(),
            self.credentials_hash.as_bytes(),
        ] {
            // Length-prefix each field so adjacent fields cannot be
            // confused for one another.
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        format!("{:032x}", hasher.digest128())
    }
}
