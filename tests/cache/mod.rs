//! Test organization:
//! - fs_store.rs: file-backed store roundtrips and eviction
//! - single_flight.rs: leader election and follower outcomes under
//!   concurrency

mod fs_store;
mod single_flight;

use palisade_cache::CacheKey;

pub fn key(query: &str) -> CacheKey {
    CacheKey {
        query: query.as_bytes().to_vec(),
        database: "default".into(),
        ..CacheKey::default()
    }
}
