//! Atomic counter used for concurrency and rate accounting.

use std::sync::atomic::{AtomicI64, Ordering};

/// A monotonic counter with the increment/decrement protocol the
/// admission path relies on.
///
/// The value is signed on purpose: the rate window is reset to zero on
/// a wall-clock schedule, and a reset racing an in-flight decrement may
/// briefly drive the value below zero. Limit checks treat anything
/// `<= 0` as "no overflow", which makes that race benign.
///
/// All operations are sequentially consistent so that a successful
/// increment is observed by any subsequent load on any thread.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    /// Creates a counter starting at zero.
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Overwrites the current value.
    pub fn store(&self, value: i64) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Returns the current value.
    pub fn load(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Increments and returns the post-increment value, so callers can
    /// compare it against a configured cap in one step.
    pub fn inc(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the counter. Used to back out an increment after an
    /// admission check failed.
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
