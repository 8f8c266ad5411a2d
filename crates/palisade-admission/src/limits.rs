//! Per-identity limits and the paired increment/decrement protocol.

use palisade_core::{Counter, RateLimiter};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Which side of the user mapping a limit set belongs to; only used in
/// error messages and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    BackendUser,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::User => f.write_str("user"),
            IdentityKind::BackendUser => f.write_str("backend user"),
        }
    }
}

/// Rejection reasons surfaced to the client as 429.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("limit for {kind} \"{name}\" is exceeded: max_concurrent_queries limit: {limit}")]
    Concurrency {
        kind: IdentityKind,
        name: String,
        limit: i64,
    },
    #[error("rate limit for {kind} \"{name}\" is exceeded: requests_per_minute limit: {limit}")]
    Rate {
        kind: IdentityKind,
        name: String,
        limit: i64,
    },
}

/// Concurrency counter, rate window and optional queue for one
/// identity. Built once per config generation and shared by every
/// request the identity makes.
#[derive(Debug, Clone)]
pub struct LimitSet {
    name: String,
    kind: IdentityKind,
    max_concurrent: i64,
    max_rpm: i64,
    concurrent: Arc<Counter>,
    rate: RateLimiter,
    queue: Option<Arc<Semaphore>>,
    queue_size: usize,
    max_queue_wait: Option<Duration>,
}

impl LimitSet {
    pub fn builder(name: impl Into<String>, kind: IdentityKind) -> LimitSetBuilder {
        LimitSetBuilder {
            name: name.into(),
            kind,
            max_concurrent: 0,
            max_rpm: 0,
            queue_size: 0,
            max_queue_wait: None,
            rate_period: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// Number of queries currently admitted for this identity.
    pub fn running(&self) -> i64 {
        self.concurrent.load()
    }

    pub(crate) fn queue(&self) -> Option<&Arc<Semaphore>> {
        self.queue.as_ref()
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub(crate) fn max_queue_wait(&self) -> Option<Duration> {
        self.max_queue_wait
    }

    /// Starts the rate window reset loop for this identity. Called
    /// once per config generation; the loop dies with the generation's
    /// token.
    pub fn start(&self, shutdown: CancellationToken) {
        if self.max_rpm > 0 {
            self.rate.spawn_reset_loop(shutdown);
        }
    }

    fn check_concurrency(&self, value: i64) -> Result<(), AdmissionError> {
        if self.max_concurrent > 0 && value > self.max_concurrent {
            return Err(AdmissionError::Concurrency {
                kind: self.kind,
                name: self.name.clone(),
                limit: self.max_concurrent,
            });
        }
        Ok(())
    }

    fn check_rate(&self, value: i64) -> Result<(), AdmissionError> {
        // `value` can dip below zero when a window reset races an
        // in-flight back-out; a positive limit comparison is the
        // signed guard that ignores it.
        if self.max_rpm > 0 && value > self.max_rpm {
            return Err(AdmissionError::Rate {
                kind: self.kind,
                name: self.name.clone(),
                limit: self.max_rpm,
            });
        }
        Ok(())
    }
}

/// Atomically admits one query against both identities.
///
/// All four counters are incremented up front so concurrent readers
/// see a consistent view; any breach backs out every increment (the
/// rate windows too, so rejected attempts are not double-counted) and
/// reports the offending cap.
pub fn inc_pair(user: &LimitSet, backend: &LimitSet) -> Result<(), AdmissionError> {
    let user_running = user.concurrent.inc();
    let backend_running = backend.concurrent.inc();
    let user_rate = user.rate.inc();
    let backend_rate = backend.rate.inc();

    let verdict = user
        .check_concurrency(user_running)
        .and_then(|()| backend.check_concurrency(backend_running))
        .and_then(|()| user.check_rate(user_rate))
        .and_then(|()| backend.check_rate(backend_rate));

    if verdict.is_err() {
        user.concurrent.dec();
        backend.concurrent.dec();
        user.rate.dec();
        backend.rate.dec();
    }
    verdict
}

/// Releases the concurrency counters taken by [`inc_pair`]. The rate
/// windows are left alone; they reset on their own schedule.
pub fn dec_pair(user: &LimitSet, backend: &LimitSet) {
    user.concurrent.dec();
    backend.concurrent.dec();
}

/// Builder for [`LimitSet`]. Zero means "unlimited" for the caps and
/// "no queue" for the queue size.
pub struct LimitSetBuilder {
    name: String,
    kind: IdentityKind,
    max_concurrent: i64,
    max_rpm: i64,
    queue_size: usize,
    max_queue_wait: Option<Duration>,
    rate_period: Option<Duration>,
}

impl LimitSetBuilder {
    pub fn max_concurrent_queries(mut self, max: i64) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn requests_per_minute(mut self, max: i64) -> Self {
        self.max_rpm = max;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn max_queue_wait(mut self, wait: Duration) -> Self {
        self.max_queue_wait = Some(wait);
        self
    }

    /// Shrinks the rate window; test-only knob.
    pub fn rate_window(mut self, period: Duration) -> Self {
        self.rate_period = Some(period);
        self
    }

    pub fn build(self) -> LimitSet {
        LimitSet {
            name: self.name,
            kind: self.kind,
            max_concurrent: self.max_concurrent,
            max_rpm: self.max_rpm,
            concurrent: Arc::new(Counter::new()),
            rate: self
                .rate_period
                .map(RateLimiter::with_period)
                .unwrap_or_default(),
            queue: (self.queue_size > 0).then(|| Arc::new(Semaphore::new(self.queue_size))),
            queue_size: self.queue_size,
            max_queue_wait: self.max_queue_wait,
        }
    }
}
