//! Minute-window rate limiter.

use crate::Counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Period after which the request window is zeroed.
const RESET_PERIOD: Duration = Duration::from_secs(60);

/// A requests-per-window limiter backed by a [`Counter`].
///
/// The window is reset by a background task on a fixed wall-clock
/// schedule rather than per request, so a handful of extra requests may
/// slip through right at a window boundary. Callers compensate by
/// requiring the post-increment value to be positive before treating it
/// as an overflow (see [`Counter`]).
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Arc<Counter>,
    period: Duration,
}

impl RateLimiter {
    /// Creates a limiter with the standard one-minute window.
    pub fn new() -> Self {
        Self::with_period(RESET_PERIOD)
    }

    /// Creates a limiter with a custom reset period.
    pub fn with_period(period: Duration) -> Self {
        Self {
            window: Arc::new(Counter::new()),
            period,
        }
    }

    /// Counts one request into the window and returns the
    /// post-increment total.
    pub fn inc(&self) -> i64 {
        self.window.inc()
    }

    /// Backs out a request counted by [`inc`](Self::inc) after the
    /// admission attempt it belonged to was rejected, so rejected
    /// attempts are not double-counted.
    pub fn dec(&self) {
        self.window.dec()
    }

    /// Returns the number of requests counted in the current window.
    pub fn load(&self) -> i64 {
        self.window.load()
    }

    /// Spawns the background reset loop. The loop zeroes the window
    /// every period and exits when `shutdown` is cancelled, which
    /// happens when the config generation owning this limiter is
    /// replaced.
    pub fn spawn_reset_loop(&self, shutdown: CancellationToken) {
        let window = Arc::clone(&self.window);
        let period = self.period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately;
            // consume it so the window survives its first full period.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => window.store(0),
                }
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
