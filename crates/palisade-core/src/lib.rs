//! Shared primitives for the palisade proxy.
//!
//! This crate holds the two building blocks every other part of the
//! proxy leans on: a sequentially consistent [`Counter`] used for
//! concurrency accounting on users, backend users and nodes, and a
//! [`RateLimiter`] that layers a wall-clock minute window on top of a
//! counter. Both are cheap to clone and safe to share across the
//! worker threads serving HTTP.

mod counter;
mod limiter;

pub use counter::Counter;
pub use limiter::RateLimiter;
