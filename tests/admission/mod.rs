//! Test organization:
//! - limits.rs: paired counter protocol under concurrency
//! - queueing.rs: bounded queues with bounded wait
