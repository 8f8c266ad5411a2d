//! Admission control for the palisade proxy.
//!
//! Every request is admitted against two identities at once: the
//! frontend user and the backend user it maps to. Each identity
//! carries a [`LimitSet`] (concurrency cap, requests-per-minute cap,
//! optional bounded queue). [`admit`] runs the full protocol: optional
//! queueing with bounded wait, the four-counter increment with full
//! back-out on breach, and node re-selection between attempts.

mod limits;
mod queue;

pub use limits::{dec_pair, inc_pair, AdmissionError, IdentityKind, LimitSet, LimitSetBuilder};
pub use queue::admit;
