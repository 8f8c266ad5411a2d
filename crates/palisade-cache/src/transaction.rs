//! Single-flight transaction registry.
//!
//! For every cache key with an in-flight fill there is one
//! transaction. The first miss becomes the leader; concurrent misses
//! for the same key subscribe to the leader's outcome instead of
//! issuing their own upstream request.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of one in-flight fill.
#[derive(Debug, Clone)]
pub enum TransactionState {
    Pending,
    Completed,
    Failed(String),
}

/// What a follower observed while waiting on a leader.
#[derive(Debug)]
pub(crate) enum FollowOutcome {
    /// The leader committed; the entry is now readable from the store.
    Completed,
    /// The leader rolled back with this error message.
    Failed(String),
    /// The transaction disappeared without a terminal state; the
    /// caller should restart its lookup and may become the new leader.
    Vanished,
    /// The grace period elapsed with the transaction still pending.
    GraceExpired,
}

struct Transaction {
    state: watch::Sender<TransactionState>,
    deadline: Instant,
}

/// Result of [`TransactionRegistry::begin`].
pub(crate) enum Begin {
    Leader,
    Follower(watch::Receiver<TransactionState>),
}

#[derive(Default)]
pub(crate) struct TransactionRegistry {
    inner: Mutex<HashMap<String, Transaction>>,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a key. The first caller for a live key
    /// becomes the leader and must later resolve the transaction via
    /// [`complete`](Self::complete), [`fail`](Self::fail) or
    /// [`cancel`](Self::cancel); everyone else gets a receiver on the
    /// leader's state. A transaction past its deadline is treated as
    /// abandoned and replaced.
    pub(crate) fn begin(&self, fingerprint: &str, lifetime: Duration) -> Begin {
        let mut map = self.inner.lock();
        if let Some(transaction) = map.get(fingerprint) {
            if Instant::now() < transaction.deadline {
                return Begin::Follower(transaction.state.subscribe());
            }
        }
        let (state, _) = watch::channel(TransactionState::Pending);
        map.insert(
            fingerprint.to_string(),
            Transaction {
                state,
                deadline: Instant::now() + lifetime,
            },
        );
        Begin::Leader
    }

    pub(crate) fn complete(&self, fingerprint: &str) {
        self.resolve(fingerprint, TransactionState::Completed);
    }

    pub(crate) fn fail(&self, fingerprint: &str, message: String) {
        self.resolve(fingerprint, TransactionState::Failed(message));
    }

    /// Removes a transaction without a result; waiting followers
    /// observe [`FollowOutcome::Vanished`] and restart their lookup.
    pub(crate) fn cancel(&self, fingerprint: &str) {
        self.inner.lock().remove(fingerprint);
    }

    pub(crate) fn pending(&self) -> usize {
        self.inner.lock().len()
    }

    fn resolve(&self, fingerprint: &str, state: TransactionState) {
        if let Some(transaction) = self.inner.lock().remove(fingerprint) {
            // Send errors mean no follower is listening; fine.
            let _ = transaction.state.send(state);
        }
    }
}

/// Waits up to `grace` for the transaction to leave the pending state.
pub(crate) async fn follow(
    mut receiver: watch::Receiver<TransactionState>,
    grace: Duration,
) -> FollowOutcome {
    let wait = async {
        loop {
            match &*receiver.borrow_and_update() {
                TransactionState::Completed => return FollowOutcome::Completed,
                TransactionState::Failed(message) => {
                    return FollowOutcome::Failed(message.clone())
                }
                TransactionState::Pending => {}
            }
            if receiver.changed().await.is_err() {
                return FollowOutcome::Vanished;
            }
        }
    };
    tokio::time::timeout(grace, wait)
        .await
        .unwrap_or(FollowOutcome::GraceExpired)
}
