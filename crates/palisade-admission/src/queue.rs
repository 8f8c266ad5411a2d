//! Bounded admission queueing with bounded wait.

use crate::{AdmissionError, LimitSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Wait applied when neither identity configures one.
const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(10);

/// Lower and upper bounds on the retry nap inside the wait loop.
const MIN_SLEEP: Duration = Duration::from_millis(1);
const MAX_SLEEP: Duration = Duration::from_secs(1);

/// Runs the admission protocol for one request.
///
/// `attempt` performs one increment attempt (the paired counter
/// protocol plus whatever node bookkeeping the caller does on
/// success); `reselect` is invoked after each failed attempt's nap so
/// the caller can re-bind the request to a fresh node before retrying,
/// the previously chosen one may have become obsolete while queued.
///
/// Without a bounded queue on either identity this collapses to a
/// single `attempt`. With one, a queue slot is claimed without
/// blocking; a full queue grants the request one last chance at a
/// direct `attempt` before the rejection is returned.
pub async fn admit<A, R>(
    user: &LimitSet,
    backend: &LimitSet,
    mut attempt: A,
    mut reselect: R,
) -> Result<(), AdmissionError>
where
    A: FnMut() -> Result<(), AdmissionError>,
    R: FnMut(),
{
    if user.queue().is_none() && backend.queue().is_none() {
        return attempt();
    }

    let _user_slot = match claim_slot(user.queue()) {
        Ok(slot) => slot,
        Err(()) => return last_chance(user, &mut attempt),
    };
    let _backend_slot = match claim_slot(backend.queue()) {
        Ok(slot) => slot,
        Err(()) => return last_chance(backend, &mut attempt),
    };

    let wait = user
        .max_queue_wait()
        .unwrap_or(DEFAULT_QUEUE_WAIT)
        .min(backend.max_queue_wait().unwrap_or(DEFAULT_QUEUE_WAIT));
    let sleep = (wait / 10).clamp(MIN_SLEEP, MAX_SLEEP);
    let deadline = Instant::now() + wait;

    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(err) => {
                let now = Instant::now();
                if now >= deadline {
                    debug!(
                        user = user.name(),
                        backend_user = backend.name(),
                        %err,
                        "queue wait expired"
                    );
                    record_overflow(user);
                    record_overflow(backend);
                    return Err(err);
                }
                tokio::time::sleep(sleep.min(deadline - now)).await;
                reselect();
            }
        }
    }
}

/// Claims a queue slot without blocking. `Ok(None)` means the identity
/// has no queue at all.
fn claim_slot(queue: Option<&Arc<Semaphore>>) -> Result<Option<OwnedSemaphorePermit>, ()> {
    match queue {
        None => Ok(None),
        Some(semaphore) => Arc::clone(semaphore)
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| ()),
    }
}

fn last_chance<A>(overflowed: &LimitSet, attempt: &mut A) -> Result<(), AdmissionError>
where
    A: FnMut() -> Result<(), AdmissionError>,
{
    attempt().inspect_err(|err| {
        debug!(
            identity = overflowed.name(),
            queue_size = overflowed.queue_size(),
            %err,
            "queue full, last-chance admission rejected"
        );
        record_overflow(overflowed);
    })
}

fn record_overflow(identity: &LimitSet) {
    metrics::counter!(
        "queue_overflow_total",
        "kind" => identity.kind().to_string(),
        "name" => identity.name().to_string(),
    )
    .increment(1);
}
