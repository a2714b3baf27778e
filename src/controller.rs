//! Replication controller: wires a [`ReplicationState`] to its collection.
//!
//! [`replicate_collection`] is the public entry point of the crate. It
//! constructs the cycle runner and attaches the event sources that drive it:
//!
//! 1. Leadership gating: on multi-instance databases with
//!    `wait_for_leadership`, everything below is deferred until this
//!    instance wins the election.
//! 2. The initial kick: one non-awaited `run(retry_on_fail = true)`.
//! 3. In live mode with pull: a timer loop firing `run(retry_on_fail =
//!    false)` every `live_interval_ms`. Retries are disabled here so stacked
//!    interval ticks cannot pile retries onto an already-failing endpoint.
//! 4. In live mode with push: a subscription to the collection's change
//!    stream, filtered to non-local events whose revision is **not**
//!    pull-tagged for this identity. This produces the "local write, push
//!    soon" wakeup while suppressing echo from our own pulls.
//! 5. Lifecycle: the collection's destroy signal cancels the state.
//!
//! All background tasks are tracked on the state and torn down by
//! `cancel()`.

use crate::collection::CollectionHandle;
use crate::config::ReplicationOptions;
use crate::revision::revision_from_pull;
use crate::runner::ReplicationState;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Start replicating a collection against a remote endpoint.
///
/// Returns immediately with the runtime facade; the initial cycle is fired
/// in the background (after leadership is acquired, where applicable). The
/// returned state is cheap to clone and is also cancelled automatically when
/// the collection is destroyed.
pub fn replicate_collection<C: CollectionHandle>(
    options: ReplicationOptions<C>,
) -> ReplicationState<C> {
    let state = ReplicationState::new(options);
    info!(
        identifier = %state.identifier(),
        collection = %state.collection().name(),
        live = state.settings().live,
        pull = state.pull_configured(),
        push = state.push_configured(),
        "Starting replication"
    );

    // Tie the state's lifecycle to the collection.
    let destroy_watch = {
        let state = state.clone();
        tokio::spawn(async move {
            let collection = Arc::clone(state.collection());
            collection.on_destroy().await;
            debug!(identifier = %state.identifier(), "Collection destroyed, canceling replication");
            state.cancel();
        })
    };
    state.attach_task(destroy_watch);

    // Leadership gating, initial kick and live wiring run off the caller's
    // stack so construction never blocks on an election.
    let startup = {
        let state = state.clone();
        tokio::spawn(async move {
            if state.settings().wait_for_leadership
                && state.collection().database().multi_instance()
            {
                debug!(identifier = %state.identifier(), "Waiting for leadership");
                state.collection().database().wait_for_leadership().await;
                debug!(identifier = %state.identifier(), "Leadership acquired");
            }
            if state.is_stopped() {
                return;
            }

            if state.settings().live {
                spawn_live_tasks(&state);
            }

            let runner = state.clone();
            tokio::spawn(async move {
                runner.run(true).await;
            });
        })
    };
    state.attach_task(startup);

    state
}

/// Spawn the timer loop (pull) and change-stream subscription (push) for a
/// live channel.
fn spawn_live_tasks<C: CollectionHandle>(state: &ReplicationState<C>) {
    if state.pull_configured() {
        let interval = state.settings().live_interval();
        let state_for_timer = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if state_for_timer.is_stopped() {
                    break;
                }
                state_for_timer.run(false).await;
            }
        });
        state.attach_task(handle);
        debug!(
            identifier = %state.identifier(),
            interval_ms = state.settings().live_interval_ms,
            "Spawned pull interval loop"
        );
    }

    // A push-only live channel has no timer: change events are its only
    // wakeup source.
    if state.push_configured() {
        let state_for_changes = state.clone();
        let handle = tokio::spawn(async move {
            let mut changes = state_for_changes.collection().subscribe_changes();
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        if event.is_local {
                            continue;
                        }
                        if state_for_changes.is_stopped() {
                            break;
                        }
                        if revision_from_pull(
                            state_for_changes.identifier(),
                            &event.document,
                        ) {
                            // Our own pull wrote this; waking push would
                            // only echo it back.
                            continue;
                        }
                        let runner = state_for_changes.clone();
                        tokio::spawn(async move {
                            runner.run(true).await;
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Events were dropped; run a cycle so nothing stays
                        // unpushed.
                        warn!(
                            identifier = %state_for_changes.identifier(),
                            skipped,
                            "Change stream lagged, forcing a push cycle"
                        );
                        let runner = state_for_changes.clone();
                        tokio::spawn(async move {
                            runner.run(true).await;
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        state.attach_task(handle);
        debug!(identifier = %state.identifier(), "Subscribed to change stream");
    }
}
