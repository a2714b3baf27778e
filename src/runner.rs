//! Cycle runner: serialized execution of push-then-pull cycles.
//!
//! [`ReplicationState`] is the runtime facade of one replication channel. It
//! can be woken from three independent sources (the initial kick, the live
//! interval timer, the collection's change stream) and guarantees:
//!
//! - **Serialization**: cycles never run in parallel. A cycle observes all
//!   storage effects of the previous one.
//! - **Coalescing**: a burst of `run()` calls collapses to at most two
//!   cycles beyond the one in flight. One follower is needed to catch
//!   changes that arrived mid-cycle; more would be wasted work.
//! - **Retry**: a failed push or pull schedules another cycle after
//!   `retry_time_ms`, unless the caller opted out (`retry_on_fail = false`,
//!   used by the interval loop so stacked ticks cannot pile retries onto an
//!   already-failing endpoint).
//!
//! # Lifecycle
//!
//! ```text
//!  [Constructed] ──run()──▶ [Running] ⇄ [Idle] ──interval / change──▶ [Running]
//!         │                     │
//!         │                     ├── success, !live, initial done ──▶ [Completed]
//!         │                     └── cancel() / collection destroyed ─▶ [Canceled]
//! ```
//!
//! `Completed` and `Canceled` are terminal; both make `is_stopped()` true
//! and absorb further `run()` calls silently.
//!
//! # Observables
//!
//! Event streams (`received`, `sent`, `errors`) are broadcast channels;
//! stateful flags (`active`, `canceled`, `initial_replication_complete`) are
//! watch channels with last-value replay. Errors from handlers never
//! propagate out of `run()`; they are funneled into the error stream so
//! `run()` is safe to call from fire-and-forget contexts. After `canceled`
//! flips, all streams stay silent.

use crate::changes::changes_since_last_push;
use crate::checkpoint::CheckpointStore;
use crate::collection::CollectionHandle;
use crate::config::{PullConfig, PushConfig, ReplicationOptions, ReplicationSettings};
use crate::document::{DocumentPayload, Revision, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::revision::pulled_revision_hash;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the `received`/`sent`/`errors` broadcast channels.
const OBSERVABLE_CHANNEL_CAPACITY: usize = 256;

/// Maximum value of the run queue counter: one cycle in flight plus at most
/// two queued followers.
const MAX_QUEUED_RUNS: usize = 3;

struct StateInner<C: CollectionHandle> {
    collection: Arc<C>,
    settings: ReplicationSettings,
    pull: Option<PullConfig>,
    push: Option<PushConfig>,
    checkpoint: CheckpointStore<C>,

    /// Serializes cycle execution across all callers of `run()`.
    cycle_lock: Mutex<()>,
    /// In-flight plus queued runs, capped at [`MAX_QUEUED_RUNS`].
    run_queue_count: AtomicUsize,
    /// Total cycles executed (testability hook).
    run_count: AtomicU64,

    received_tx: broadcast::Sender<DocumentPayload>,
    sent_tx: broadcast::Sender<DocumentPayload>,
    error_tx: broadcast::Sender<ReplicationError>,
    active_tx: watch::Sender<bool>,
    canceled_tx: watch::Sender<bool>,
    initial_complete_tx: watch::Sender<bool>,

    /// Background tasks (interval loop, change subscription, destroy watch)
    /// attached by the controller; aborted on cancel.
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Runtime facade of one replication channel.
///
/// Cheap to clone; all clones share the same channel state.
pub struct ReplicationState<C: CollectionHandle> {
    inner: Arc<StateInner<C>>,
}

impl<C: CollectionHandle> Clone for ReplicationState<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CollectionHandle> ReplicationState<C> {
    /// Build a state from options. Does not start anything; see
    /// [`crate::controller::replicate_collection`] for the wired-up entry
    /// point.
    pub fn new(options: ReplicationOptions<C>) -> Self {
        let ReplicationOptions {
            collection,
            settings,
            pull,
            push,
        } = options;

        let checkpoint =
            CheckpointStore::new(Arc::clone(&collection), settings.replication_identifier.clone());
        let (received_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);
        let (sent_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(OBSERVABLE_CHANNEL_CAPACITY);
        let (active_tx, _) = watch::channel(false);
        let (canceled_tx, _) = watch::channel(false);
        let (initial_complete_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(StateInner {
                collection,
                settings,
                pull,
                push,
                checkpoint,
                cycle_lock: Mutex::new(()),
                run_queue_count: AtomicUsize::new(0),
                run_count: AtomicU64::new(0),
                received_tx,
                sent_tx,
                error_tx,
                active_tx,
                canceled_tx,
                initial_complete_tx,
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// The replication identifier of this channel.
    pub fn identifier(&self) -> &str {
        &self.inner.settings.replication_identifier
    }

    /// The channel settings.
    pub fn settings(&self) -> &ReplicationSettings {
        &self.inner.settings
    }

    /// The replicated collection.
    pub fn collection(&self) -> &Arc<C> {
        &self.inner.collection
    }

    /// Whether a pull half is configured.
    pub fn pull_configured(&self) -> bool {
        self.inner.pull.is_some()
    }

    /// Whether a push half is configured.
    pub fn push_configured(&self) -> bool {
        self.inner.push.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observable facade
    // ─────────────────────────────────────────────────────────────────────

    /// Stream of documents applied from the remote.
    pub fn subscribe_received(&self) -> broadcast::Receiver<DocumentPayload> {
        self.inner.received_tx.subscribe()
    }

    /// Stream of documents delivered to the remote.
    pub fn subscribe_sent(&self) -> broadcast::Receiver<DocumentPayload> {
        self.inner.sent_tx.subscribe()
    }

    /// Stream of replication errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ReplicationError> {
        self.inner.error_tx.subscribe()
    }

    /// Watch the active flag (true while a cycle executes).
    pub fn active_receiver(&self) -> watch::Receiver<bool> {
        self.inner.active_tx.subscribe()
    }

    /// Watch the canceled flag.
    pub fn canceled_receiver(&self) -> watch::Receiver<bool> {
        self.inner.canceled_tx.subscribe()
    }

    /// Watch the initial-replication-complete flag.
    pub fn initial_replication_complete_receiver(&self) -> watch::Receiver<bool> {
        self.inner.initial_complete_tx.subscribe()
    }

    /// Whether a cycle is executing right now.
    pub fn is_active(&self) -> bool {
        *self.inner.active_tx.borrow()
    }

    /// Whether this channel was cancelled.
    pub fn is_canceled(&self) -> bool {
        *self.inner.canceled_tx.borrow()
    }

    /// Whether the first retry-free cycle has completed.
    pub fn initial_replication_complete(&self) -> bool {
        *self.inner.initial_complete_tx.borrow()
    }

    /// Total cycles executed so far (testability hook).
    pub fn run_count(&self) -> u64 {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Whether this channel will never run another cycle.
    ///
    /// True iff the collection was destroyed, the channel was cancelled, or
    /// a one-shot channel finished its initial replication.
    pub fn is_stopped(&self) -> bool {
        self.inner.collection.is_destroyed()
            || self.is_canceled()
            || (!self.inner.settings.live && self.initial_replication_complete())
    }

    /// Resolves once the first retry-free cycle has completed.
    ///
    /// Never resolves on a channel that is cancelled before completing.
    pub async fn await_initial_replication(&self) {
        let mut rx = self.inner.initial_complete_tx.subscribe();
        let _ = rx.wait_for(|complete| *complete).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cycle execution
    // ─────────────────────────────────────────────────────────────────────

    /// Request a push-then-pull cycle.
    ///
    /// Concurrent callers are serialized; bursts collapse to at most two
    /// additional cycles beyond the one in flight. Returns once the
    /// requested cycle (or the coalesced one) has finished. Never fails:
    /// handler errors surface on the error stream.
    pub async fn run(&self, retry_on_fail: bool) {
        if self.is_stopped() {
            return;
        }

        if self.inner.run_queue_count.fetch_add(1, Ordering::SeqCst) >= MAX_QUEUED_RUNS {
            self.inner.run_queue_count.fetch_sub(1, Ordering::SeqCst);
            metrics::record_run_coalesced(self.identifier());
            // Coalesced away, but still resolve only once the in-flight
            // chain has drained, like any other caller of run().
            drop(self.inner.cycle_lock.lock().await);
            return;
        }

        let guard = self.inner.cycle_lock.lock().await;
        if !self.is_stopped() {
            self.execute_cycle(retry_on_fail).await;
        }
        drop(guard);
        self.inner.run_queue_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop this channel: no further cycles, background tasks torn down.
    ///
    /// Idempotent. In-flight handler calls are not force-aborted; their
    /// results are discarded at the next stop check.
    pub fn cancel(&self) {
        if self.inner.canceled_tx.send_replace(true) {
            return;
        }
        info!(identifier = %self.identifier(), "Replication canceled");

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            handle.abort();
        }
        metrics::set_replication_active(self.identifier(), false);
    }

    /// Track a background task for teardown on cancel.
    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        if self.is_canceled() {
            handle.abort();
            return;
        }
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// One cycle, executed under the cycle lock.
    async fn execute_cycle(&self, retry_on_fail: bool) {
        self.inner.run_count.fetch_add(1, Ordering::SeqCst);
        metrics::record_cycle(self.identifier());

        self.set_active(true);
        let retried = self.run_cycle(retry_on_fail).await;
        self.set_active(false);

        if retry_on_fail && !retried && !self.is_canceled() && !self.initial_replication_complete()
        {
            debug!(identifier = %self.identifier(), "Initial replication complete");
            let _ = self.inner.initial_complete_tx.send(true);
        }
    }

    /// Push then pull. Returns `true` when a retry was scheduled.
    async fn run_cycle(&self, retry_on_fail: bool) -> bool {
        if self.initial_replication_complete() {
            // Background sync after first load defers to foreground work.
            self.inner.collection.database().request_idle().await;
        }

        if self.push_configured() {
            let ok = self.run_push().await;
            if !ok && retry_on_fail {
                // Push must succeed before pull so pull-driven local changes
                // do not stack atop an un-synced push.
                self.schedule_retry("push");
                return true;
            }
        }

        if self.pull_configured() {
            let ok = self.run_pull().await;
            if !ok && retry_on_fail {
                self.schedule_retry("pull");
                return true;
            }
        }

        false
    }

    /// Push local changes until the feed is drained.
    ///
    /// Returns `false` on failure; the caller decides whether to retry.
    async fn run_push(&self) -> bool {
        let Some(push) = &self.inner.push else {
            self.emit_error(ReplicationError::Unreachable(
                "push cycle executed without a configured push handler".to_string(),
            ));
            return false;
        };
        let identifier = self.identifier().to_string();

        loop {
            let batch = match changes_since_last_push(
                &self.inner.collection,
                &identifier,
                push.batch_size,
            )
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.emit_error(e);
                    return false;
                }
            };

            let payloads: Vec<DocumentPayload> =
                batch.rows.iter().map(|row| row.doc.to_payload()).collect();

            let started = Instant::now();
            if let Err(e) = push.handler.push(payloads.clone()).await {
                self.emit_error(ReplicationError::PushHandler {
                    message: e.to_string(),
                });
                return false;
            }
            metrics::record_push_batch(&identifier, payloads.len(), started.elapsed());
            debug!(
                identifier = %identifier,
                count = payloads.len(),
                last_sequence = batch.last_sequence,
                "Pushed batch"
            );

            for payload in &payloads {
                self.emit_sent(payload.clone());
            }

            if let Err(e) = self
                .inner
                .checkpoint
                .set_last_push_sequence(batch.last_sequence)
                .await
            {
                self.emit_error(e);
                return false;
            }
            metrics::record_checkpoint_write(&identifier, "push");

            if batch.rows.is_empty() {
                return true;
            }
            // Non-empty batch: drain further changes before returning.
        }
    }

    /// Pull remote changes until the remote reports no more.
    ///
    /// Returns `false` on failure, `true` on success or when cancellation
    /// was observed mid-cycle.
    async fn run_pull(&self) -> bool {
        let Some(pull) = &self.inner.pull else {
            self.emit_error(ReplicationError::Unreachable(
                "pull cycle executed without a configured pull handler".to_string(),
            ));
            return false;
        };
        let identifier = self.identifier().to_string();

        loop {
            if self.is_stopped() {
                return false;
            }

            let last_pulled = match self.inner.checkpoint.last_pull_document().await {
                Ok(doc) => doc,
                Err(e) => {
                    self.emit_error(e);
                    return false;
                }
            };

            let started = Instant::now();
            let result = match pull.handler.pull(last_pulled).await {
                Ok(result) => result,
                Err(e) => {
                    self.emit_error(ReplicationError::PullHandler {
                        message: e.to_string(),
                    });
                    return false;
                }
            };

            if result.documents.is_empty() {
                return true;
            }

            if self.inner.collection.database().is_dev_mode() {
                if !self.validate_pulled(&result.documents) {
                    return false;
                }
            }

            if self.is_stopped() {
                // Cancelled while the handler was in flight; drop the page.
                return true;
            }

            if let Err(e) = self.handle_documents_from_remote(&result.documents).await {
                self.emit_error(e);
                return false;
            }
            metrics::record_pull_batch(&identifier, result.documents.len(), started.elapsed());
            debug!(
                identifier = %identifier,
                count = result.documents.len(),
                has_more = result.has_more_documents,
                "Applied pulled batch"
            );

            for document in &result.documents {
                self.emit_received(document.clone());
            }

            if let Some(last) = result.documents.last() {
                if let Err(e) = self.inner.checkpoint.set_last_pull_document(last).await {
                    self.emit_error(e);
                    return false;
                }
                metrics::record_checkpoint_write(&identifier, "pull");
            }

            if !result.has_more_documents {
                return true;
            }
            // Remote has more: pull the next page before returning.
        }
    }

    /// Validate pulled documents against the collection schema (dev mode).
    fn validate_pulled(&self, documents: &[DocumentPayload]) -> bool {
        let primary_key = self.inner.collection.primary_key();
        for document in documents {
            // The tombstone marker is not part of the user schema.
            let value = Value::Object(document.data.clone());
            if let Err(message) = self.inner.collection.validate(&value) {
                let document_id = document
                    .primary_id(primary_key)
                    .unwrap_or("<unknown>")
                    .to_string();
                self.emit_error(ReplicationError::Validation {
                    document_id,
                    message,
                });
                return false;
            }
        }
        true
    }

    /// Tag pulled documents with pull revisions and apply them atomically.
    async fn handle_documents_from_remote(&self, documents: &[DocumentPayload]) -> Result<()> {
        let primary_key = self.inner.collection.primary_key();

        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let id = document.primary_id(primary_key).ok_or_else(|| {
                ReplicationError::storage(
                    "handle_documents_from_remote",
                    "pulled document has no primary key",
                )
            })?;
            ids.push(id.to_string());
        }

        let existing = self
            .inner
            .collection
            .find_documents_by_id(&ids, true)
            .await?;

        let mut tagged = Vec::with_capacity(documents.len());
        for (document, id) in documents.iter().zip(&ids) {
            let hash = pulled_revision_hash(self.identifier(), document);
            let height = match existing.get(id) {
                Some(current) => current.revision()?.height + 1,
                None => 1,
            };
            tagged.push(StoredDocument {
                rev: Revision::new(height, hash).to_string(),
                deleted: document.deleted,
                attachments: Map::new(),
                data: document.data.clone(),
            });
        }

        // The bulk apply runs under the database's global writer lock.
        let _lock = self
            .inner
            .collection
            .database()
            .acquire_write_lock()
            .await;
        self.inner.collection.bulk_add_revisions(tagged).await
    }

    /// Schedule another cycle after the configured retry time.
    fn schedule_retry(&self, phase: &'static str) {
        if self.is_stopped() {
            return;
        }
        let delay = self.inner.settings.retry_time();
        warn!(
            identifier = %self.identifier(),
            phase,
            delay_ms = delay.as_millis() as u64,
            "Cycle failed, retry scheduled"
        );
        metrics::record_retry_scheduled(self.identifier(), phase);

        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !state.is_stopped() {
                state.run(true).await;
            }
        });
    }

    fn set_active(&self, active: bool) {
        if self.is_canceled() {
            return;
        }
        let _ = self.inner.active_tx.send(active);
        metrics::set_replication_active(self.identifier(), active);
    }

    fn emit_sent(&self, document: DocumentPayload) {
        if self.is_canceled() {
            return;
        }
        let _ = self.inner.sent_tx.send(document);
    }

    fn emit_received(&self, document: DocumentPayload) {
        if self.is_canceled() {
            return;
        }
        let _ = self.inner.received_tx.send(document);
    }

    fn emit_error(&self, error: ReplicationError) {
        if self.is_canceled() {
            return;
        }
        warn!(identifier = %self.identifier(), error = %error, "Replication error");
        metrics::record_replication_error(self.identifier(), error.kind());
        let _ = self.inner.error_tx.send(error);
    }
}
