//! Collaborator contracts for the owning collection and its database.
//!
//! The replication engine does not own storage. It drives a collection
//! through the [`CollectionHandle`] trait: a key-addressable bulk document
//! store with a sequence-addressable change feed, a broadcast stream of
//! change events, and a local-document namespace used for checkpoint
//! persistence. Database-wide concerns (writer exclusion, idle scheduling,
//! leader election, dev mode) live on [`DatabaseHandle`].
//!
//! Both traits use boxed futures so they stay object-safe and so embedders
//! can implement them over any storage backend. The crate ships an in-memory
//! implementation in [`crate::memory`] for tests and standalone use.
//!
//! # Change Feed Contract
//!
//! - Sequences are strictly increasing per collection; every write gets a
//!   fresh sequence.
//! - `changes_since(sequence, limit)` returns rows with `row.sequence >
//!   sequence` in ascending order, at most `limit` of them, each carrying the
//!   document state as of that change.
//! - Events in the local-document namespace carry `is_local = true` and never
//!   appear in the change feed.

use crate::document::StoredDocument;
use crate::error::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::OwnedMutexGuard;

/// One event on the collection's change stream.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// `true` when the event concerns the local-document namespace
    /// (checkpoints, metadata). Local events must never wake push.
    pub is_local: bool,

    /// The document state produced by the change.
    pub document: StoredDocument,
}

/// One row of the sequence-addressable change feed.
#[derive(Debug, Clone)]
pub struct ChangeFeedRow {
    /// Feed sequence of this change. Strictly increasing per collection.
    pub sequence: u64,

    /// Primary key of the changed document.
    pub id: String,

    /// Document state as of this change.
    pub doc: StoredDocument,
}

/// What the replication engine needs from the owning collection.
///
/// The engine uses this to:
/// 1. Read local changes for push (`changes_since`)
/// 2. Apply pulled documents (`find_documents_by_id` + `bulk_add_revisions`)
/// 3. Persist checkpoints (`get_local` / `upsert_local`)
/// 4. Wake on local writes (`subscribe_changes`)
/// 5. Tie its lifecycle to the collection (`on_destroy`, `is_destroyed`)
pub trait CollectionHandle: Send + Sync + 'static {
    /// Collection name (for logging and checkpoint scoping).
    fn name(&self) -> &str;

    /// Name of the schema-defined primary key field.
    fn primary_key(&self) -> &str;

    /// Validate a document against the collection schema.
    ///
    /// Only invoked in dev mode, on pulled documents with the tombstone
    /// marker removed. Returns a human-readable message on failure.
    fn validate(&self, document: &Value) -> std::result::Result<(), String>;

    /// Bulk-fetch current document states by primary key.
    ///
    /// With `include_deleted`, tombstoned documents are returned too; the
    /// pull path needs them to continue their revision height chain.
    fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> BoxFuture<'_, Result<HashMap<String, StoredDocument>>>;

    /// Write documents that already carry their final `_rev`, atomically.
    ///
    /// Used by pull to apply remote documents without generating new local
    /// revisions. All-or-nothing from the collection's standpoint. Emits
    /// non-local change events for each written document.
    fn bulk_add_revisions(&self, docs: Vec<StoredDocument>) -> BoxFuture<'_, Result<()>>;

    /// Read the change feed strictly after `sequence`, at most `limit` rows,
    /// ascending.
    fn changes_since(&self, sequence: u64, limit: usize)
        -> BoxFuture<'_, Result<Vec<ChangeFeedRow>>>;

    /// Subscribe to the collection's change event stream.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Resolves once the collection is destroyed. One-shot completion signal.
    fn on_destroy(&self) -> BoxFuture<'_, ()>;

    /// Whether the collection has been destroyed.
    fn is_destroyed(&self) -> bool;

    /// Read a document from the local-document namespace.
    fn get_local(&self, id: &str) -> BoxFuture<'_, Result<Option<Value>>>;

    /// Upsert a document into the local-document namespace.
    ///
    /// Must not surface on the non-local change stream.
    fn upsert_local(&self, id: &str, value: Value) -> BoxFuture<'_, Result<()>>;

    /// Handle to the owning database.
    fn database(&self) -> &dyn DatabaseHandle;
}

/// Database-wide concerns consumed by the engine.
pub trait DatabaseHandle: Send + Sync {
    /// Acquire the database's global writer lock.
    ///
    /// Pull's bulk apply runs under this lock; the guard releases it on drop.
    fn acquire_write_lock(&self) -> BoxFuture<'_, OwnedMutexGuard<()>>;

    /// Resolves when the database is idle enough for background work.
    ///
    /// Used to deprioritize sync cycles after the initial replication has
    /// completed.
    fn request_idle(&self) -> BoxFuture<'_, ()>;

    /// Resolves once this instance is elected leader.
    ///
    /// On single-instance databases this resolves immediately.
    fn wait_for_leadership(&self) -> BoxFuture<'_, ()>;

    /// Whether more than one instance may be open on the same database.
    fn multi_instance(&self) -> bool;

    /// Whether dev-mode validation hooks are enabled.
    fn is_dev_mode(&self) -> bool;
}
