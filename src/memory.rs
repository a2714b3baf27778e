//! In-memory collection for tests and standalone use.
//!
//! Implements [`CollectionHandle`] and [`DatabaseHandle`] over plain hash
//! maps and tokio primitives. Semantics follow the collaborator contracts in
//! [`crate::collection`]:
//!
//! - Every document write gets a strictly increasing feed sequence and is
//!   broadcast as a non-local change event.
//! - Local user writes produce revisions whose hash does **not** mix the
//!   replication identifier, so the pull-tag predicate stays one-sided.
//! - `bulk_add_revisions` stores documents with their caller-supplied `_rev`
//!   unchanged, all under one state lock.
//! - The local-document namespace never touches the change feed; its events
//!   carry `is_local = true`.

use crate::collection::{ChangeEvent, ChangeFeedRow, CollectionHandle, DatabaseHandle};
use crate::document::{DocumentPayload, Revision, StoredDocument};
use crate::error::{ReplicationError, Result};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};

/// Capacity of the change event broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

type Validator = dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync;

/// Database half of the in-memory implementation.
pub struct MemoryDatabase {
    write_lock: Arc<Mutex<()>>,
    leader_tx: watch::Sender<bool>,
    multi_instance: bool,
    dev_mode: bool,
}

impl MemoryDatabase {
    fn new(multi_instance: bool, leader: bool, dev_mode: bool) -> Self {
        let (leader_tx, _) = watch::channel(leader);
        Self {
            write_lock: Arc::new(Mutex::new(())),
            leader_tx,
            multi_instance,
            dev_mode,
        }
    }

    /// Flip the leadership flag (simulates an election result).
    pub fn set_leader(&self, leader: bool) {
        let _ = self.leader_tx.send(leader);
    }
}

impl DatabaseHandle for MemoryDatabase {
    fn acquire_write_lock(&self) -> BoxFuture<'_, OwnedMutexGuard<()>> {
        let lock = Arc::clone(&self.write_lock);
        Box::pin(async move { lock.lock_owned().await })
    }

    fn request_idle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {
            tokio::task::yield_now().await;
        })
    }

    fn wait_for_leadership(&self) -> BoxFuture<'_, ()> {
        let mut rx = self.leader_tx.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|leader| *leader).await;
        })
    }

    fn multi_instance(&self) -> bool {
        self.multi_instance
    }

    fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }
}

struct StoreState {
    docs: HashMap<String, StoredDocument>,
    feed: Vec<ChangeFeedRow>,
    sequence: u64,
    local_docs: HashMap<String, Value>,
}

/// In-memory collection with a change feed and a local-document namespace.
pub struct MemoryCollection {
    name: String,
    primary_key: String,
    database: MemoryDatabase,
    state: RwLock<StoreState>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    destroy_tx: watch::Sender<bool>,
    validator: Option<Box<Validator>>,
}

impl MemoryCollection {
    /// Create a single-instance collection without dev-mode validation.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (destroy_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            database: MemoryDatabase::new(false, true, false),
            state: RwLock::new(StoreState {
                docs: HashMap::new(),
                feed: Vec::new(),
                sequence: 0,
                local_docs: HashMap::new(),
            }),
            changes_tx,
            destroy_tx,
            validator: None,
        }
    }

    /// Enable dev mode with a schema validator.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self.database.dev_mode = true;
        self
    }

    /// Mark the database as multi-instance with the given initial leadership.
    pub fn with_multi_instance(mut self, leader: bool) -> Self {
        self.database.multi_instance = true;
        self.database.set_leader(leader);
        self
    }

    /// Flip the leadership flag.
    pub fn set_leader(&self, leader: bool) {
        self.database.set_leader(leader);
    }

    /// Destroy the collection: resolves `on_destroy` for all waiters.
    pub fn destroy(&self) {
        eprintln!("destroy: sending true, receiver_count={}", self.destroy_tx.receiver_count());
        let r = self.destroy_tx.send(true);
        eprintln!("destroy: send result = {:?}", r);
    }

    /// Write a document as a local user would: the revision height advances
    /// and the hash is a plain content digest (no replication identifier).
    pub async fn write_payload(&self, payload: DocumentPayload) -> Result<StoredDocument> {
        let id = payload
            .primary_id(&self.primary_key)
            .ok_or_else(|| {
                ReplicationError::storage("write_payload", "document has no primary key")
            })?
            .to_string();

        let mut state = self.state.write().await;
        let height = match state.docs.get(&id) {
            Some(existing) => existing.revision()?.height + 1,
            None => 1,
        };
        let doc = StoredDocument {
            rev: Revision::new(height, local_revision_hash(height, &payload)?).to_string(),
            deleted: payload.deleted,
            attachments: Map::new(),
            data: payload.data,
        };
        state.docs.insert(id.clone(), doc.clone());
        state.sequence += 1;
        let sequence = state.sequence;
        state.feed.push(ChangeFeedRow {
            sequence,
            id,
            doc: doc.clone(),
        });
        drop(state);

        let _ = self.changes_tx.send(ChangeEvent {
            is_local: false,
            document: doc.clone(),
        });
        Ok(doc)
    }

    /// Tombstone a document as a local user would.
    pub async fn remove(&self, id: &str) -> Result<Option<StoredDocument>> {
        let existing = {
            let state = self.state.read().await;
            state.docs.get(id).cloned()
        };
        let Some(existing) = existing else {
            return Ok(None);
        };
        let mut payload = existing.to_payload();
        payload.deleted = true;
        self.write_payload(payload).await.map(Some)
    }

    /// Read the current state of a document (including tombstones).
    pub async fn get(&self, id: &str) -> Option<StoredDocument> {
        self.state.read().await.docs.get(id).cloned()
    }

    /// Number of stored documents, tombstones included.
    pub async fn document_count(&self) -> usize {
        self.state.read().await.docs.len()
    }

    /// Highest sequence handed out so far.
    pub async fn top_sequence(&self) -> u64 {
        self.state.read().await.sequence
    }
}

impl CollectionHandle for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn validate(&self, document: &Value) -> std::result::Result<(), String> {
        match &self.validator {
            Some(validator) => validator(document),
            None => Ok(()),
        }
    }

    fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> BoxFuture<'_, Result<HashMap<String, StoredDocument>>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            let state = self.state.read().await;
            let mut found = HashMap::new();
            for id in ids {
                if let Some(doc) = state.docs.get(&id) {
                    if include_deleted || !doc.deleted {
                        found.insert(id, doc.clone());
                    }
                }
            }
            Ok(found)
        })
    }

    fn bulk_add_revisions(&self, docs: Vec<StoredDocument>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut events = Vec::with_capacity(docs.len());
            {
                let mut state = self.state.write().await;
                for doc in docs {
                    let id = doc
                        .primary_id(&self.primary_key)
                        .ok_or_else(|| {
                            ReplicationError::storage(
                                "bulk_add_revisions",
                                "document has no primary key",
                            )
                        })?
                        .to_string();
                    state.docs.insert(id.clone(), doc.clone());
                    state.sequence += 1;
                    let sequence = state.sequence;
                    state.feed.push(ChangeFeedRow {
                        sequence,
                        id,
                        doc: doc.clone(),
                    });
                    events.push(doc);
                }
            }
            for doc in events {
                let _ = self.changes_tx.send(ChangeEvent {
                    is_local: false,
                    document: doc,
                });
            }
            Ok(())
        })
    }

    fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChangeFeedRow>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .feed
                .iter()
                .filter(|row| row.sequence > sequence)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes_tx.subscribe()
    }

    fn on_destroy(&self) -> BoxFuture<'_, ()> {
        let mut rx = self.destroy_tx.subscribe();
        eprintln!("on_destroy: subscribed, current value = {}", *rx.borrow());
        Box::pin(async move {
            eprintln!("on_destroy: entering wait_for");
            let r = rx.wait_for(|destroyed| *destroyed).await;
            eprintln!("on_destroy: wait_for returned {:?}", r.map(|v| *v));
        })
    }

    fn is_destroyed(&self) -> bool {
        *self.destroy_tx.borrow()
    }

    fn get_local(&self, id: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.state.read().await.local_docs.get(&id).cloned()) })
    }

    fn upsert_local(&self, id: &str, value: Value) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.state.write().await.local_docs.insert(id, value.clone());
            // Local namespace writes surface as local events only.
            let _ = self.changes_tx.send(ChangeEvent {
                is_local: true,
                document: StoredDocument {
                    rev: "0-local".to_string(),
                    deleted: false,
                    attachments: Map::new(),
                    data: value.as_object().cloned().unwrap_or_default(),
                },
            });
            Ok(())
        })
    }

    fn database(&self) -> &dyn DatabaseHandle {
        &self.database
    }
}

/// Content digest for locally-produced revisions.
///
/// Deliberately structured differently from the pull tag (no replication
/// identifier is mixed in), so the pull-tag predicate can never match a
/// local write.
fn local_revision_hash(height: u64, payload: &DocumentPayload) -> Result<String> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| ReplicationError::storage("local_revision_hash", e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(b"local-write");
    hasher.update(height.to_le_bytes());
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
