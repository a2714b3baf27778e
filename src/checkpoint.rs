//! Checkpoint persistence for replication progress.
//!
//! Each replication identity persists two scalars so cycles can resume after
//! a restart:
//!
//! - `last_push_sequence`: opaque cursor into the local change feed. The
//!   next push reads strictly after it.
//! - `last_pull_document`: the last document received from the remote, used
//!   as the resume token for the next pull.
//!
//! Both live in a single document in the collection's local-document
//! namespace, keyed by a digest of the replication identifier. Writes are
//! read-modify-write so fields added by future versions survive a rewrite.
//!
//! ## Cursor Semantics
//!
//! `last_push_sequence` stores the highest feed sequence **inspected** by a
//! successfully pushed batch, not the highest retained one. A crash between
//! the push handler call and the checkpoint write re-pushes the same batch
//! on restart (at-least-once, handlers should be idempotent).

use crate::collection::CollectionHandle;
use crate::document::DocumentPayload;
use crate::error::{ReplicationError, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

const PUSH_SEQUENCE_FIELD: &str = "last_push_sequence";
const PULL_DOCUMENT_FIELD: &str = "last_pull_document";
const UPDATED_AT_FIELD: &str = "updated_at";

/// Derive the local-document id for a replication identifier.
///
/// The identifier is user-supplied free text; hashing keeps the id short and
/// valid regardless of its content. Distinct identifiers never share a
/// checkpoint.
pub fn checkpoint_document_id(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("replication-checkpoint-{}", &digest[..16])
}

/// Persistent checkpoint storage scoped to one `(collection, identifier)`
/// pair.
pub struct CheckpointStore<C: CollectionHandle> {
    collection: Arc<C>,
    identifier: String,
    doc_id: String,
}

impl<C: CollectionHandle> CheckpointStore<C> {
    /// Create a store for the given replication identifier.
    pub fn new(collection: Arc<C>, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let doc_id = checkpoint_document_id(&identifier);
        Self {
            collection,
            identifier,
            doc_id,
        }
    }

    /// Read the push cursor. Defaults to `0` (feed start) when no checkpoint
    /// exists yet.
    pub async fn last_push_sequence(&self) -> Result<u64> {
        let record = self.read_record().await?;
        Ok(record
            .get(PUSH_SEQUENCE_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Persist the push cursor.
    ///
    /// Callers always pass the highest inspected sequence of a successful
    /// batch, so the stored value never observably decreases.
    pub async fn set_last_push_sequence(&self, sequence: u64) -> Result<()> {
        self.update_record(|record| {
            record.insert(PUSH_SEQUENCE_FIELD.to_string(), json!(sequence));
        })
        .await?;
        debug!(
            identifier = %self.identifier,
            sequence,
            "Persisted push checkpoint"
        );
        Ok(())
    }

    /// Read the pull resume token, if any pull has completed before.
    pub async fn last_pull_document(&self) -> Result<Option<DocumentPayload>> {
        let record = self.read_record().await?;
        match record.get(PULL_DOCUMENT_FIELD) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ReplicationError::storage("last_pull_document", e.to_string())),
        }
    }

    /// Persist the pull resume token.
    pub async fn set_last_pull_document(&self, document: &DocumentPayload) -> Result<()> {
        let value = serde_json::to_value(document)
            .map_err(|e| ReplicationError::storage("set_last_pull_document", e.to_string()))?;
        self.update_record(|record| {
            record.insert(PULL_DOCUMENT_FIELD.to_string(), value);
        })
        .await?;
        debug!(identifier = %self.identifier, "Persisted pull checkpoint");
        Ok(())
    }

    async fn read_record(&self) -> Result<Map<String, Value>> {
        match self.collection.get_local(&self.doc_id).await? {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => Err(ReplicationError::storage(
                "read_checkpoint",
                format!("checkpoint record is not an object: {}", other),
            )),
            None => Ok(Map::new()),
        }
    }

    async fn update_record(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let mut record = self.read_record().await?;
        apply(&mut record);
        record.insert(
            UPDATED_AT_FIELD.to_string(),
            json!(chrono::Utc::now().timestamp_millis()),
        );
        self.collection
            .upsert_local(&self.doc_id, Value::Object(record))
            .await
    }
}
