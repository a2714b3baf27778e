//! Change collection for push cycles.
//!
//! Reads the local change feed starting after the persisted push cursor and
//! assembles the next outgoing batch:
//!
//! - At most `batch_size` **distinct** document ids; a later change to an id
//!   already in the batch replaces the earlier entry (latest wins).
//! - Changes whose current revision was produced by this channel's pull are
//!   filtered out; they originated remotely and must not be pushed back.
//! - The returned `last_sequence` is the highest sequence consumed, whether
//!   or not the row was retained, so the cursor advances past filtered
//!   entries. A row left unconsumed because the batch was already full does
//!   not advance the cursor and is picked up by the next batch.
//!
//! The collector is storage-agnostic: anything with per-document monotonic
//! sequence numbers satisfies the feed contract in [`crate::collection`].

use crate::checkpoint::CheckpointStore;
use crate::collection::CollectionHandle;
use crate::document::StoredDocument;
use crate::error::Result;
use crate::revision::revision_from_pull;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// One document queued for push, with the feed sequence of its latest change.
#[derive(Debug, Clone)]
pub struct PushChangeRow {
    /// Current document state, tombstones included.
    pub doc: StoredDocument,
    /// Feed sequence of the latest change to this document.
    pub sequence: u64,
}

/// Result of one collection pass.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// Retained changes, ascending by sequence, one row per document id.
    pub rows: Vec<PushChangeRow>,
    /// Highest feed sequence consumed by this pass. Persist after a
    /// successful push.
    pub last_sequence: u64,
}

impl ChangeBatch {
    /// Whether nothing is left to push.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Collect the next push batch for the given replication identifier.
pub async fn changes_since_last_push<C: CollectionHandle>(
    collection: &Arc<C>,
    identifier: &str,
    batch_size: usize,
) -> Result<ChangeBatch> {
    let checkpoint = CheckpointStore::new(Arc::clone(collection), identifier);
    let since = checkpoint.last_push_sequence().await?;

    let page_size = batch_size.max(1);
    let mut retained: HashMap<String, PushChangeRow> = HashMap::new();
    let mut last_sequence = since;
    let mut cursor = since;

    'feed: loop {
        let page = collection.changes_since(cursor, page_size).await?;
        let page_len = page.len();

        for row in page {
            cursor = row.sequence;

            if !retained.contains_key(&row.id) && retained.len() >= batch_size {
                // Batch is full; leave this change for the next pass.
                break 'feed;
            }

            last_sequence = row.sequence;

            if revision_from_pull(identifier, &row.doc) {
                // Came in through our own pull; skip, but keep the cursor
                // moving so the entry is not re-inspected forever.
                trace!(id = %row.id, rev = %row.doc.rev, "Skipping pull-tagged change");
                retained.remove(&row.id);
                continue;
            }

            retained.insert(
                row.id,
                PushChangeRow {
                    doc: row.doc,
                    sequence: row.sequence,
                },
            );
        }

        if page_len < page_size {
            // Feed exhausted.
            break;
        }
    }

    let mut rows: Vec<PushChangeRow> = retained.into_values().collect();
    rows.sort_by_key(|row| row.sequence);

    Ok(ChangeBatch {
        rows,
        last_sequence,
    })
}
