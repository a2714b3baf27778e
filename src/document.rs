//! Document shapes exchanged by the replication engine.
//!
//! Two shapes exist for the same logical document:
//!
//! - [`DocumentPayload`]: the wire format. User fields plus a `_deleted`
//!   tombstone marker. No `_rev`, no `_attachments`. This is what pull and
//!   push handlers see.
//! - [`StoredDocument`]: the storage format. User fields plus `_rev`,
//!   `_deleted` and `_attachments`. This is what the local storage instance
//!   owns.
//!
//! Revision strings have the shape `<height>-<hash>` where `height` is a
//! monotonically increasing per-document counter and `hash` identifies the
//! writer that produced the revision (see [`crate::revision`]).

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire-format document: user fields plus a tombstone marker.
///
/// The user's schema fields are flattened into `data`; the primary key is one
/// of them. `_deleted` defaults to `false` when absent, so a remote that only
/// sends live documents does not need to include it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Tombstone marker. `true` means the document was deleted.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    /// The user's schema fields, including the primary key.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DocumentPayload {
    /// Create a live (non-deleted) payload from user fields.
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            deleted: false,
            data,
        }
    }

    /// Get the primary key value of this document as a string.
    pub fn primary_id(&self, primary_key: &str) -> Option<&str> {
        self.data.get(primary_key).and_then(Value::as_str)
    }
}

/// Storage-format document: user fields plus replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Revision string, `<height>-<hash>`.
    #[serde(rename = "_rev")]
    pub rev: String,

    /// Tombstone marker.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    /// Attachment stubs. Never sent over the wire.
    #[serde(rename = "_attachments", default, skip_serializing_if = "Map::is_empty")]
    pub attachments: Map<String, Value>,

    /// The user's schema fields, including the primary key.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StoredDocument {
    /// Get the primary key value of this document as a string.
    pub fn primary_id(&self, primary_key: &str) -> Option<&str> {
        self.data.get(primary_key).and_then(Value::as_str)
    }

    /// Parse the revision string of this document.
    pub fn revision(&self) -> Result<Revision> {
        Revision::parse(&self.rev)
    }

    /// Project this document to its wire format.
    ///
    /// Strips `_rev` and `_attachments`, keeps user fields and `_deleted`.
    pub fn to_payload(&self) -> DocumentPayload {
        DocumentPayload {
            deleted: self.deleted,
            data: self.data.clone(),
        }
    }
}

/// A parsed revision string.
///
/// The height orders revisions of one document; the hash identifies the
/// writer that produced the revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Per-document revision counter, starting at 1.
    pub height: u64,
    /// Writer-identifying digest.
    pub hash: String,
}

impl Revision {
    /// Build a revision from its parts.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// Parse a `<height>-<hash>` revision string.
    pub fn parse(value: &str) -> Result<Self> {
        let (height, hash) = value
            .split_once('-')
            .ok_or_else(|| ReplicationError::InvalidRevision {
                value: value.to_string(),
            })?;
        let height: u64 = height
            .parse()
            .map_err(|_| ReplicationError::InvalidRevision {
                value: value.to_string(),
            })?;
        if hash.is_empty() {
            return Err(ReplicationError::InvalidRevision {
                value: value.to_string(),
            });
        }
        Ok(Self {
            height,
            hash: hash.to_string(),
        })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}
