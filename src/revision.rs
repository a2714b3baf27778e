//! Revision tagging for pulled documents.
//!
//! When a pulled document is written locally it must carry a revision hash
//! that the next push cycle can recognize as "already came from this sync
//! channel, do not push back". Without the tag, every pull would re-trigger a
//! push of the same document and the channel would echo forever.
//!
//! The tag is a SHA-256 digest over the replication identifier mixed with the
//! canonical content of the document's wire projection. The predicate
//! [`revision_from_pull`] recomputes the digest from the stored document and
//! compares it with the hash portion of `_rev`.
//!
//! # One-Sidedness
//!
//! The predicate is approximate but one-sided:
//!
//! - It never returns `true` for a revision produced by a local user write
//!   (local writers do not mix the replication identifier into their hashes).
//! - It may return `false` for a document that did come from pull, if local
//!   storage mutated its content afterwards. That document is pushed once
//!   needlessly, which is harmless.
//!
//! False positives would lose local writes and are forbidden; false negatives
//! only cost bandwidth.
//!
//! # Canonical Digest
//!
//! JSON objects are digested with keys in sorted order and all strings
//! length-prefixed, so the digest does not depend on field ordering or on
//! ambiguous byte concatenation.

use crate::document::DocumentPayload;
use crate::document::StoredDocument;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the revision hash for a document pulled through the given
/// replication identifier.
///
/// The returned string is the hash portion of the new `_rev`; the caller
/// prepends the height (see [`crate::runner`]).
pub fn pulled_revision_hash(identifier: &str, payload: &DocumentPayload) -> String {
    let mut hasher = Sha256::new();
    update_str(&mut hasher, identifier);
    hasher.update(if payload.deleted { b"d" } else { b"l" });
    update_value(&mut hasher, &Value::Object(payload.data.clone()));
    hex::encode(hasher.finalize())
}

/// Check whether a stored document's revision was produced by a pull through
/// the given replication identifier.
///
/// Returns `false` for malformed revision strings: a document we cannot
/// classify must be pushed rather than silently skipped.
pub fn revision_from_pull(identifier: &str, doc: &StoredDocument) -> bool {
    match doc.revision() {
        Ok(rev) => rev.hash == pulled_revision_hash(identifier, &doc.to_payload()),
        Err(_) => false,
    }
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(true) => hasher.update(b"t"),
        Value::Bool(false) => hasher.update(b"f"),
        Value::Number(n) => {
            hasher.update(b"#");
            update_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update(b"s");
            update_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                update_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                update_str(hasher, key);
                update_value(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn payload(pairs: &[(&str, Value)]) -> DocumentPayload {
        let data: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        DocumentPayload::new(data)
    }

    fn stored(rev: &str, pairs: &[(&str, Value)]) -> StoredDocument {
        StoredDocument {
            rev: rev.to_string(),
            deleted: false,
            attachments: Map::new(),
            data: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let p = payload(&[("id", json!("a")), ("name", json!("alice"))]);
        assert_eq!(
            pulled_revision_hash("channel-1", &p),
            pulled_revision_hash("channel-1", &p)
        );
    }

    #[test]
    fn test_hash_depends_on_identifier() {
        let p = payload(&[("id", json!("a"))]);
        assert_ne!(
            pulled_revision_hash("channel-1", &p),
            pulled_revision_hash("channel-2", &p)
        );
    }

    #[test]
    fn test_hash_depends_on_content() {
        let p1 = payload(&[("id", json!("a")), ("name", json!("alice"))]);
        let p2 = payload(&[("id", json!("a")), ("name", json!("bob"))]);
        assert_ne!(
            pulled_revision_hash("channel-1", &p1),
            pulled_revision_hash("channel-1", &p2)
        );
    }

    #[test]
    fn test_hash_depends_on_tombstone() {
        let live = payload(&[("id", json!("a"))]);
        let mut dead = live.clone();
        dead.deleted = true;
        assert_ne!(
            pulled_revision_hash("channel-1", &live),
            pulled_revision_hash("channel-1", &dead)
        );
    }

    #[test]
    fn test_hash_ignores_field_order() {
        let mut a = Map::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!(2));
        let mut b = Map::new();
        b.insert("y".to_string(), json!(2));
        b.insert("x".to_string(), json!(1));
        assert_eq!(
            pulled_revision_hash("c", &DocumentPayload::new(a)),
            pulled_revision_hash("c", &DocumentPayload::new(b))
        );
    }

    #[test]
    fn test_predicate_recognizes_tagged_revision() {
        let p = payload(&[("id", json!("a")), ("name", json!("alice"))]);
        let hash = pulled_revision_hash("channel-1", &p);
        let doc = stored(
            &format!("1-{}", hash),
            &[("id", json!("a")), ("name", json!("alice"))],
        );
        assert!(revision_from_pull("channel-1", &doc));
    }

    #[test]
    fn test_predicate_rejects_local_revision() {
        // Local writers hash content without the identifier; any fixed or
        // random hash must not match.
        let doc = stored("1-0123456789abcdef", &[("id", json!("a"))]);
        assert!(!revision_from_pull("channel-1", &doc));
    }

    #[test]
    fn test_predicate_rejects_other_identity() {
        let p = payload(&[("id", json!("a"))]);
        let hash = pulled_revision_hash("channel-1", &p);
        let doc = stored(&format!("1-{}", hash), &[("id", json!("a"))]);
        assert!(!revision_from_pull("channel-2", &doc));
    }

    #[test]
    fn test_predicate_rejects_after_local_mutation() {
        // Pulled then mutated locally: the stored content no longer matches
        // the digest, so the document is pushed (false negative is allowed).
        let p = payload(&[("id", json!("a")), ("name", json!("alice"))]);
        let hash = pulled_revision_hash("channel-1", &p);
        let doc = stored(
            &format!("2-{}", hash),
            &[("id", json!("a")), ("name", json!("eve"))],
        );
        assert!(!revision_from_pull("channel-1", &doc));
    }

    #[test]
    fn test_predicate_rejects_malformed_revision() {
        let doc = stored("not-a-rev", &[("id", json!("a"))]);
        assert!(!revision_from_pull("channel-1", &doc));
    }
}
