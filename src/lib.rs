//! # offsync
//!
//! A bidirectional replication engine for offline-first document
//! collections.
//!
//! The engine synchronizes a local collection of JSON documents with an
//! opaque remote endpoint exposed as two user-supplied handlers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                offsync                                   │
//! │                                                                          │
//! │  ┌────────────┐   ┌──────────────────┐   ┌────────────────────────────┐  │
//! │  │ Controller │──▶│   Cycle Runner   │──▶│ Change Collector ─▶ push() │  │
//! │  │ (wakeups)  │   │ (serialize +     │   │ pull() ─▶ Revision Tagger  │  │
//! │  └────────────┘   │  coalesce)       │   │        ─▶ bulk apply       │  │
//! │        │          └──────────────────┘   └────────────────────────────┘  │
//! │        ▼                                              │                  │
//! │  ┌────────────┐                           ┌──────────────────────────┐   │
//! │  │ change     │                           │ Checkpoint Store         │   │
//! │  │ stream /   │                           │ (push cursor + pull      │   │
//! │  │ interval   │                           │  resume token)           │   │
//! │  └────────────┘                           └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## How a cycle works
//!
//! One cycle is push-then-pull. Push reads the local change feed after the
//! persisted cursor, filters out documents whose revision was produced by
//! this channel's own pull (echo suppression), and delivers batches to the
//! push handler. Pull asks the pull handler for pages after the persisted
//! resume token and applies them locally with pull-tagged revisions so the
//! next push recognizes them and does not send them back.
//!
//! Cycles are serialized per channel and re-entrant triggers coalesce, so a
//! flood of local writes never runs cycles in parallel or unboundedly.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offsync::{replicate_collection, ReplicationOptions, ReplicationSettings};
//! use offsync::config::{PullConfig, PushConfig};
//! use offsync::memory::MemoryCollection;
//! use std::sync::Arc;
//!
//! # async fn example(pull: PullConfig, push: PushConfig) {
//! let collection = Arc::new(MemoryCollection::new("heroes", "id"));
//!
//! let state = replicate_collection(ReplicationOptions {
//!     collection,
//!     settings: ReplicationSettings {
//!         live: true,
//!         ..ReplicationSettings::new("my-rest-endpoint")
//!     },
//!     pull: Some(pull),
//!     push: Some(push),
//! });
//!
//! state.await_initial_replication().await;
//! // ... later:
//! state.cancel();
//! # }
//! ```
//!
//! ## Non-goals
//!
//! Conflict resolution (the remote is authoritative), transport selection
//! (HTTP, WebSocket, anything goes inside the handlers), multi-peer
//! topologies, and encryption at rest.

pub mod changes;
pub mod checkpoint;
pub mod collection;
pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod revision;
pub mod runner;

// Re-exports for convenience
pub use collection::{ChangeEvent, ChangeFeedRow, CollectionHandle, DatabaseHandle};
pub use config::{
    PullConfig, PullHandler, PullResult, PushConfig, PushHandler, ReplicationOptions,
    ReplicationSettings,
};
pub use controller::replicate_collection;
pub use document::{DocumentPayload, Revision, StoredDocument};
pub use error::{ReplicationError, Result};
pub use runner::ReplicationState;
