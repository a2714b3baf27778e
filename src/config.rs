//! Configuration for a replication channel.
//!
//! A channel is configured in two halves:
//!
//! - [`ReplicationSettings`]: serializable scalars (identifier, liveness,
//!   intervals). Can be constructed programmatically or deserialized from
//!   JSON/YAML.
//! - [`PullConfig`] / [`PushConfig`]: the user-supplied remote handlers.
//!   These cannot be serialized; they are attached when building
//!   [`ReplicationOptions`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use offsync::config::ReplicationSettings;
//!
//! let settings = ReplicationSettings {
//!     live: true,
//!     ..ReplicationSettings::new("my-rest-endpoint")
//! };
//! ```
//!
//! # Liveness
//!
//! With `live = false` the channel runs one cycle (plus retries) and stops.
//! With `live = true` it keeps running until cancelled, driven by the pull
//! interval timer and/or the collection's change stream. A live channel with
//! only `push` configured has **no timer loop**: it relies entirely on
//! change-event wakeups, so do not expect periodic push polls.

use crate::collection::CollectionHandle;
use crate::document::DocumentPayload;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default pull poll interval for live channels (10 seconds).
fn default_live_interval_ms() -> u64 {
    10_000
}

/// Default wait before retrying a failed cycle (5 seconds).
fn default_retry_time_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Default number of documents per push batch.
const DEFAULT_PUSH_BATCH_SIZE: usize = 5;

/// Serializable settings for one replication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Stable identifier naming this sync channel. Scopes the checkpoint and
    /// the revision tags; changing it resets replication progress.
    pub replication_identifier: String,

    /// Keep replicating after the first successful cycle.
    #[serde(default)]
    pub live: bool,

    /// Pull poll interval in live mode, milliseconds.
    ///
    /// Only used when `pull` is configured; a push-only live channel is
    /// driven by change events alone.
    #[serde(default = "default_live_interval_ms")]
    pub live_interval_ms: u64,

    /// Wait before retrying a failed cycle, milliseconds.
    #[serde(default = "default_retry_time_ms")]
    pub retry_time_ms: u64,

    /// On multi-instance databases, defer replication until this instance is
    /// elected leader. No-op on single-instance databases.
    #[serde(default = "default_true")]
    pub wait_for_leadership: bool,
}

impl ReplicationSettings {
    /// Create one-shot settings with default intervals.
    pub fn new(replication_identifier: impl Into<String>) -> Self {
        Self {
            replication_identifier: replication_identifier.into(),
            live: false,
            live_interval_ms: default_live_interval_ms(),
            retry_time_ms: default_retry_time_ms(),
            wait_for_leadership: true,
        }
    }

    /// Settings with short intervals for tests.
    pub fn for_testing(replication_identifier: impl Into<String>) -> Self {
        Self {
            replication_identifier: replication_identifier.into(),
            live: false,
            live_interval_ms: 100,
            retry_time_ms: 50,
            wait_for_leadership: false,
        }
    }

    /// Pull poll interval as a `Duration`.
    pub fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    /// Retry wait as a `Duration`.
    pub fn retry_time(&self) -> Duration {
        Duration::from_millis(self.retry_time_ms)
    }
}

/// Error returned by user-supplied pull/push handlers.
///
/// Kept deliberately simple: the engine only needs to know the call failed
/// and have a message to log and broadcast.
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Wrap any error into a handler error.
    pub fn from_error(e: impl std::fmt::Display) -> Self {
        Self(e.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result type for handler calls.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Response of one pull handler call.
#[derive(Debug, Clone)]
pub struct PullResult {
    /// Remote documents in wire format, oldest first.
    pub documents: Vec<DocumentPayload>,

    /// Whether the remote has more documents after this page. When `true`
    /// the engine pulls again immediately instead of waiting for the next
    /// interval tick.
    pub has_more_documents: bool,
}

/// Fetches remote changes after a resume token.
///
/// `last_pulled` is the last document received from the remote (the resume
/// token persisted in the checkpoint), or `None` on first sync.
pub trait PullHandler: Send + Sync + 'static {
    /// Fetch the next page of remote changes.
    fn pull(
        &self,
        last_pulled: Option<DocumentPayload>,
    ) -> BoxFuture<'_, HandlerResult<PullResult>>;
}

/// Sends a batch of local changes to the remote.
///
/// A rejection means the whole batch failed; the engine retries the same
/// batch after `retry_time_ms`, so handlers should be idempotent.
pub trait PushHandler: Send + Sync + 'static {
    /// Deliver a batch of wire-format documents to the remote.
    fn push(&self, documents: Vec<DocumentPayload>) -> BoxFuture<'_, HandlerResult<()>>;
}

impl<F> PullHandler for F
where
    F: Fn(Option<DocumentPayload>) -> BoxFuture<'static, HandlerResult<PullResult>>
        + Send
        + Sync
        + 'static,
{
    fn pull(
        &self,
        last_pulled: Option<DocumentPayload>,
    ) -> BoxFuture<'_, HandlerResult<PullResult>> {
        (self)(last_pulled)
    }
}

impl<F> PushHandler for F
where
    F: Fn(Vec<DocumentPayload>) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync + 'static,
{
    fn push(&self, documents: Vec<DocumentPayload>) -> BoxFuture<'_, HandlerResult<()>> {
        (self)(documents)
    }
}

/// Pull half of a channel.
#[derive(Clone)]
pub struct PullConfig {
    /// The user-supplied remote fetch.
    pub handler: Arc<dyn PullHandler>,
}

impl PullConfig {
    /// Wrap a pull handler.
    pub fn new(handler: impl PullHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

/// Push half of a channel.
#[derive(Clone)]
pub struct PushConfig {
    /// The user-supplied remote delivery.
    pub handler: Arc<dyn PushHandler>,

    /// Maximum distinct documents per push batch.
    pub batch_size: usize,
}

impl PushConfig {
    /// Wrap a push handler with the default batch size.
    pub fn new(handler: impl PushHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            batch_size: DEFAULT_PUSH_BATCH_SIZE,
        }
    }

    /// Override the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Everything needed to start one replication channel.
pub struct ReplicationOptions<C: CollectionHandle> {
    /// The collection to replicate.
    pub collection: Arc<C>,

    /// Serializable channel settings.
    pub settings: ReplicationSettings,

    /// Pull half; `None` for push-only channels.
    pub pull: Option<PullConfig>,

    /// Push half; `None` for pull-only channels.
    pub push: Option<PushConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ReplicationSettings::new("endpoint-a");
        assert_eq!(settings.replication_identifier, "endpoint-a");
        assert!(!settings.live);
        assert_eq!(settings.live_interval_ms, 10_000);
        assert_eq!(settings.retry_time_ms, 5_000);
        assert!(settings.wait_for_leadership);
    }

    #[test]
    fn test_settings_durations() {
        let settings = ReplicationSettings::new("endpoint-a");
        assert_eq!(settings.live_interval(), Duration::from_secs(10));
        assert_eq!(settings.retry_time(), Duration::from_secs(5));
    }

    #[test]
    fn test_settings_for_testing() {
        let settings = ReplicationSettings::for_testing("t");
        assert_eq!(settings.retry_time_ms, 50);
        assert!(!settings.wait_for_leadership);
    }

    #[test]
    fn test_settings_deserialize_applies_defaults() {
        let settings: ReplicationSettings =
            serde_json::from_str(r#"{"replication_identifier": "x"}"#).unwrap();
        assert_eq!(settings.replication_identifier, "x");
        assert!(!settings.live);
        assert_eq!(settings.live_interval_ms, 10_000);
        assert_eq!(settings.retry_time_ms, 5_000);
        assert!(settings.wait_for_leadership);
    }

    #[test]
    fn test_settings_json_roundtrip() {
        let settings = ReplicationSettings {
            replication_identifier: "roundtrip".to_string(),
            live: true,
            live_interval_ms: 250,
            retry_time_ms: 100,
            wait_for_leadership: false,
        };
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: ReplicationSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.replication_identifier, "roundtrip");
        assert!(parsed.live);
        assert_eq!(parsed.live_interval_ms, 250);
        assert_eq!(parsed.retry_time_ms, 100);
        assert!(!parsed.wait_for_leadership);
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::from("network unreachable");
        assert_eq!(err.to_string(), "network unreachable");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_push_config_batch_size() {
        struct Noop;
        impl PushHandler for Noop {
            fn push(
                &self,
                _documents: Vec<DocumentPayload>,
            ) -> BoxFuture<'_, HandlerResult<()>> {
                Box::pin(async { Ok(()) })
            }
        }

        let config = PushConfig::new(Noop);
        assert_eq!(config.batch_size, DEFAULT_PUSH_BATCH_SIZE);
        let config = config.with_batch_size(42);
        assert_eq!(config.batch_size, 42);
    }
}
