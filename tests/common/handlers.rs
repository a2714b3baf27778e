//! Scripted remote for testing.
//!
//! Implements `PullHandler` and `PushHandler` with pre-programmed responses
//! and records every call for assertions. Pull responses are served from a
//! script queue; once the script is exhausted the remote reports an empty
//! page, which is what a drained real endpoint does.
//!
//! The remote also watches for overlapping handler calls: the engine
//! guarantees at most one push or pull in flight per replication state, and
//! `overlap_detected()` turns true if that guarantee is ever violated.

use futures::future::BoxFuture;
use offsync::config::{HandlerResult, PullHandler, PullResult, PushHandler};
use offsync::document::DocumentPayload;
use serde_json::{json, Map};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build a wire document with an `id` and a `name` field.
pub fn doc(id: &str, name: &str) -> DocumentPayload {
    let mut data = Map::new();
    data.insert("id".to_string(), json!(id));
    data.insert("name".to_string(), json!(name));
    DocumentPayload::new(data)
}

struct ScriptedPull {
    delay: Duration,
    result: Result<PullResult, String>,
}

/// A scripted remote endpoint that records all pull and push traffic.
pub struct ScriptedRemote {
    pull_script: Mutex<VecDeque<ScriptedPull>>,
    pull_calls: Mutex<Vec<Option<DocumentPayload>>>,
    push_batches: Mutex<Vec<Vec<DocumentPayload>>>,
    push_failures_remaining: AtomicUsize,
    handler_delay_ms: AtomicU64,
    in_flight: AtomicBool,
    overlap_detected: AtomicBool,
}

impl ScriptedRemote {
    /// Create a remote with an empty script: pulls return empty pages,
    /// pushes succeed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pull_script: Mutex::new(VecDeque::new()),
            pull_calls: Mutex::new(Vec::new()),
            push_batches: Mutex::new(Vec::new()),
            push_failures_remaining: AtomicUsize::new(0),
            handler_delay_ms: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            overlap_detected: AtomicBool::new(false),
        })
    }

    /// Queue a successful pull page.
    pub fn enqueue_pull_page(&self, documents: Vec<DocumentPayload>, has_more: bool) {
        self.pull_script.lock().unwrap().push_back(ScriptedPull {
            delay: Duration::ZERO,
            result: Ok(PullResult {
                documents,
                has_more_documents: has_more,
            }),
        });
    }

    /// Queue a successful pull page that takes `delay` to arrive.
    pub fn enqueue_pull_page_delayed(
        &self,
        documents: Vec<DocumentPayload>,
        has_more: bool,
        delay: Duration,
    ) {
        self.pull_script.lock().unwrap().push_back(ScriptedPull {
            delay,
            result: Ok(PullResult {
                documents,
                has_more_documents: has_more,
            }),
        });
    }

    /// Queue a pull rejection.
    pub fn enqueue_pull_error(&self, message: &str) {
        self.pull_script.lock().unwrap().push_back(ScriptedPull {
            delay: Duration::ZERO,
            result: Err(message.to_string()),
        });
    }

    /// Make the next `n` push calls fail.
    pub fn fail_next_pushes(&self, n: usize) {
        self.push_failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Delay every handler call by the given duration.
    pub fn set_handler_delay(&self, delay: Duration) {
        self.handler_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of pull calls made so far.
    pub fn pull_call_count(&self) -> usize {
        self.pull_calls.lock().unwrap().len()
    }

    /// Resume tokens the engine passed to pull, in call order.
    pub fn pull_calls(&self) -> Vec<Option<DocumentPayload>> {
        self.pull_calls.lock().unwrap().clone()
    }

    /// All push batches, including empty drain calls, in call order.
    pub fn push_batches(&self) -> Vec<Vec<DocumentPayload>> {
        self.push_batches.lock().unwrap().clone()
    }

    /// Push batches that actually carried documents.
    pub fn nonempty_push_batches(&self) -> Vec<Vec<DocumentPayload>> {
        self.push_batches
            .lock()
            .unwrap()
            .iter()
            .filter(|batch| !batch.is_empty())
            .cloned()
            .collect()
    }

    /// Whether a pushed document with this id exists in any batch.
    pub fn was_pushed(&self, id: &str) -> bool {
        self.push_batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|d| d.primary_id("id") == Some(id))
    }

    /// Whether two handler calls ever overlapped.
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlap_detected.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn global_delay(&self) -> Duration {
        Duration::from_millis(self.handler_delay_ms.load(Ordering::SeqCst))
    }
}

impl PullHandler for ScriptedRemote {
    fn pull(
        &self,
        last_pulled: Option<DocumentPayload>,
    ) -> BoxFuture<'_, HandlerResult<PullResult>> {
        Box::pin(async move {
            self.enter();
            self.pull_calls.lock().unwrap().push(last_pulled);

            let entry = self.pull_script.lock().unwrap().pop_front();
            let (delay, result) = match entry {
                Some(scripted) => (scripted.delay, scripted.result),
                None => (
                    Duration::ZERO,
                    Ok(PullResult {
                        documents: vec![],
                        has_more_documents: false,
                    }),
                ),
            };

            let total_delay = delay + self.global_delay();
            if !total_delay.is_zero() {
                tokio::time::sleep(total_delay).await;
            }

            self.exit();
            result.map_err(Into::into)
        })
    }
}

impl PushHandler for ScriptedRemote {
    fn push(&self, documents: Vec<DocumentPayload>) -> BoxFuture<'_, HandlerResult<()>> {
        Box::pin(async move {
            self.enter();
            self.push_batches.lock().unwrap().push(documents);

            let delay = self.global_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = if self
                .push_failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok()
            {
                Err("scripted push failure".into())
            } else {
                Ok(())
            };

            self.exit();
            result
        })
    }
}
