//! Per-kind rate-limited work queue (spec §4.9/§5): the orchestrator owns
//! one of these per watched kind. Keys are deduplicated while a worker has
//! them checked out, and a failed item is re-added on an exponential
//! backoff schedule computed with the `exponential_backoff` crate —
//! generalized here from a single retrying task
//! (`conductor::tasks::runner::run_background_task`'s per-task retry loop)
//! into a per-key delayed-requeue schedule.

use exponential_backoff::Backoff;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const DEFAULT_RETRIES: u32 = 15;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

struct Inner<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    failures: std::collections::HashMap<K, u32>,
    shutting_down: bool,
}

/// A level-triggered, per-key-deduplicating queue: adding a key already
/// queued is a no-op, and adding a key currently being processed marks it
/// "dirty" rather than dropping the event, so repeated events for the same
/// object coalesce into a single pending reconcile that runs once the
/// in-flight one finishes (spec §5 ordering guarantees).
pub struct WorkQueue<K: Eq + Hash + Clone + Send + 'static> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K: Eq + Hash + Clone + Send + 'static> WorkQueue<K> {
    pub fn new() -> Arc<Self> {
        Self::with_backoff(DEFAULT_RETRIES, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(retries: u32, base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(WorkQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                failures: std::collections::HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            retries,
            base_delay,
            max_delay,
        })
    }

    /// Enqueues `key` immediately unless it's already queued. A key
    /// currently checked out by a worker is marked dirty instead of
    /// re-queued here: `done` redelivers it once the in-flight pass
    /// finishes, so the event isn't lost, just coalesced (spec §5).
    pub async fn add(self: &Arc<Self>, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if inner.queued.contains(&key) {
            return;
        }
        inner.queued.insert(key.clone());
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-adds `key` after the backoff delay for its current failure count,
    /// then increments the count. A key that exhausts its retry budget is
    /// added with the maximum delay rather than dropped — the spec's work
    /// queue has no "poison" state, only slower rechecks.
    pub async fn add_rate_limited(self: &Arc<Self>, key: K) {
        let attempt = {
            let mut inner = self.inner.lock().await;
            let count = inner.failures.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count += 1;
            attempt
        };
        let delay = self.backoff_delay(attempt);
        self.add_after(key, delay).await;
    }

    /// Clears any recorded failure count for `key` — called after a
    /// successful process so its next failure starts the backoff schedule
    /// from the beginning.
    pub async fn forget(&self, key: &K) {
        self.inner.lock().await.failures.remove(key);
    }

    /// Schedules `key` to be added after `delay`, without blocking the
    /// caller (spawns a detached sleep).
    pub async fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(key).await;
        });
    }

    /// Dequeues the next key, blocking until one is available or the queue
    /// is shut down (in which case `None` is returned). The key is marked
    /// "processing" until `done` is called, so re-adds during processing
    /// coalesce rather than double-dispatch.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks `key` no longer in flight. Callers invoke this after `forget`
    /// (success) or `add_rate_limited` (failure) regardless of outcome. If
    /// an `add` arrived while the key was checked out, it's redelivered now
    /// rather than lost.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        if inner.dirty.remove(key) {
            inner.queued.insert(key.clone());
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Backoff::new(self.retries, self.base_delay, self.max_delay)
            .into_iter()
            .nth(attempt as usize)
            .unwrap_or(self.max_delay)
    }
}
