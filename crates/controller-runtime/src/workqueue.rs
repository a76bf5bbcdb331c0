//! Rate-limited, deduplicating work queue.
//!
//! Keys move through three sets guarded by one mutex:
//!
//! - `queue`: keys ready to be handed to a worker, in FIFO order
//! - `dirty`: keys that need processing (everything in `queue`, plus keys
//!   re-added while a worker holds them)
//! - `processing`: keys currently held by a worker
//!
//! A key is never in `queue` while it is in `processing`, which gives
//! single-flight per key: a key re-added during its reconcile is parked in
//! `dirty` and only re-queued once the worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backoff::ItemBackoff;
use crate::metrics::QueueMetrics;

/// Shared handle to a work queue. Cloning is cheap and every clone refers to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    /// Cancelled on shut down; pending delayed adds observe it
    shutdown: CancellationToken,
    metrics: OnceLock<QueueMetrics>,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    backoff: ItemBackoff<K>,
    shutting_down: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose requeue delays follow `backoff`.
    #[must_use]
    pub fn new(name: impl Into<String>, backoff: ItemBackoff<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    backoff,
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                metrics: OnceLock::new(),
            }),
        }
    }

    /// Name of the queue (the owning controller's name)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach metric handles. Only the first call has an effect.
    pub(crate) fn instrument(&self, metrics: QueueMetrics) {
        let _ = self.inner.metrics.set(metrics);
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, depth: usize) {
        if let Some(metrics) = self.inner.metrics.get() {
            metrics.depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
        }
    }

    /// Mark `key` as needing processing.
    ///
    /// Adding a key that is already pending only refreshes its dirty marker.
    /// Adding a key that a worker currently holds defers it until
    /// [`done`](Self::done). Ignored once the queue is shutting down.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if let Some(metrics) = self.inner.metrics.get() {
            metrics.adds.inc();
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.record_depth(state.queue.len());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `key` after `delay` has elapsed.
    ///
    /// The pending add is dropped if the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key),
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Add `key` after its per-item backoff delay and record a failure.
    ///
    /// Returns the delay that was applied.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.state().backoff.next_delay(&key);
        if let Some(metrics) = self.inner.metrics.get() {
            metrics.retries.inc();
        }
        self.add_after(key, delay);
        delay
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.state().backoff.forget(key);
    }

    /// Number of consecutive rate-limited requeues of `key`
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().backoff.failures(key)
    }

    /// Wait for the next key.
    ///
    /// The key is moved to the processing set and the caller must call
    /// [`done`](Self::done) once finished with it. Returns `None` once the
    /// queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register interest before inspecting the state so an add between
            // the check and the await is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(state.queue.len());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing. If it was re-added meanwhile, it is queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queue.push_back(key.clone());
        self.record_depth(state.queue.len());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Stop accepting keys and wake every waiting worker.
    ///
    /// Idempotent. Keys already handed out may still be released with [`done`](Self::done).
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys ready to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no keys are ready to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }

    /// Number of keys currently held by workers
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(
            "test",
            ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        q.add("a");

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_deferred_until_done() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out again");
        assert_eq!(q.in_flight(), 1);

        q.done(&key);
        assert_eq!(q.len(), 1, "dirty key is re-queued exactly once");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        q.add("a");
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn test_every_waiting_worker_is_woken() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.add("a");
        q.add("b");
        q.add("c");

        let mut got = Vec::new();
        for waiter in waiters {
            got.push(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiters_and_rejects_adds() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.shut_down();
        q.shut_down();
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, None);

        q.add("a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_add_after_delays_visibility() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_millis(50));
        assert!(q.is_empty());

        let got = timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_add_after_dropped_on_shutdown() {
        let q = queue();
        q.add_after("a", Duration::from_millis(20));
        q.shut_down();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_delays_grow_and_reset() {
        let q = queue();

        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(5));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(20));
        assert_eq!(q.num_requeues(&"a"), 3);
        assert_eq!(q.add_rate_limited("b"), Duration::from_millis(5));

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(5));

        // the delayed adds collapse into one pending entry per key
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.len(), 2);
    }
}
