//! Controllers: a reconciler bound to watch sources and a work queue.
//!
//! Each controller owns one [`WorkQueue`] of [`ObjectKey`]s and a pool of
//! worker tasks. Workers pull a key, call the [`Reconciler`], and decide from
//! the outcome whether and when the key comes back:
//!
//! | Outcome | Action |
//! |---|---|
//! | `Ok` with `requeue_after = d` | forget backoff, re-add after `d` |
//! | `Ok` with `requeue = true` | re-add with per-key backoff |
//! | `Err` or panic | re-add with per-key backoff, log the error |
//! | `Ok` otherwise | forget backoff |
//!
//! The queue guarantees a key is never processed by two workers at once.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use kube::Resource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{ItemBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::error::RuntimeError;
use crate::metrics::{ControllerMetrics, Metrics};
use crate::source::Source;
use crate::workqueue::WorkQueue;

/// Namespace and name of an object; cluster-scoped objects have no namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Some(namespace.into()), name)
    }

    /// Key of any Kubernetes object
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(meta.namespace.clone(), meta.name.clone().unwrap_or_default())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A request to reconcile one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    /// Object to reconcile
    pub key: ObjectKey,
    /// Delay before the request becomes visible to workers
    pub requeue_after: Option<Duration>,
}

impl ReconcileRequest {
    /// An immediate request
    #[must_use]
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            requeue_after: None,
        }
    }

    /// A request that becomes visible after `delay`
    #[must_use]
    pub fn after(key: ObjectKey, delay: Duration) -> Self {
        Self {
            key,
            requeue_after: Some(delay),
        }
    }
}

/// What the reconciler wants to happen next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Retry with backoff
    pub requeue: bool,
    /// Retry after a fixed delay; takes precedence over `requeue`
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Converged; no follow-up
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Not converged yet; retry with backoff
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Check again after `delay`
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// Error returned by reconcilers; never fatal to the controller
pub type ReconcileError = anyhow::Error;

/// Domain logic driving one object towards its desired state
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile the object named by `request`
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult, ReconcileError>;
}

/// Enqueues requests for a controller from outside its sources
#[derive(Debug, Clone)]
pub struct EnqueueHandle {
    queue: WorkQueue<ObjectKey>,
}

impl EnqueueHandle {
    /// Enqueue `key` now
    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Enqueue a request, honouring its delay
    pub fn enqueue_request(&self, request: ReconcileRequest) {
        match request.requeue_after {
            Some(delay) => self.queue.add_after(request.key, delay),
            None => self.queue.add(request.key),
        }
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    sources: Vec<Arc<dyn Source>>,
    concurrency: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ControllerBuilder {
    /// Add a watch source
    #[must_use]
    pub fn watches(mut self, source: impl Source + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Number of workers (default 1)
    #[must_use]
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    /// Requeue backoff after errors (default 5ms doubling to 1000s)
    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Validate and build the controller.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for an empty name, zero workers
    /// or a base delay above the cap.
    pub fn build(self) -> Result<Controller, RuntimeError> {
        if self.name.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "controller name must not be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "controller {} needs at least one worker",
                self.name
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(RuntimeError::InvalidConfig(format!(
                "controller {} backoff base {:?} exceeds cap {:?}",
                self.name, self.base_delay, self.max_delay
            )));
        }

        let queue = WorkQueue::new(
            self.name.clone(),
            ItemBackoff::new(self.base_delay, self.max_delay),
        );
        Ok(Controller {
            name: self.name,
            reconciler: self.reconciler,
            sources: self.sources,
            concurrency: self.concurrency,
            queue,
            metrics: OnceLock::new(),
        })
    }
}

/// A reconciler with its queue, sources and worker pool
pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    sources: Vec<Arc<dyn Source>>,
    concurrency: usize,
    queue: WorkQueue<ObjectKey>,
    metrics: OnceLock<ControllerMetrics>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("sources", &self.sources.iter().map(|s| s.describe()).collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Start building a controller named `name`
    pub fn builder(name: impl Into<String>, reconciler: impl Reconciler) -> ControllerBuilder {
        Self::builder_shared(name, Arc::new(reconciler))
    }

    /// Like [`builder`](Self::builder), for a reconciler that is already shared
    pub fn builder_shared(
        name: impl Into<String>,
        reconciler: Arc<dyn Reconciler>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            name: name.into(),
            reconciler,
            sources: Vec::new(),
            concurrency: 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Controller name, unique within a manager
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The controller's queue
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Handle for enqueueing requests from elsewhere
    #[must_use]
    pub fn enqueue_handle(&self) -> EnqueueHandle {
        EnqueueHandle {
            queue: self.queue.clone(),
        }
    }

    pub(crate) fn instrument(&self, metrics: &Metrics) {
        self.queue.instrument(metrics.queue(&self.name));
        let _ = self.metrics.set(metrics.controller(&self.name));
    }

    /// Run sources and workers until `stop` is cancelled or the queue shuts down.
    ///
    /// Workers finish the key they hold before exiting. Dropping the returned
    /// future aborts every task it spawned.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!(
            controller = %self.name,
            workers = self.concurrency,
            sources = self.sources.len(),
            "Starting controller"
        );

        let mut tasks = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            let queue = self.queue.clone();
            let stop = stop.clone();
            tasks.spawn(async move { source.run(queue, stop).await });
        }
        for worker in 0..self.concurrency {
            let controller = Arc::clone(&self);
            let stop = stop.clone();
            tasks.spawn(async move { controller.worker(worker, stop).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(controller = %self.name, error = %e, "Controller task failed");
            }
        }

        info!(controller = %self.name, "Controller stopped");
    }

    async fn worker(&self, worker: usize, stop: CancellationToken) {
        debug!(controller = %self.name, worker, "Worker started");
        loop {
            let key = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key).await;
        }
        debug!(controller = %self.name, worker, "Worker stopped");
    }

    async fn process(&self, key: ObjectKey) {
        let metrics = self.metrics.get();
        if let Some(m) = metrics {
            m.active_workers.inc();
        }
        let started = Instant::now();
        let in_flight = InFlight {
            queue: &self.queue,
            key: &key,
            metrics,
        };

        let request = ReconcileRequest::new(key.clone());
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(request))
            .catch_unwind()
            .await;
        std::mem::forget(in_flight);

        if let Some(m) = metrics {
            m.duration.observe(started.elapsed().as_secs_f64());
            m.active_workers.dec();
        }

        match outcome {
            Ok(Ok(ReconcileResult {
                requeue_after: Some(delay),
                ..
            })) => {
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
                debug!(
                    controller = %self.name,
                    key = %key,
                    delay_ms = delay.as_millis(),
                    "Requeue after delay"
                );
                if let Some(m) = metrics {
                    m.requeue_after.inc();
                }
            }
            Ok(Ok(ReconcileResult { requeue: true, .. })) => {
                let delay = self.queue.add_rate_limited(key.clone());
                debug!(
                    controller = %self.name,
                    key = %key,
                    delay_ms = delay.as_millis(),
                    "Requeue with backoff"
                );
                if let Some(m) = metrics {
                    m.requeue.inc();
                }
            }
            Ok(Ok(_)) => {
                self.queue.forget(&key);
                debug!(controller = %self.name, key = %key, "Reconciled");
                if let Some(m) = metrics {
                    m.success.inc();
                }
            }
            Ok(Err(e)) => {
                let delay = self.queue.add_rate_limited(key.clone());
                error!(
                    controller = %self.name,
                    key = %key,
                    error = %format!("{e:#}"),
                    retry_ms = delay.as_millis(),
                    "Reconciler error"
                );
                record_error(metrics);
            }
            Err(panic) => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    controller = %self.name,
                    key = %key,
                    panic = %panic_message(panic.as_ref()),
                    retry_ms = delay.as_millis(),
                    "Reconciler panicked"
                );
                record_error(metrics);
            }
        }

        self.queue.done(&key);
    }
}

/// Hands the key back to the queue if the worker is aborted mid-reconcile
struct InFlight<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: &'a ObjectKey,
    metrics: Option<&'a ControllerMetrics>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.metrics {
            m.active_workers.dec();
        }
        self.queue.add(self.key.clone());
        self.queue.done(self.key);
    }
}

fn record_error(metrics: Option<&ControllerMetrics>) {
    if let Some(m) = metrics {
        m.error.inc();
        m.errors.inc();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
