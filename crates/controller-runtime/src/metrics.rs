//! Prometheus metrics for queues, controllers and leader election.
//!
//! One [`Metrics`] registry is owned by the manager. Components receive
//! pre-labelled handles ([`QueueMetrics`], [`ControllerMetrics`]) when they are
//! registered, so the hot paths never look up label values.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::RuntimeError;

/// Metric handles for one work queue
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Keys ready to be handed out
    pub depth: IntGauge,
    /// Total adds
    pub adds: IntCounter,
    /// Total rate-limited requeues
    pub retries: IntCounter,
}

/// Metric handles for one controller
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    pub(crate) success: IntCounter,
    pub(crate) error: IntCounter,
    pub(crate) requeue: IntCounter,
    pub(crate) requeue_after: IntCounter,
    pub(crate) errors: IntCounter,
    pub(crate) duration: Histogram,
    pub(crate) active_workers: IntGauge,
}

/// Registry holding every runtime metric
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_errors: IntCounterVec,
    reconcile_time: HistogramVec,
    active_workers: IntGaugeVec,
    queue_depth: IntGaugeVec,
    queue_adds: IntCounterVec,
    queue_retries: IntCounterVec,
    leader_status: IntGaugeVec,
}

impl Metrics {
    /// Create and register all runtime metrics.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Metrics`] if a metric cannot be created or registered.
    pub fn new() -> Result<Self, RuntimeError> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "controller_runtime_reconcile_total",
                "Total number of reconciliations per controller",
            ),
            &["controller", "result"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new(
                "controller_runtime_reconcile_errors_total",
                "Total number of reconciliation errors per controller",
            ),
            &["controller"],
        )?;
        let reconcile_time = HistogramVec::new(
            HistogramOpts::new(
                "controller_runtime_reconcile_time_seconds",
                "Length of time per reconciliation per controller",
            ),
            &["controller"],
        )?;
        let active_workers = IntGaugeVec::new(
            Opts::new(
                "controller_runtime_active_workers",
                "Number of currently used workers per controller",
            ),
            &["controller"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("workqueue_depth", "Current depth of workqueue"),
            &["name"],
        )?;
        let queue_adds = IntCounterVec::new(
            Opts::new("workqueue_adds_total", "Total number of adds handled by workqueue"),
            &["name"],
        )?;
        let queue_retries = IntCounterVec::new(
            Opts::new(
                "workqueue_retries_total",
                "Total number of retries handled by workqueue",
            ),
            &["name"],
        )?;
        let leader_status = IntGaugeVec::new(
            Opts::new(
                "leader_election_master_status",
                "Gauge of if the reporting system is master of the relevant lease, \
                 0 indicates backup, 1 indicates master",
            ),
            &["name"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_time.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_adds.clone()))?;
        registry.register(Box::new(queue_retries.clone()))?;
        registry.register(Box::new(leader_status.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_errors,
            reconcile_time,
            active_workers,
            queue_depth,
            queue_adds,
            queue_retries,
            leader_status,
        })
    }

    /// Handles for the queue named `name`
    #[must_use]
    pub fn queue(&self, name: &str) -> QueueMetrics {
        QueueMetrics {
            depth: self.queue_depth.with_label_values(&[name]),
            adds: self.queue_adds.with_label_values(&[name]),
            retries: self.queue_retries.with_label_values(&[name]),
        }
    }

    /// Handles for the controller named `name`
    #[must_use]
    pub fn controller(&self, name: &str) -> ControllerMetrics {
        ControllerMetrics {
            success: self.reconcile_total.with_label_values(&[name, "success"]),
            error: self.reconcile_total.with_label_values(&[name, "error"]),
            requeue: self.reconcile_total.with_label_values(&[name, "requeue"]),
            requeue_after: self.reconcile_total.with_label_values(&[name, "requeue_after"]),
            errors: self.reconcile_errors.with_label_values(&[name]),
            duration: self.reconcile_time.with_label_values(&[name]),
            active_workers: self.active_workers.with_label_values(&[name]),
        }
    }

    /// Leader status gauge for the lease named `name`
    #[must_use]
    pub fn leader_status(&self, name: &str) -> IntGauge {
        self.leader_status.with_label_values(&[name])
    }

    /// Render every metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Metrics`] if encoding fails.
    pub fn render(&self) -> Result<String, RuntimeError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Router exposing `GET /metrics`
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve `/metrics` on `listener` until `shutdown` is cancelled.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Serving metrics");
    }
    axum::serve(listener, metrics.router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
