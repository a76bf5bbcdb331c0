//! The controller manager.
//!
//! Owns the scheme and the controllers, serves health and metrics, and ties
//! controller lifetime to leadership. [`Manager::start`] blocks until the
//! shutdown token is cancelled and then drains in order:
//!
//! 1. Stop queue intake on every controller
//! 2. Stop the leader elector, which stops the controllers and releases the lease
//! 3. Wait up to the grace period, then abort whatever is left
//! 4. Stop the health and metrics servers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ManagerConfig;
use crate::controller::{Controller, EnqueueHandle};
use crate::error::RuntimeError;
use crate::health::{leader_checker, serve_health, CheckFamily, HealthChecks};
use crate::leader_election::{LeaderElector, LeaderState, LeadershipHandler};
use crate::lease::LeaseStore;
use crate::metrics::{serve_metrics, Metrics};
use crate::scheme::SchemeRegistry;

/// How long the HTTP servers get to finish open requests
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hosts controllers behind leader election
pub struct Manager {
    config: ManagerConfig,
    scheme: Arc<SchemeRegistry>,
    controllers: Vec<Arc<Controller>>,
    handles: HashMap<String, EnqueueHandle>,
    health: HealthChecks,
    metrics: Arc<Metrics>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    leader_state: Arc<watch::Sender<LeaderState>>,
    started: bool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("scheme", &self.scheme)
            .field("controllers", &self.controllers)
            .field("health", &self.health)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] if `config` is invalid, or
    /// [`RuntimeError::Metrics`] if the metrics registry cannot be built.
    pub fn new(config: ManagerConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let (leader_state, _) = watch::channel(LeaderState::Idle);
        Ok(Self {
            config,
            scheme: Arc::new(SchemeRegistry::new()),
            controllers: Vec::new(),
            handles: HashMap::new(),
            health: HealthChecks::new(),
            metrics: Arc::new(Metrics::new()?),
            lease_store: None,
            leader_state: Arc::new(leader_state),
            started: false,
        })
    }

    /// Use `store` for leader election leases
    #[must_use]
    pub fn with_lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn ensure_not_started(&self, action: &'static str) -> Result<(), RuntimeError> {
        if self.started {
            return Err(RuntimeError::AlreadyStarted(action));
        }
        Ok(())
    }

    /// Shared read-only view of the scheme
    #[must_use]
    pub fn scheme(&self) -> Arc<SchemeRegistry> {
        Arc::clone(&self.scheme)
    }

    /// Mutable access to the scheme before start.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyStarted`] after start, and
    /// [`RuntimeError::InvalidConfig`] while a handle from [`scheme`](Self::scheme)
    /// is still alive.
    pub fn scheme_mut(&mut self) -> Result<&mut SchemeRegistry, RuntimeError> {
        self.ensure_not_started("register types")?;
        Arc::get_mut(&mut self.scheme).ok_or_else(|| {
            RuntimeError::InvalidConfig(
                "scheme is shared and can no longer be modified".to_string(),
            )
        })
    }

    /// Register `K` in the scheme.
    ///
    /// # Errors
    ///
    /// See [`scheme_mut`](Self::scheme_mut) and [`SchemeRegistry::register_type`].
    pub fn register_type<K>(&mut self) -> Result<(), RuntimeError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + 'static,
    {
        self.scheme_mut()?.register_type::<K>()
    }

    /// Add a liveness predicate.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DuplicateHealthCheck`] or [`RuntimeError::AlreadyStarted`].
    pub fn add_health_check<F>(
        &mut self,
        name: impl Into<String>,
        check: F,
    ) -> Result<(), RuntimeError>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.ensure_not_started("add health checks")?;
        self.health.add(CheckFamily::Liveness, name, check)
    }

    /// Add a readiness predicate.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DuplicateHealthCheck`] or [`RuntimeError::AlreadyStarted`].
    pub fn add_readiness_check<F>(
        &mut self,
        name: impl Into<String>,
        check: F,
    ) -> Result<(), RuntimeError>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.ensure_not_started("add readiness checks")?;
        self.health.add(CheckFamily::Readiness, name, check)
    }

    /// Readiness predicate that passes while this replica leads.
    ///
    /// Always passes when leader election is disabled.
    #[must_use]
    pub fn leader_election_checker(
        &self,
    ) -> impl Fn() -> Result<(), String> + Send + Sync + 'static {
        let enabled = self.config.leader_election.is_some();
        let check = leader_checker(self.leader_state.subscribe());
        move || if enabled { check() } else { Ok(()) }
    }

    /// Watch the leadership state
    #[must_use]
    pub fn leader_state(&self) -> watch::Receiver<LeaderState> {
        self.leader_state.subscribe()
    }

    /// Metrics registry shared by every component
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Register a controller and get a handle for enqueueing into it.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DuplicateController`] or [`RuntimeError::AlreadyStarted`].
    pub fn register_controller(
        &mut self,
        controller: Controller,
    ) -> Result<EnqueueHandle, RuntimeError> {
        self.ensure_not_started("register controllers")?;
        if self.handles.contains_key(controller.name()) {
            return Err(RuntimeError::DuplicateController(controller.name().to_string()));
        }
        controller.instrument(&self.metrics);
        let handle = controller.enqueue_handle();
        self.handles.insert(controller.name().to_string(), handle.clone());
        info!(controller = %controller.name(), "Registered controller");
        self.controllers.push(Arc::new(controller));
        Ok(handle)
    }

    /// Enqueue handle of the controller named `name`
    #[must_use]
    pub fn enqueue_handle(&self, name: &str) -> Option<EnqueueHandle> {
        self.handles.get(name).cloned()
    }

    /// Health router with readiness bound to `shutdown`
    #[must_use]
    pub fn health_router(&self, shutdown: &CancellationToken) -> Router {
        self.health_checks(shutdown).router()
    }

    fn health_checks(&self, shutdown: &CancellationToken) -> Arc<HealthChecks> {
        let mut checks = self.health.clone();
        checks.fail_readiness_on(shutdown.clone());
        Arc::new(checks)
    }

    /// Run until `shutdown` is cancelled, then drain.
    ///
    /// Returns `Ok` after a normal shutdown, including one where the grace
    /// period ran out and remaining work was aborted.
    ///
    /// # Errors
    ///
    /// Setup failures (invalid configuration, missing lease store, bind
    /// errors) are returned before any leadership attempt.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        self.ensure_not_started("start the manager")?;
        self.started = true;

        let elector = match &self.config.leader_election {
            Some(election) => {
                election.validate()?;
                let store = self.lease_store.clone().ok_or_else(|| {
                    RuntimeError::InvalidConfig(
                        "leader election is enabled but no lease store is configured".to_string(),
                    )
                })?;
                let elector = LeaderElector::new(store, election.clone())
                    .with_state(Arc::clone(&self.leader_state));
                elector.instrument(self.metrics.leader_status(&election.lease_name));
                Some(Arc::new(elector))
            }
            None => None,
        };

        let health_listener = bind("health probe", self.config.health_probe_addr).await?;
        let metrics_listener = bind("metrics", self.config.metrics_addr).await?;

        let servers = CancellationToken::new();
        let mut server_tasks = JoinSet::new();
        if let Some(listener) = health_listener {
            let checks = self.health_checks(&shutdown);
            let token = servers.clone();
            server_tasks.spawn(async move {
                if let Err(e) = serve_health(listener, checks, token).await {
                    error!(error = %e, "Health probe server failed");
                }
            });
        }
        if let Some(listener) = metrics_listener {
            let metrics = Arc::clone(&self.metrics);
            let token = servers.clone();
            server_tasks.spawn(async move {
                if let Err(e) = serve_metrics(listener, metrics, token).await {
                    error!(error = %e, "Metrics server failed");
                }
            });
        }

        info!(
            controllers = self.controllers.len(),
            leader_election = elector.is_some(),
            "Starting manager"
        );

        let runner = Arc::new(ControllerRunner::new(self.controllers.clone()));
        let election_task = match elector {
            Some(elector) => {
                let handler = Arc::clone(&runner);
                let token = shutdown.clone();
                Some(tokio::spawn(async move { elector.run(handler, token).await }))
            }
            None => {
                self.leader_state.send_replace(LeaderState::Leading);
                runner.on_started_leading(shutdown.child_token()).await;
                None
            }
        };

        shutdown.cancelled().await;
        info!("Shutdown requested, stopping work queues");
        for controller in &self.controllers {
            controller.queue().shut_down();
        }

        let grace = self.config.graceful_shutdown_timeout;
        let drained = match election_task {
            Some(task) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(grace, task).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!(error = %e, "Leader election task failed");
                        true
                    }
                    Err(_) => {
                        abort.abort();
                        false
                    }
                }
            }
            None => {
                let drained = tokio::time::timeout(grace, runner.on_stopped_leading())
                    .await
                    .is_ok();
                self.leader_state.send_replace(LeaderState::Idle);
                drained
            }
        };
        if drained {
            info!("All controllers stopped");
        } else {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "Graceful shutdown timed out, aborting remaining reconciles"
            );
            runner.abort_all();
        }

        servers.cancel();
        if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, async {
            while server_tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("HTTP servers did not stop in time");
            server_tasks.abort_all();
        }

        info!("Manager stopped");
        Ok(())
    }
}

async fn bind(
    name: &'static str,
    addr: Option<SocketAddr>,
) -> Result<Option<TcpListener>, RuntimeError> {
    let Some(addr) = addr else {
        return Ok(None);
    };
    TcpListener::bind(addr)
        .await
        .map(Some)
        .map_err(|source| RuntimeError::Bind { name, addr, source })
}

/// Starts controllers when leadership is acquired and stops them when it ends
struct ControllerRunner {
    controllers: Vec<Arc<Controller>>,
    tasks: Mutex<JoinSet<()>>,
}

impl ControllerRunner {
    fn new(controllers: Vec<Arc<Controller>>) -> Self {
        Self {
            controllers,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn abort_all(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

#[async_trait]
impl LeadershipHandler for ControllerRunner {
    async fn on_started_leading(&self, leadership: CancellationToken) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for controller in &self.controllers {
            tasks.spawn(Arc::clone(controller).run(leadership.clone()));
        }
        info!(controllers = self.controllers.len(), "Started controllers");
    }

    async fn on_stopped_leading(&self) {
        // Owned here so dropping this future aborts the controllers.
        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
