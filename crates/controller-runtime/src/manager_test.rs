use super::*;
use crate::controller::{ObjectKey, ReconcileError, ReconcileRequest, ReconcileResult, Reconciler};
use crate::health::ping;
use crate::leader_election::LeaderElectionConfig;
use crate::lease::{InMemoryLeaseStore, LeaseError, LeaseRecord, VersionedLease};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use k8s_openapi::api::core::v1::ConfigMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tower::ServiceExt;

const LEASE: &str = "eebeeb01.service.binding";

fn quiet_config() -> ManagerConfig {
    ManagerConfig {
        health_probe_addr: None,
        metrics_addr: None,
        leader_election: None,
        graceful_shutdown_timeout: Duration::from_secs(2),
    }
}

fn election_config() -> ManagerConfig {
    ManagerConfig {
        leader_election: Some(LeaderElectionConfig {
            lease_name: LEASE.to_string(),
            identity: "replica-a".to_string(),
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_millis(600),
            retry_period: Duration::from_millis(100),
            release_on_cancel: true,
        }),
        ..quiet_config()
    }
}

/// Fails the first `failures` calls, records call times
struct Flaky {
    failures: usize,
    calls: Mutex<Vec<Instant>>,
}

impl Flaky {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reconciler for Arc<Flaky> {
    async fn reconcile(
        &self,
        _request: ReconcileRequest,
    ) -> Result<ReconcileResult, ReconcileError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len()
        };
        if attempt <= self.failures {
            anyhow::bail!("dependency not ready (attempt {attempt})");
        }
        Ok(ReconcileResult::done())
    }
}

/// Never finishes within any reasonable grace period
struct Stuck {
    started: AtomicUsize,
}

#[async_trait]
impl Reconciler for Arc<Stuck> {
    async fn reconcile(
        &self,
        _request: ReconcileRequest,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_secs(60)).await;
        Ok(ReconcileResult::done())
    }
}

/// Writes shared by every replica; counts reconciles running at once
#[derive(Default)]
struct Writers {
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
}

struct Writing(Arc<Writers>);

impl Drop for Writing {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds its key for `hold`, whether or not leadership lasts that long
struct SlowWriter {
    writers: Arc<Writers>,
    hold: Duration,
}

#[async_trait]
impl Reconciler for SlowWriter {
    async fn reconcile(
        &self,
        _request: ReconcileRequest,
    ) -> Result<ReconcileResult, ReconcileError> {
        let now = self.writers.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _writing = Writing(Arc::clone(&self.writers));
        self.writers.max_active.fetch_max(now, Ordering::SeqCst);
        self.writers.started.fetch_add(1, Ordering::SeqCst);
        sleep(self.hold).await;
        Ok(ReconcileResult::done())
    }
}

/// Lease store that can be cut off from the shared leases
struct Partitioned {
    inner: InMemoryLeaseStore,
    cut: AtomicBool,
}

impl Partitioned {
    fn check(&self) -> Result<(), LeaseError> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(LeaseError::Storage("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for Partitioned {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError> {
        self.check()?;
        self.inner.get(name).await
    }

    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, LeaseError> {
        self.check()?;
        self.inner.create(name, record).await
    }

    async fn update(
        &self,
        name: &str,
        record: LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        self.check()?;
        self.inner.update(name, record, version).await
    }
}

fn replica(identity: &str, store: Arc<dyn LeaseStore>, writers: &Arc<Writers>) -> Manager {
    let mut config = election_config();
    if let Some(election) = config.leader_election.as_mut() {
        election.identity = identity.to_string();
    }
    let mut manager = Manager::new(config).unwrap().with_lease_store(store);
    let reconciler = SlowWriter {
        writers: Arc::clone(writers),
        hold: Duration::from_secs(3),
    };
    manager
        .register_controller(Controller::builder("bindings", reconciler).build().unwrap())
        .unwrap()
        .enqueue(key());
    manager
}

async fn status(router: &Router, uri: &str) -> StatusCode {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

async fn wait_for_status(router: &Router, uri: &str, want: StatusCode) {
    timeout(Duration::from_secs(3), async {
        while status(router, uri).await != want {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{uri} never returned {want}"));
}

fn key() -> ObjectKey {
    ObjectKey::namespaced("default", "my-binding")
}

#[tokio::test]
async fn test_end_to_end_with_leader_election() {
    let store = InMemoryLeaseStore::new();
    let mut manager = Manager::new(election_config())
        .unwrap()
        .with_lease_store(Arc::new(store.clone()));
    manager.add_health_check("ping", ping).unwrap();
    manager.add_readiness_check("ping", ping).unwrap();
    let leader = manager.leader_election_checker();
    manager.add_readiness_check("leader", leader).unwrap();

    let reconciler = Flaky::new(2);
    let base = Duration::from_millis(20);
    let controller = Controller::builder("bindings", Arc::clone(&reconciler))
        .backoff(base, Duration::from_secs(1))
        .build()
        .unwrap();
    let handle = manager.register_controller(controller).unwrap();
    handle.enqueue(key());

    let shutdown = CancellationToken::new();
    let router = manager.health_router(&shutdown);
    assert_eq!(status(&router, "/healthz").await, StatusCode::OK);
    assert_eq!(status(&router, "/readyz").await, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reconciler.calls().is_empty());

    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = manager.start(shutdown).await;
            (manager, result)
        })
    };

    wait_for_status(&router, "/readyz", StatusCode::OK).await;
    assert!(store.record(LEASE).unwrap().is_held_by("replica-a"));

    timeout(Duration::from_secs(3), async {
        while reconciler.calls().len() < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(200)).await;

    let calls = reconciler.calls();
    assert_eq!(calls.len(), 3, "two failures and one success");
    assert!(calls[1] - calls[0] >= base);
    assert!(calls[2] - calls[1] >= base * 2);

    // a later failure-free add is reconciled once, with no leftover backoff
    handle.enqueue(key());
    timeout(Duration::from_secs(1), async {
        while reconciler.calls().len() < 4 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let cancelled_at = Instant::now();
    shutdown.cancel();
    assert_eq!(status(&router, "/readyz").await, StatusCode::INTERNAL_SERVER_ERROR);

    let (manager, result) = timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
    result.unwrap();
    assert!(cancelled_at.elapsed() < manager.config().graceful_shutdown_timeout);
    assert_eq!(*manager.leader_state().borrow(), LeaderState::Idle);

    let record = store.record(LEASE).unwrap();
    assert_eq!(record.holder(), None, "lease released on shutdown");
}

#[tokio::test]
async fn test_without_election_controllers_start_immediately() {
    let mut manager = Manager::new(quiet_config()).unwrap();
    let leader = manager.leader_election_checker();
    manager.add_readiness_check("leader", leader).unwrap();

    let reconciler = Flaky::new(0);
    let handle = manager
        .register_controller(
            Controller::builder("bindings", Arc::clone(&reconciler))
                .build()
                .unwrap(),
        )
        .unwrap();

    let shutdown = CancellationToken::new();
    let router = manager.health_router(&shutdown);
    assert_eq!(status(&router, "/readyz").await, StatusCode::OK);

    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.start(shutdown).await })
    };

    handle.enqueue(key());
    timeout(Duration::from_secs(1), async {
        while reconciler.calls().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    timeout(Duration::from_secs(3), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_grace_period_overrun_still_returns_ok() {
    let mut config = quiet_config();
    config.graceful_shutdown_timeout = Duration::from_millis(100);
    let mut manager = Manager::new(config).unwrap();

    let reconciler = Arc::new(Stuck {
        started: AtomicUsize::new(0),
    });
    let handle = manager
        .register_controller(
            Controller::builder("stuck", Arc::clone(&reconciler))
                .build()
                .unwrap(),
        )
        .unwrap();
    handle.enqueue(key());

    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.start(shutdown).await })
    };
    timeout(Duration::from_secs(1), async {
        while reconciler.started.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let cancelled_at = Instant::now();
    shutdown.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_registration_errors() {
    let mut manager = Manager::new(quiet_config()).unwrap();
    let build = || {
        Controller::builder("bindings", Flaky::new(0))
            .build()
            .unwrap()
    };

    manager.register_controller(build()).unwrap();
    assert!(matches!(
        manager.register_controller(build()),
        Err(RuntimeError::DuplicateController(name)) if name == "bindings"
    ));
    assert!(manager.enqueue_handle("bindings").is_some());
    assert!(manager.enqueue_handle("missing").is_none());

    manager.add_health_check("ping", ping).unwrap();
    assert!(matches!(
        manager.add_health_check("ping", ping),
        Err(RuntimeError::DuplicateHealthCheck { .. })
    ));

    manager.register_type::<ConfigMap>().unwrap();
    assert!(matches!(
        manager.register_type::<ConfigMap>(),
        Err(RuntimeError::DuplicateType(_))
    ));

    let shared = manager.scheme();
    assert!(manager.scheme_mut().is_err());
    drop(shared);
    assert!(manager.scheme_mut().is_ok());

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    manager.start(shutdown).await.unwrap();

    assert!(matches!(
        manager.register_controller(build()),
        Err(RuntimeError::AlreadyStarted(_))
    ));
    assert!(matches!(
        manager.add_readiness_check("late", ping),
        Err(RuntimeError::AlreadyStarted(_))
    ));
    assert!(matches!(
        manager.register_type::<k8s_openapi::api::core::v1::Pod>(),
        Err(RuntimeError::AlreadyStarted(_))
    ));
    assert!(matches!(
        manager.start(CancellationToken::new()).await,
        Err(RuntimeError::AlreadyStarted(_))
    ));
}

#[tokio::test]
async fn test_election_without_store_fails_setup() {
    let mut manager = Manager::new(election_config()).unwrap();
    let err = manager.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_bind_failure_fails_setup() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let mut manager = Manager::new(ManagerConfig {
        health_probe_addr: Some(addr),
        ..quiet_config()
    })
    .unwrap();
    let err = manager.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Bind { name: "health probe", .. }));
}

#[tokio::test]
async fn test_invalid_election_timing_rejected() {
    let mut config = election_config();
    if let Some(election) = config.leader_election.as_mut() {
        election.retry_period = election.renew_deadline;
    }
    assert!(matches!(Manager::new(config), Err(RuntimeError::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_leadership_stops_writes_before_standby_takes_over() {
    let store = InMemoryLeaseStore::new();
    let writers = Arc::new(Writers::default());
    let first_store = Arc::new(Partitioned {
        inner: store.clone(),
        cut: AtomicBool::new(false),
    });

    let mut first = replica("replica-a", first_store.clone(), &writers);
    let first_state = first.leader_state();
    let first_shutdown = CancellationToken::new();
    let first_task = {
        let shutdown = first_shutdown.clone();
        tokio::spawn(async move { first.start(shutdown).await })
    };
    timeout(Duration::from_secs(2), async {
        while writers.started.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut second = replica("replica-b", Arc::new(store.clone()), &writers);
    let second_state = second.leader_state();
    let second_shutdown = CancellationToken::new();
    let second_task = {
        let shutdown = second_shutdown.clone();
        tokio::spawn(async move { second.start(shutdown).await })
    };
    sleep(Duration::from_millis(200)).await;
    assert_eq!(*second_state.borrow(), LeaderState::Acquiring);

    // the first replica's reconcile is still running when its lease store goes away
    first_store.cut.store(true, Ordering::SeqCst);

    timeout(Duration::from_secs(3), async {
        while writers.started.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*second_state.borrow(), LeaderState::Leading);
    assert_eq!(*first_state.borrow(), LeaderState::Acquiring);
    assert_eq!(writers.max_active.load(Ordering::SeqCst), 1, "two replicas wrote at once");
    assert!(store.record(LEASE).unwrap().is_held_by("replica-b"));

    first_shutdown.cancel();
    second_shutdown.cancel();
    timeout(Duration::from_secs(5), first_task).await.unwrap().unwrap().unwrap();
    timeout(Duration::from_secs(5), second_task).await.unwrap().unwrap().unwrap();
    timeout(Duration::from_secs(1), async {
        while writers.active.load(Ordering::SeqCst) > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
