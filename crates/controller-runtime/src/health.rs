//! Liveness and readiness endpoints.
//!
//! Two families of named predicates, served as `/healthz` and `/readyz`. A
//! family succeeds only if every predicate in it succeeds. Readiness also
//! fails as soon as the shutdown token is cancelled, so the orchestrator stops
//! routing to a draining replica before it exits.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::RuntimeError;
use crate::leader_election::LeaderState;

/// A named health predicate; `Err` carries the reason
pub type Checker = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Predicate that always passes
pub fn ping() -> Result<(), String> {
    Ok(())
}

/// Readiness predicate that passes while `state` reports leadership
pub fn leader_checker(
    state: watch::Receiver<LeaderState>,
) -> impl Fn() -> Result<(), String> + Send + Sync {
    move || match *state.borrow() {
        LeaderState::Leading => Ok(()),
        other => Err(format!("not the leader ({other:?})")),
    }
}

/// Which endpoint a predicate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckFamily {
    /// `/healthz`
    Liveness,
    /// `/readyz`
    Readiness,
}

impl CheckFamily {
    /// Endpoint name, also used in response bodies
    #[must_use]
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Liveness => "healthz",
            Self::Readiness => "readyz",
        }
    }
}

/// Outcome of running a family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Whether every predicate passed
    pub healthy: bool,
    /// Response body
    pub body: String,
}

/// Registered liveness and readiness predicates
#[derive(Clone, Default)]
pub struct HealthChecks {
    liveness: Vec<(String, Checker)>,
    readiness: Vec<(String, Checker)>,
    shutdown: Option<CancellationToken>,
}

impl std::fmt::Debug for HealthChecks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |checks: &[(String, Checker)]| {
            checks.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>()
        };
        f.debug_struct("HealthChecks")
            .field("liveness", &names(&self.liveness))
            .field("readiness", &names(&self.readiness))
            .finish_non_exhaustive()
    }
}

impl HealthChecks {
    /// No predicates registered
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&self, family: CheckFamily) -> &[(String, Checker)] {
        match family {
            CheckFamily::Liveness => &self.liveness,
            CheckFamily::Readiness => &self.readiness,
        }
    }

    /// Register a predicate.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateHealthCheck`] if the family already
    /// has a predicate with that name.
    pub fn add<F>(
        &mut self,
        family: CheckFamily,
        name: impl Into<String>,
        check: F,
    ) -> Result<(), RuntimeError>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.family(family).iter().any(|(existing, _)| *existing == name) {
            return Err(RuntimeError::DuplicateHealthCheck {
                family: family.endpoint(),
                name,
            });
        }
        let checks = match family {
            CheckFamily::Liveness => &mut self.liveness,
            CheckFamily::Readiness => &mut self.readiness,
        };
        checks.push((name, Arc::new(check)));
        Ok(())
    }

    /// Fail readiness once `token` is cancelled
    pub fn fail_readiness_on(&mut self, token: CancellationToken) {
        self.shutdown = Some(token);
    }

    /// Names registered in `family`, in registration order
    #[must_use]
    pub fn names(&self, family: CheckFamily) -> Vec<&str> {
        self.family(family).iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run every predicate in `family`
    #[must_use]
    pub fn run(&self, family: CheckFamily, verbose: bool) -> CheckReport {
        let mut healthy = true;
        let mut lines = String::new();

        if family == CheckFamily::Readiness {
            if let Some(token) = &self.shutdown {
                if token.is_cancelled() {
                    healthy = false;
                    lines.push_str("[-]shutdown failed: shutting down\n");
                }
            }
        }

        for (name, check) in self.family(family) {
            match check() {
                Ok(()) => {
                    let _ = writeln!(lines, "[+]{name} ok");
                }
                Err(reason) => {
                    healthy = false;
                    let _ = writeln!(lines, "[-]{name} failed: {reason}");
                }
            }
        }

        let body = if healthy && !verbose {
            "ok".to_string()
        } else if healthy {
            format!("{lines}{} check passed\n", family.endpoint())
        } else {
            format!("{lines}{} check failed\n", family.endpoint())
        };
        CheckReport { healthy, body }
    }

    /// Run one predicate; `None` if it does not exist
    #[must_use]
    pub fn run_one(&self, family: CheckFamily, name: &str) -> Option<CheckReport> {
        let (_, check) = self.family(family).iter().find(|(n, _)| n == name)?;
        Some(match check() {
            Ok(()) => CheckReport {
                healthy: true,
                body: "ok".to_string(),
            },
            Err(reason) => CheckReport {
                healthy: false,
                body: format!("internal server error: {reason}\n"),
            },
        })
    }

    /// Router serving `/healthz`, `/readyz` and the per-predicate paths under them
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/healthz/{name}", get(healthz_one))
            .route("/readyz", get(readyz))
            .route("/readyz/{name}", get(readyz_one))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

fn respond(report: CheckReport) -> Response {
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, report.body).into_response()
}

fn family_response(
    checks: &HealthChecks,
    family: CheckFamily,
    query: &HashMap<String, String>,
) -> Response {
    let report = checks.run(family, query.contains_key("verbose"));
    if !report.healthy {
        debug!(endpoint = family.endpoint(), body = %report.body, "Health check failed");
    }
    respond(report)
}

fn single_response(checks: &HealthChecks, family: CheckFamily, name: &str) -> Response {
    match checks.run_one(family, name) {
        Some(report) => respond(report),
        None => {
            let body = format!("no such {} check: {name}\n", family.endpoint());
            (StatusCode::NOT_FOUND, body).into_response()
        }
    }
}

async fn healthz(
    State(checks): State<Arc<HealthChecks>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    family_response(&checks, CheckFamily::Liveness, &query)
}

async fn readyz(
    State(checks): State<Arc<HealthChecks>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    family_response(&checks, CheckFamily::Readiness, &query)
}

async fn healthz_one(
    State(checks): State<Arc<HealthChecks>>,
    Path(name): Path<String>,
) -> Response {
    single_response(&checks, CheckFamily::Liveness, &name)
}

async fn readyz_one(State(checks): State<Arc<HealthChecks>>, Path(name): Path<String>) -> Response {
    single_response(&checks, CheckFamily::Readiness, &name)
}

/// Serve the health endpoints on `listener` until `shutdown` is cancelled.
pub async fn serve_health(
    listener: TcpListener,
    checks: Arc<HealthChecks>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Serving health probes");
    }
    axum::serve(listener, checks.router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(checks: &Arc<HealthChecks>, uri: &str) -> (StatusCode, String) {
        let response = Arc::clone(checks)
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn checks() -> HealthChecks {
        let mut checks = HealthChecks::new();
        checks.add(CheckFamily::Liveness, "ping", ping).unwrap();
        checks.add(CheckFamily::Readiness, "ping", ping).unwrap();
        checks
            .add(CheckFamily::Readiness, "leader", || Err("not the leader".to_string()))
            .unwrap();
        checks
    }

    #[tokio::test]
    async fn test_healthz_passes() {
        let checks = Arc::new(checks());
        assert_eq!(get_path(&checks, "/healthz").await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_readyz_failure_lists_every_check() {
        let checks = Arc::new(checks());
        let (status, body) = get_path(&checks, "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            "[+]ping ok\n[-]leader failed: not the leader\nreadyz check failed\n"
        );
    }

    #[tokio::test]
    async fn test_verbose_lists_passing_checks() {
        let checks = Arc::new(checks());
        let (status, body) = get_path(&checks, "/healthz?verbose").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[+]ping ok\nhealthz check passed\n");
    }

    #[tokio::test]
    async fn test_single_check_endpoint() {
        let checks = Arc::new(checks());
        assert_eq!(get_path(&checks, "/readyz/ping").await, (StatusCode::OK, "ok".to_string()));

        let (status, body) = get_path(&checks, "/readyz/leader").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("not the leader"));

        let (status, _) = get_path(&checks, "/healthz/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_fails_readiness_only() {
        let token = CancellationToken::new();
        let mut checks = HealthChecks::new();
        checks.add(CheckFamily::Liveness, "ping", ping).unwrap();
        checks.add(CheckFamily::Readiness, "ping", ping).unwrap();
        checks.fail_readiness_on(token.clone());
        let checks = Arc::new(checks);

        assert_eq!(get_path(&checks, "/readyz").await.0, StatusCode::OK);

        token.cancel();
        let (status, body) = get_path(&checks, "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("[-]shutdown failed"));
        assert_eq!(get_path(&checks, "/healthz").await.0, StatusCode::OK);
    }

    #[test]
    fn test_duplicate_name_rejected_per_family() {
        let mut checks = HealthChecks::new();
        checks.add(CheckFamily::Liveness, "ping", ping).unwrap();
        checks.add(CheckFamily::Readiness, "ping", ping).unwrap();

        let err = checks.add(CheckFamily::Liveness, "ping", ping).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::DuplicateHealthCheck { family: "healthz", .. }
        ));
        assert_eq!(checks.names(CheckFamily::Liveness), vec!["ping"]);
    }

    #[test]
    fn test_leader_checker_follows_state() {
        let (tx, rx) = watch::channel(LeaderState::Acquiring);
        let check = leader_checker(rx);
        assert!(check().is_err());

        tx.send_replace(LeaderState::Leading);
        assert!(check().is_ok());

        tx.send_replace(LeaderState::Releasing);
        assert!(check().is_err());
    }
}
