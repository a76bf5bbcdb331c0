//! Lease-based leader election.
//!
//! Only the leader runs controllers. The elector loops through
//! `Idle -> Acquiring -> Leading -> Releasing` and back to `Acquiring`, or to
//! `Idle` once shutdown is requested.
//!
//! # Atomicity
//!
//! Every write goes through the [`LeaseStore`] compare-and-swap. Two replicas
//! racing for an expired lease both read the same version; only one update
//! succeeds, the other sees [`LeaseError::Conflict`] and keeps waiting. Local
//! clocks only pace attempts and decide when a renewal has taken too long.
//!
//! # Timing
//!
//! A leader that fails to renew for `renew_deadline` steps down. Other
//! replicas may only take over once `lease_duration` has passed since the last
//! successful renewal. After stepping down the old leader waits for its
//! controllers only until that point (less one retry period) and then aborts
//! them, so they are stopped before anyone else starts theirs. On shutdown
//! the lease keeps being renewed until the controllers have stopped.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::IntGauge;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::lease::{LeaseError, LeaseRecord, LeaseStore};

/// Default lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default renew deadline
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Default retry period
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Leader election settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Name of the lease object
    pub lease_name: String,
    /// Identity written into the lease while holding it
    pub identity: String,
    /// How long a lease is valid after its last renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// Pause between acquire and renew attempts
    pub retry_period: Duration,
    /// Give the lease up on shutdown so a standby can take over at once
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    /// Settings with default timing and a generated identity
    #[must_use]
    pub fn new(lease_name: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            identity: default_identity(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }

    /// Check timing and naming constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] when the lease name or identity
    /// is empty, when the lease duration is not a whole number of seconds, or
    /// unless `retry_period < renew_deadline < lease_duration`.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.lease_name.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "leader election lease name must not be empty".to_string(),
            ));
        }
        if self.identity.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "leader election identity must not be empty".to_string(),
            ));
        }
        // The lease stores its duration in whole seconds.
        if self.lease_duration.as_secs() == 0 || self.lease_duration.subsec_nanos() != 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "lease duration must be a whole number of seconds, got {:?}",
                self.lease_duration
            )));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(RuntimeError::InvalidConfig(format!(
                "renew deadline ({:?}) must be less than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period.is_zero() || self.retry_period >= self.renew_deadline {
            return Err(RuntimeError::InvalidConfig(format!(
                "retry period ({:?}) must be non-zero and less than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// `<hostname>_<uuid>`, unique per process
#[must_use]
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

/// Where the elector is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not running
    Idle,
    /// Waiting for the lease
    Acquiring,
    /// Holding the lease
    Leading,
    /// Stopping leader work
    Releasing,
}

/// Callbacks driven by leadership changes
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// Leadership was acquired. Work started here must stop when `leadership`
    /// is cancelled.
    async fn on_started_leading(&self, leadership: CancellationToken);

    /// Leadership ended. Called after `leadership` was cancelled; returns once
    /// leader work has stopped.
    ///
    /// The future is dropped if leader work outlives the lease, so dropping it
    /// must abort that work.
    async fn on_stopped_leading(&self);
}

/// How a leadership term ended, with the start of the last successful renewal
#[derive(Debug, Clone, Copy)]
enum Term {
    Shutdown(Instant),
    Lost(Instant),
}

/// Runs the acquire/renew loop against a [`LeaseStore`]
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: LeaderElectionConfig,
    state: Arc<watch::Sender<LeaderState>>,
    observed_leader: Mutex<Option<String>>,
    status: OnceLock<IntGauge>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create an elector. Call [`LeaderElectionConfig::validate`] first.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaderElectionConfig) -> Self {
        let (state, _) = watch::channel(LeaderState::Idle);
        Self {
            store,
            config,
            state: Arc::new(state),
            observed_leader: Mutex::new(None),
            status: OnceLock::new(),
        }
    }

    /// Publish state on an existing channel instead of a private one
    #[must_use]
    pub fn with_state(mut self, state: Arc<watch::Sender<LeaderState>>) -> Self {
        self.state = state;
        self
    }

    /// Report leadership on `gauge` (1 while leading)
    pub(crate) fn instrument(&self, gauge: IntGauge) {
        let _ = self.status.set(gauge);
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Whether this replica currently leads
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leading
    }

    fn set_state(&self, state: LeaderState) {
        self.state.send_replace(state);
        if let Some(gauge) = self.status.get() {
            gauge.set(i64::from(state == LeaderState::Leading));
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Each leadership term gets a fresh child token of `shutdown`, handed to
    /// [`LeadershipHandler::on_started_leading`] and cancelled when the term ends.
    pub async fn run(&self, handler: Arc<dyn LeadershipHandler>, shutdown: CancellationToken) {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Starting leader election"
        );

        loop {
            self.set_state(LeaderState::Acquiring);
            let Some(acquired_at) = self.acquire(&shutdown).await else {
                break;
            };

            self.set_state(LeaderState::Leading);
            info!(identity = %self.config.identity, "Leadership acquired");
            let term = shutdown.child_token();
            handler.on_started_leading(term.clone()).await;

            let held = self.hold(&shutdown, acquired_at).await;
            self.set_state(LeaderState::Releasing);
            term.cancel();

            match held {
                Term::Shutdown(last_renewal) => {
                    self.drain_on_shutdown(handler.as_ref(), last_renewal).await;
                    break;
                }
                Term::Lost(last_renewal) => {
                    warn!(identity = %self.config.identity, "Leadership lost");
                    self.drain_on_loss(handler.as_ref(), last_renewal).await;
                }
            }
        }

        self.set_state(LeaderState::Idle);
        info!(identity = %self.config.identity, "Leader election stopped");
    }

    /// Keep renewing while leader work stops, then release the lease.
    ///
    /// If the lease is lost meanwhile, leader work is abandoned at once.
    async fn drain_on_shutdown(&self, handler: &dyn LeadershipHandler, last_renewal: Instant) {
        let renewing = CancellationToken::new();
        tokio::select! {
            () = handler.on_stopped_leading() => {
                if self.config.release_on_cancel {
                    self.release().await;
                }
            }
            _ = self.hold(&renewing, last_renewal) => {
                warn!(
                    identity = %self.config.identity,
                    "Lease lost while stopping controllers, aborting them"
                );
            }
        }
    }

    /// Wait for leader work to stop, but no longer than the lease is still ours.
    ///
    /// Dropping the `on_stopped_leading` future on timeout aborts leader work
    /// before another replica can take the lease over.
    async fn drain_on_loss(&self, handler: &dyn LeadershipHandler, last_renewal: Instant) {
        let window = self.drain_window(last_renewal);
        if tokio::time::timeout(window, handler.on_stopped_leading())
            .await
            .is_err()
        {
            warn!(
                identity = %self.config.identity,
                window_ms = window.as_millis(),
                "Controllers did not stop before the lease could expire, aborted"
            );
        }
    }

    /// Time left before the lease stamped at `last_renewal` may be taken over,
    /// less one retry period of slack
    fn drain_window(&self, last_renewal: Instant) -> Duration {
        self.config
            .lease_duration
            .saturating_sub(last_renewal.elapsed())
            .saturating_sub(self.config.retry_period)
    }

    /// Retry until the lease is ours.
    ///
    /// Returns the instant taken just before the winning attempt, which is no
    /// later than the `renewTime` it wrote. `None` if shutdown came first.
    async fn acquire(&self, shutdown: &CancellationToken) -> Option<Instant> {
        loop {
            let started = Instant::now();
            let attempt = tokio::select! {
                biased;
                () = shutdown.cancelled() => return None,
                attempt = self.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Ok(true) => return Some(started),
                Ok(false) => {
                    debug!(
                        identity = %self.config.identity,
                        retry_ms = self.config.retry_period.as_millis(),
                        "Lease held by another, waiting"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        retry_ms = self.config.retry_period.as_millis(),
                        "Failed to acquire lease, retrying"
                    );
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every retry period until `shutdown` is cancelled or no renewal
    /// succeeded within the renew deadline of `last_renewal`.
    async fn hold(&self, shutdown: &CancellationToken, mut last_renewal: Instant) -> Term {
        loop {
            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            if remaining.is_zero() {
                return Term::Lost(last_renewal);
            }
            tokio::select! {
                () = shutdown.cancelled() => return Term::Shutdown(last_renewal),
                () = tokio::time::sleep(self.config.retry_period.min(remaining)) => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            let started = Instant::now();
            let attempt = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Term::Shutdown(last_renewal),
                attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()) => attempt,
            };

            match attempt {
                Ok(Ok(true)) => {
                    debug!(identity = %self.config.identity, "Lease renewed");
                    last_renewal = started;
                }
                Ok(Ok(false)) => {
                    debug!(identity = %self.config.identity, "Lease renewal rejected");
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.config.identity, error = %e, "Failed to renew lease");
                }
                Err(_) => {
                    warn!(identity = %self.config.identity, "Lease renewal timed out");
                }
            }
        }
    }

    fn fresh_record(&self, now: DateTime<Utc>, transitions: i32) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: self.config.lease_duration_seconds(),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: transitions,
        }
    }

    fn observe(&self, holder: Option<&str>) {
        let Some(holder) = holder else {
            return;
        };
        let mut observed = self
            .observed_leader
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if observed.as_deref() != Some(holder) {
            info!(
                identity = %self.config.identity,
                leader = %holder,
                "New leader observed"
            );
            *observed = Some(holder.to_string());
        }
    }

    /// Create, renew or take over the lease.
    ///
    /// `Ok(false)` when someone else validly holds it or won the race.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let name = &self.config.lease_name;
        let now = Utc::now();

        let Some(current) = self.store.get(name).await? else {
            return match self.store.create(name, self.fresh_record(now, 0)).await {
                Ok(_) => {
                    info!(identity = %self.config.identity, "Created new lease");
                    self.observe(Some(&self.config.identity));
                    Ok(true)
                }
                Err(LeaseError::Conflict) => {
                    debug!(identity = %self.config.identity, "Lease creation conflict, will retry");
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        };

        let record = current.record;
        self.observe(record.holder());

        let takeover = !record.is_held_by(&self.config.identity);
        let next = if !takeover {
            LeaseRecord {
                renew_time: Some(now),
                lease_duration_seconds: self.config.lease_duration_seconds(),
                ..record
            }
        } else if record.is_held_at(now) {
            return Ok(false);
        } else {
            self.fresh_record(now, record.lease_transitions.saturating_add(1))
        };

        match self.store.update(name, next, &current.version).await {
            Ok(updated) => {
                if takeover {
                    info!(
                        identity = %self.config.identity,
                        transitions = updated.record.lease_transitions,
                        "Took over expired lease"
                    );
                    self.observe(Some(&self.config.identity));
                }
                Ok(true)
            }
            Err(LeaseError::Conflict) => {
                debug!(identity = %self.config.identity, "Lease update conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the holder and backdate the renewal so the lease is immediately acquirable
    async fn release(&self) {
        let name = &self.config.lease_name;
        let current = match self.store.get(name).await {
            Ok(Some(current)) if current.record.is_held_by(&self.config.identity) => current,
            Ok(_) => {
                debug!(
                    identity = %self.config.identity,
                    "Not the lease holder, nothing to release"
                );
                return;
            }
            Err(e) => {
                warn!(
                    identity = %self.config.identity,
                    error = %e,
                    "Failed to read lease for release"
                );
                return;
            }
        };

        let expired_for =
            chrono::Duration::seconds(i64::from(current.record.lease_duration_seconds) + 1);
        let past = Utc::now() - expired_for;
        let released = LeaseRecord {
            holder_identity: None,
            renew_time: Some(past),
            lease_duration_seconds: 1,
            ..current.record
        };

        match self.store.update(name, released, &current.version).await {
            Ok(_) => info!(identity = %self.config.identity, "Lease released for fast failover"),
            Err(e) => {
                warn!(identity = %self.config.identity, error = %e, "Failed to release lease");
            }
        }
    }
}

#[cfg(test)]
#[path = "leader_election_test.rs"]
mod leader_election_test;
