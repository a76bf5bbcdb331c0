//! Command-line flags.

use std::time::Duration;

use clap::Parser;
use controller_runtime::{parse_bind_address, LeaderElectionConfig, ManagerConfig};

use crate::error::ControllerError;

/// Lease name shared by every replica of this controller
pub const DEFAULT_LEADER_ELECTION_ID: &str = "eebeeb01.service.binding";

/// Service Binding controller manager
#[derive(Debug, Parser)]
#[command(name = "service-binding-controller", version, about)]
pub struct Cli {
    /// Address the metrics endpoint binds to ("0" disables it)
    #[arg(long, env = "METRICS_ADDR", default_value = ":8080")]
    pub metrics_addr: String,

    /// Address the health probe endpoint binds to ("0" disables it)
    #[arg(long, env = "HEALTH_ADDR", default_value = ":8081")]
    pub health_addr: String,

    /// Enable leader election, ensuring only one active controller manager
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,

    /// Name of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub leader_election_namespace: String,

    /// How long a lease is valid without renewal
    #[arg(
        long,
        env = "LEASE_DURATION",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub lease_duration: Duration,

    /// How long the leader keeps retrying renewal before giving up
    #[arg(
        long,
        env = "RENEW_DEADLINE",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub renew_deadline: Duration,

    /// Interval between acquire and renew attempts
    #[arg(
        long,
        env = "RETRY_PERIOD",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub retry_period: Duration,

    /// How long shutdown waits for in-flight reconciles
    #[arg(
        long,
        env = "GRACEFUL_SHUTDOWN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub graceful_shutdown_timeout: Duration,

    /// Reconcile worker count
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    pub max_concurrent_reconciles: usize,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl Cli {
    /// Build the manager configuration from the parsed flags.
    pub fn manager_config(&self) -> Result<ManagerConfig, ControllerError> {
        let leader_election = self.enable_leader_election.then(|| LeaderElectionConfig {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            ..LeaderElectionConfig::new(&self.leader_election_id)
        });

        let config = ManagerConfig {
            health_probe_addr: parse_bind_address(&self.health_addr)?,
            metrics_addr: parse_bind_address(&self.metrics_addr)?,
            leader_election,
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
        };
        config.validate()?;
        Ok(config)
    }
}
