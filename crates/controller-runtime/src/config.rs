//! Manager configuration and bind address parsing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::RuntimeError;
use crate::leader_election::LeaderElectionConfig;

/// Default drain period for in-flight reconciles
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for a [`Manager`](crate::Manager)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Health probe bind address; `None` disables the server
    pub health_probe_addr: Option<SocketAddr>,
    /// Metrics bind address; `None` disables the server
    pub metrics_addr: Option<SocketAddr>,
    /// Leader election settings; `None` runs controllers without election
    pub leader_election: Option<LeaderElectionConfig>,
    /// How long shutdown waits for in-flight reconciles
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_probe_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8081)),
            metrics_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)),
            leader_election: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for invalid leader election
    /// timing or when both servers share one address.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if let Some(election) = &self.leader_election {
            election.validate()?;
        }
        if let (Some(health), Some(metrics)) = (self.health_probe_addr, self.metrics_addr) {
            if health == metrics && health.port() != 0 {
                return Err(RuntimeError::InvalidConfig(format!(
                    "health probe and metrics servers cannot share {health}"
                )));
            }
        }
        Ok(())
    }
}

/// Parse a bind address flag.
///
/// Accepts `:port` (all interfaces), `host:port` and `[v6]:port`. `0` disables
/// the server and yields `None`.
///
/// # Errors
///
/// Returns [`RuntimeError::InvalidConfig`] for anything else.
pub fn parse_bind_address(value: &str) -> Result<Option<SocketAddr>, RuntimeError> {
    let value = value.trim();
    if value == "0" {
        return Ok(None);
    }
    let invalid = || RuntimeError::InvalidConfig(format!("invalid bind address: {value:?}"));

    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| invalid())?;
        return Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    match value.rsplit_once(':') {
        Some(("localhost", port)) => {
            let port: u16 = port.parse().map_err(|_| invalid())?;
            Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)))
        }
        _ => Err(invalid()),
    }
}
