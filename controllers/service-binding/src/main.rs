//! Service Binding Controller
//!
//! Hosts the ServiceBinding controller inside the controller-manager runtime:
//! leader election across replicas, health and metrics endpoints, and a
//! graceful drain on SIGTERM/SIGINT.

mod cli;
mod controller;
mod error;
mod reconciler;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use controller_runtime::{ping, register_core_types, shutdown_on_signal, KubeLeaseStore, Manager};
use crds::{ServiceBinding, ServiceBindingProjection};
use kube::Client;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::Cli;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    match run(cli).await {
        Ok(()) => {
            info!("Service Binding Controller stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Service Binding Controller failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ControllerError> {
    info!("Starting Service Binding Controller");

    let config = cli.manager_config()?;
    info!("Configuration:");
    info!("  Metrics address: {}", cli.metrics_addr);
    info!("  Health address: {}", cli.health_addr);
    info!("  Leader election: {}", cli.enable_leader_election);
    info!(
        "  Namespace: {}",
        cli.watch_namespace.as_deref().unwrap_or("all namespaces")
    );

    let client = Client::try_default().await?;

    let mut manager = Manager::new(config)?;
    if cli.enable_leader_election {
        let store = KubeLeaseStore::new(client.clone(), &cli.leader_election_namespace);
        manager = manager.with_lease_store(Arc::new(store));
    }

    register_core_types(manager.scheme_mut()?)?;
    manager.register_type::<ServiceBinding>()?;
    manager.register_type::<ServiceBindingProjection>()?;

    manager.add_health_check("ping", ping)?;
    manager.add_readiness_check("ping", ping)?;
    let leader = manager.leader_election_checker();
    manager.add_readiness_check("leader", leader)?;

    let controller = controller::build(
        client,
        cli.watch_namespace.as_deref(),
        cli.max_concurrent_reconciles,
    )?;
    manager.register_controller(controller)?;

    let shutdown = shutdown_on_signal()?;
    manager.start(shutdown).await?;
    Ok(())
}
