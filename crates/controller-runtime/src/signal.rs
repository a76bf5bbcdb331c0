//! Termination signal handling for the process boundary.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install SIGTERM/SIGINT handlers and return a token cancelled by the first
/// signal. A second signal exits the process with code 1.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
#[cfg(unix)]
pub fn shutdown_on_signal() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        warn!("Received second signal, exiting immediately");
        std::process::exit(1);
    });

    Ok(token)
}

/// Install a Ctrl+C handler and return a token cancelled by the first
/// interrupt. A second interrupt exits the process with code 1.
///
/// # Errors
///
/// Never fails on this platform; the signature matches the Unix variant.
#[cfg(not(unix))]
pub fn shutdown_on_signal() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C, shutting down");
        trigger.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second signal, exiting immediately");
            std::process::exit(1);
        }
    });

    Ok(token)
}
