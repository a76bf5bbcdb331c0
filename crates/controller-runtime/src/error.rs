//! Runtime error types.
//!
//! Setup failures (scheme, controller and health-check registration, server
//! binding) are fatal and surface from [`Manager::start`](crate::Manager::start).
//! Per-item reconcile failures never appear here: they are contained by the
//! work queue's backoff.

use std::net::SocketAddr;

use thiserror::Error;

use crate::lease::LeaseError;

/// Errors that can occur while assembling or running the controller manager.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A type identifier was registered twice in the scheme
    #[error("type already registered in scheme: {0}")]
    DuplicateType(String),

    /// A type identifier is not present in the scheme
    #[error("type not registered in scheme: {0}")]
    UnknownType(String),

    /// Encoding or decoding an object through the scheme failed
    #[error("codec error for {kind}: {message}")]
    Codec {
        /// `apiVersion/kind` of the object, or `<unknown>` if it carried no type meta
        kind: String,
        /// Underlying failure
        message: String,
    },

    /// A controller with the same name is already registered
    #[error("controller already registered: {0}")]
    DuplicateController(String),

    /// A health or readiness check with the same name already exists
    #[error("{family} check already registered: {name}")]
    DuplicateHealthCheck {
        /// `healthz` or `readyz`
        family: &'static str,
        /// Name of the check
        name: String,
    },

    /// Registration attempted after the manager started
    #[error("cannot {0} after the manager has started")]
    AlreadyStarted(&'static str),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to bind a listener
    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        /// Which server failed (`health probe`, `metrics`)
        name: &'static str,
        /// Requested address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Metric registration failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Lease storage failure during setup
    #[error("leader election error: {0}")]
    Lease(#[from] LeaseError),
}

impl RuntimeError {
    /// Build a codec error for the given kind.
    pub(crate) fn codec(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Codec {
            kind: kind.into(),
            message: message.to_string(),
        }
    }
}
