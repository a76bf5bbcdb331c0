//! Controller-specific error types.

use controller_runtime::RuntimeError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that end the controller process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Manager setup or run failure
    #[error("Manager error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Signal handlers could not be installed
    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}
