//! Error types for the fleet core.

use thiserror::Error;

/// Errors surfaced by cluster, bridge and log operations.
#[derive(Debug, Error)]
pub enum FleetError {
    /// An operation ran before the cluster client connected.
    #[error("Kubernetes client not initialized")]
    NotInitialized,

    /// The pod backing a worker could not be located.
    #[error("Pod not found for worker {worker} (pod {pod})")]
    PodNotFound { worker: String, pod: String },

    /// Any other failure from the cluster control plane.
    #[error("Kubernetes API error: {0}")]
    Transport(#[from] kube::Error),

    /// The bridge API could not be reached or returned garbage.
    #[error("Bridge request failed: {0}")]
    Bridge(#[from] reqwest::Error),

    /// The bridge API answered with a non-success status.
    #[error("Bridge returned HTTP {status}: {body}")]
    BridgeStatus { status: u16, body: String },

    /// A create request is missing a required field.
    #[error("Invalid request: '{field}' is required")]
    InvalidRequest { field: &'static str },

    /// Convoy counters add up to more than the total.
    #[error("Convoy {id} has inconsistent counts (pending = {pending})")]
    InconsistentConvoy { id: String, pending: i64 },

    /// Credentials could not be loaded.
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Configuration file or value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    #[must_use]
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }

    /// True for `PodNotFound` and for API 404 responses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::PodNotFound { .. } => true,
            Self::Transport(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}
