//! Error types for the control plane.

use stark_core::{CoreError, NodeId, PodId, PodStatus, ServiceId};
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in control-plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The requested node was not found.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The requested pod was not found.
    #[error("pod not found: {0}")]
    PodNotFound(PodId),

    /// The requested service was not found.
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    /// The requested state transition violates the pod state machine.
    #[error("invalid transition for pod {pod_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// The pod being transitioned.
        pod_id: PodId,
        /// Its current status.
        from: PodStatus,
        /// The rejected target status.
        to: PodStatus,
    },

    /// No session is connected for the node.
    #[error("no session for node {0}")]
    NoSession(NodeId),

    /// A service has no selectable endpoint.
    #[error("no selectable endpoint for service {0}")]
    NoEndpoint(ServiceId),

    /// A network policy denied the flow.
    #[error("policy denied: {source_service} -> {target_service}")]
    PolicyDenied {
        /// Calling service.
        source_service: ServiceId,
        /// Called service.
        target_service: ServiceId,
    },

    /// A pod group is at its configured member cap.
    #[error("group {0} is full")]
    GroupFull(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] stark_store::StoreError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] stark_auth::AuthError),

    /// A core-taxonomy error passed through.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<ControlError> for CoreError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NodeNotFound(id) => Self::NotFound(format!("node {id}")),
            ControlError::PodNotFound(id) => Self::NotFound(format!("pod {id}")),
            ControlError::ServiceNotFound(id) => Self::NotFound(format!("service {id}")),
            ControlError::NoEndpoint(id) => {
                Self::NotFound(format!("no selectable endpoint for service {id}"))
            }
            ControlError::InvalidTransition { pod_id, from, to } => {
                Self::Conflict(format!("pod {pod_id}: illegal transition {from:?} -> {to:?}"))
            }
            ControlError::NoSession(_) => Self::TransportClosed,
            ControlError::PolicyDenied {
                source_service,
                target_service,
            } => Self::PolicyDenied {
                source_service,
                target_service,
            },
            ControlError::GroupFull(group) => Self::ResourceExhausted(format!("group {group}")),
            ControlError::Store(e) => e.into(),
            ControlError::Auth(e) => e.into(),
            ControlError::Core(e) => e,
        }
    }
}
