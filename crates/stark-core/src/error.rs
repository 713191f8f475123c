//! Common error taxonomy for stark.
//!
//! Every component boundary (store, control plane, agent, wire protocol)
//! surfaces failures as one of these kinds, so callers can apply uniform
//! retry and reporting rules.

use crate::ids::{PodId, ServiceId};
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The error kinds shared across the stark system.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A bearer token was missing, malformed, or failed verification.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A network policy decision denied the call.
    #[error("policy denied: {source_service} -> {target_service}")]
    PolicyDenied {
        /// The calling service.
        source_service: ServiceId,
        /// The called service.
        target_service: ServiceId,
    },

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write observed a concurrent update (stale version) or a uniqueness
    /// violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No node can satisfy the pod's resource and constraint requirements.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The underlying session or channel closed while an operation was
    /// pending.
    #[error("transport closed")]
    TransportClosed,

    /// An operation exceeded its deadline.
    #[error("timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed when the deadline fired.
        elapsed_ms: u64,
    },

    /// An operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// A payload failed schema validation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// A denial for traffic from `source` to `target`.
    #[must_use]
    pub fn policy_denied(source: ServiceId, target: ServiceId) -> Self {
        Self::PolicyDenied {
            source_service: source,
            target_service: target,
        }
    }

    /// A `NotFound` for a pod.
    #[must_use]
    pub fn pod_not_found(pod_id: &PodId) -> Self {
        Self::NotFound(format!("pod {pod_id}"))
    }

    /// The stable machine-readable code for this error kind.
    ///
    /// These codes appear in wire-protocol error frames and in policy-denial
    /// response bodies handed to pack code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::TransportClosed => "transport_closed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Invalid(_) => "invalid",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether local retry with backoff is an appropriate response.
    ///
    /// Transport loss, stale writes, and timeouts are recovered locally;
    /// denials and validation failures are surfaced to the caller.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed | Self::Conflict(_) | Self::Timeout { .. }
        )
    }

    /// Rebuild an error from a wire code and message.
    ///
    /// Unknown codes map to `Internal` so a newer peer never crashes an
    /// older one.
    #[must_use]
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "auth" => Self::Auth(message.to_string()),
            "not_found" => Self::NotFound(message.to_string()),
            "conflict" => Self::Conflict(message.to_string()),
            "resource_exhausted" => Self::ResourceExhausted(message.to_string()),
            "transport_closed" => Self::TransportClosed,
            "timeout" => Self::Timeout { elapsed_ms: 0 },
            "cancelled" => Self::Cancelled,
            "invalid" => Self::Invalid(message.to_string()),
            _ => Self::Internal(message.to_string()),
        }
    }
}
