//! Orchestrator control plane for stark.
//!
//! This crate wires the components that make up the single logical
//! orchestrator process:
//!
//! - **Session Hub**: live agent sessions, correlated request/response
//! - **Node Registry**: registration, heartbeats, cordon/drain/lost
//! - **Service Registry**: authoritative endpoint index and target
//!   selection (sticky, round-robin, random)
//! - **Pod Lifecycle Controller**: the pod state machine, history writes,
//!   and agent commands; also the scheduler's placement sink
//! - **Signaling Hub**: authenticated, policy-checked relay of peer-channel
//!   negotiation frames
//! - **Network Policy Engine**: two-step ingress/internal evaluation plus
//!   the explicit-rule form
//! - **PodGroup Store**: TTL-scoped membership sets with a reaper
//! - **Liveness Monitor**: heartbeat-silence demotions and pod failover
//!
//! [`Orchestrator`] owns all of them; the gateway binary provides the
//! transport and spawns the background loops.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod podgroup;
pub mod policy;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;
pub mod signaling;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{ControlError, Result};
pub use lifecycle::{is_valid_transition, LifecycleController};
pub use monitor::LivenessMonitor;
pub use podgroup::PodGroupStore;
pub use policy::PolicyEngine;
pub use registry::{Endpoint, EndpointEvent, NodeRegistry, SelectStrategy, ServiceRegistry};
pub use service::Orchestrator;
pub use session::SessionHub;
pub use signaling::{SignalKind, SignalingHub};
pub use types::{
    ControlConfig, CreateDeploymentRequest, CreateServiceRequest, PublishPackRequest,
    RolloutRequest,
};
