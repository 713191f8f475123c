//! Core types and utilities for stark.
//!
//! This crate provides the foundational pieces shared by the orchestrator,
//! the node agent, and the CLI:
//!
//! - **Identifiers**: strongly-typed IDs for nodes, pods, services, packs,
//!   pod groups, and request envelopes
//! - **Error taxonomy**: the common error kinds surfaced across component
//!   boundaries
//! - **Resources**: allocatable/requested resource quantities and their
//!   arithmetic
//! - **Wire protocol**: the framed messages exchanged between agents and the
//!   orchestrator, and the request envelopes exchanged between peer agents
//! - **Overlay addressing**: parsing of `<serviceId>.internal` virtual URLs
//!
//! # Example
//!
//! ```
//! use stark_core::{PodId, ServiceId};
//! use stark_core::overlay::VirtualTarget;
//!
//! let service_id: ServiceId = "billing".parse().unwrap();
//! let pod_id = PodId::generate();
//!
//! let target = VirtualTarget::parse_url("http://Billing.internal:8080/invoices").unwrap();
//! assert_eq!(target.service_id, service_id);
//! assert_eq!(target.port, Some(8080));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod envelope;
pub mod error;
pub mod ids;
pub mod overlay;
pub mod proto;
pub mod resources;
pub mod state;

pub use error::{CoreError, Result};
pub use ids::{
    CorrelationId, DeploymentId, EnvelopeId, GroupId, IdError, NodeId, PackId, PodId, QueryId,
    ServiceId,
};
pub use resources::Resources;
pub use state::{
    NodeStatus, PodStatus, RuntimeTag, RuntimeType, Taint, TaintEffect, Toleration, Visibility,
};
