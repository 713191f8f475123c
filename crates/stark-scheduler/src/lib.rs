//! Replica reconciliation and pod placement for stark.
//!
//! The scheduler is a closed-loop controller. Each cycle it snapshots the
//! store, computes replica deficits and surpluses per service and
//! deployment, steps rolling updates, and runs the placement pipeline
//! (filter → score → select, with preemption as the fallback) over every
//! pending pod. Decisions are not applied directly: they go through the
//! [`PlacementSink`], which the pod lifecycle controller implements, keeping
//! a single writer for pod state.
//!
//! # Architecture
//!
//! ```text
//! ticker / nudges ──▶ reconcile cycle
//!                      │  snapshot (nodes, pods, workloads)
//!                      │  replica deltas, DaemonSets, rollouts
//!                      ▼
//!                placement pipeline
//!                 filter ─▶ score ─▶ select ─▶ (preempt)
//!                      │
//!                      ▼
//!                PlacementSink (lifecycle controller)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod filter;
pub mod preempt;
pub mod reconcile;
pub mod score;
pub mod snapshot;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Result, SchedulerError};
pub use reconcile::{PlacementSink, Scheduler, SchedulerHandle, AVOID_NODE_ANNOTATION};
pub use snapshot::Snapshot;
pub use types::{CycleSummary, NewPodSpec, SchedulerConfig, Trigger, WorkloadView};
