//! Types for the scheduler crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use stark_core::state::{Namespace, SchedulingConstraints};
use stark_core::{NodeId, PackId, PodId, Resources, RuntimeTag};
use stark_store::{Deployment, PodOwner, Service};

/// Configuration for the reconcile loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reconcile tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum pods of a workload simultaneously unavailable during a
    /// rolling update.
    pub max_unavailable: u32,
    /// Consecutive failures before a workload is marked degraded and
    /// replacement creation backs off.
    pub failure_threshold: u32,
    /// Base of the exponential failure backoff, milliseconds.
    pub backoff_base_ms: u64,
    /// Cap on the failure backoff, milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            max_unavailable: 1,
            failure_threshold: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 5 * 60 * 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables
    /// (`STARK_SCHED_TICK_MS`, `STARK_SCHED_MAX_UNAVAILABLE`,
    /// `STARK_SCHED_FAILURE_THRESHOLD`).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("STARK_SCHED_TICK_MS") {
            if let Ok(n) = val.parse() {
                config.tick_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("STARK_SCHED_MAX_UNAVAILABLE") {
            if let Ok(n) = val.parse() {
                config.max_unavailable = n;
            }
        }
        if let Ok(val) = std::env::var("STARK_SCHED_FAILURE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.failure_threshold = n;
            }
        }
        config
    }

    /// Backoff delay for the given failure count.
    #[must_use]
    pub fn backoff_for(&self, consecutive_failures: u32) -> chrono::Duration {
        let over = consecutive_failures.saturating_sub(self.failure_threshold);
        let exp = over.min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1_u64 << exp)
            .min(self.backoff_max_ms);
        chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }
}

/// Why the reconcile loop is waking up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic tick.
    Tick,
    /// A service or deployment was created, scaled, or rolled out.
    WorkloadChanged,
    /// A pod reached a terminal state.
    PodTerminal,
    /// A node's status changed.
    NodeChanged,
}

/// What one reconcile cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Pods created to close replica deficits.
    pub created: u32,
    /// Pending pods placed onto nodes.
    pub assigned: u32,
    /// Excess or outdated pods sent a graceful stop.
    pub stopped: u32,
    /// Victim pods evicted for preemption.
    pub evicted: u32,
    /// Pending pods that found no node this cycle.
    pub unplaced: u32,
}

impl CycleSummary {
    /// Whether the cycle changed anything.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created == 0
            && self.assigned == 0
            && self.stopped == 0
            && self.evicted == 0
            && self.unplaced == 0
    }
}

/// A service or deployment flattened into the fields the scheduler needs.
#[derive(Debug, Clone)]
pub struct WorkloadView {
    /// Who owns the pods.
    pub owner: PodOwner,
    /// Namespace.
    pub namespace: Namespace,
    /// Pack the workload runs.
    pub pack_id: PackId,
    /// Desired pack version.
    pub pack_version: String,
    /// Desired replicas; `0` means DaemonSet.
    pub replicas: u32,
    /// Runtime requirement of the pack.
    pub runtime_tag: RuntimeTag,
    /// Capabilities the pack needs granted by its node.
    pub required_capabilities: Vec<String>,
    /// Placement constraints.
    pub scheduling: SchedulingConstraints,
    /// Per-pod resource requests.
    pub requests: Resources,
    /// Per-pod resource limits.
    pub limits: Resources,
    /// Labels stamped onto pods.
    pub labels: BTreeMap<String, String>,
    /// Scheduling priority.
    pub priority: i32,
}

impl WorkloadView {
    /// Build a view of a service, given its pack's runtime facts.
    #[must_use]
    pub fn of_service(
        service: &Service,
        runtime_tag: RuntimeTag,
        required_capabilities: Vec<String>,
    ) -> Self {
        Self {
            owner: PodOwner::Service(service.id.clone()),
            namespace: service.namespace,
            pack_id: service.pack_id,
            pack_version: service.pack_version.clone(),
            replicas: service.replicas,
            runtime_tag,
            required_capabilities,
            scheduling: service.scheduling.clone(),
            requests: service.resources.requests,
            limits: service.resources.limits,
            labels: service.labels.clone(),
            priority: service.priority,
        }
    }

    /// Build a view of a deployment, given its pack's runtime facts.
    #[must_use]
    pub fn of_deployment(
        deployment: &Deployment,
        runtime_tag: RuntimeTag,
        required_capabilities: Vec<String>,
    ) -> Self {
        Self {
            owner: PodOwner::Deployment(deployment.id),
            namespace: deployment.namespace,
            pack_id: deployment.pack_id,
            pack_version: deployment.pack_version.clone(),
            replicas: deployment.replicas,
            runtime_tag,
            required_capabilities,
            scheduling: deployment.scheduling.clone(),
            requests: deployment.resources.requests,
            limits: deployment.resources.limits,
            labels: deployment.labels.clone(),
            priority: deployment.priority,
        }
    }

    /// Whether this workload runs in DaemonSet mode.
    #[must_use]
    pub const fn is_daemon_set(&self) -> bool {
        self.replicas == 0
    }
}

/// A request to create one pod, handed to the placement sink.
#[derive(Debug, Clone)]
pub struct NewPodSpec {
    /// Owning workload.
    pub owner: PodOwner,
    /// Namespace.
    pub namespace: Namespace,
    /// Pack to run.
    pub pack_id: PackId,
    /// Pack version to run.
    pub pack_version: String,
    /// Resource requests.
    pub requests: Resources,
    /// Resource limits.
    pub limits: Resources,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Scheduling priority.
    pub priority: i32,
    /// Failure count inherited from a failed predecessor.
    pub consecutive_failures: u32,
    /// Node the predecessor failed on; placement avoids it when possible.
    pub avoid_node: Option<NodeId>,
    /// Why the pod is being created.
    pub reason: String,
}

/// A planned preemption: evict the victims, then the pending pod fits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptionPlan {
    /// Node freed by the eviction.
    pub node_id: NodeId,
    /// Pods to evict, lowest priority first.
    pub victims: Vec<PodId>,
    /// Sum of victim priorities, the secondary minimization key.
    pub total_victim_priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = SchedulerConfig::default();

        // Below the threshold there is no extra exponent.
        let at_threshold = config.backoff_for(3);
        assert_eq!(at_threshold, chrono::Duration::milliseconds(5_000));

        let next = config.backoff_for(4);
        assert_eq!(next, chrono::Duration::milliseconds(10_000));

        // Far past the threshold the cap kicks in.
        let capped = config.backoff_for(40);
        assert_eq!(capped, chrono::Duration::milliseconds(5 * 60 * 1_000));
    }

    #[test]
    fn cycle_summary_noop() {
        assert!(CycleSummary::default().is_noop());
        let busy = CycleSummary {
            created: 1,
            ..CycleSummary::default()
        };
        assert!(!busy.is_noop());
    }
}
