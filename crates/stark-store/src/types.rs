//! The typed records the orchestrator persists.
//!
//! Every record carries a `version` counter bumped on each successful write;
//! `update_*` store operations compare it and reject stale writers. All
//! timestamps are `DateTime<Utc>`; the wire carries epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use stark_core::state::{Namespace, PolicyAction, SchedulingConstraints, Visibility};
use stark_core::{
    DeploymentId, NodeId, NodeStatus, PackId, PodId, PodStatus, Resources, RuntimeTag, RuntimeType,
    ServiceId, Taint,
};

/// A registered node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node identity, assigned at first registration.
    pub id: NodeId,
    /// Operator-chosen name.
    pub name: String,
    /// Runtime class of the host.
    pub runtime_type: RuntimeType,
    /// Capability names this node can grant to packs.
    pub capabilities: Vec<String>,
    /// Total allocatable resources.
    pub allocatable: Resources,
    /// Resources in use, per the latest heartbeat.
    pub used: Resources,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
    /// Node annotations.
    pub annotations: BTreeMap<String, String>,
    /// Node taints.
    pub taints: Vec<Taint>,
    /// Health state.
    pub status: NodeStatus,
    /// Address other agents dial for peer channels.
    pub peer_addr: Option<String>,
    /// Timestamp of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Optimistic-concurrency counter.
    pub version: u64,
}

impl Node {
    /// Resources still free for new placements.
    #[must_use]
    pub fn free(&self) -> Resources {
        self.allocatable.saturating_sub(&self.used)
    }
}

/// A published pack bundle. Immutable after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    /// Pack identity.
    pub id: PackId,
    /// Pack name; multiple versions share a name.
    pub name: String,
    /// Version string, unique per name.
    pub version: String,
    /// Runtime requirement.
    pub runtime_tag: RuntimeTag,
    /// Namespace the pack belongs to.
    pub namespace: Namespace,
    /// The executable bundle.
    pub bundle: Vec<u8>,
    /// Whether pods of this pack get the ephemeral-plane client.
    pub enable_ephemeral: bool,
    /// Free-form metadata handed to the isolate.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Capabilities the publisher granted to this pack.
    pub granted_capabilities: Vec<String>,
    /// Publication timestamp.
    pub published_at: DateTime<Utc>,
}

/// Aggregate health of a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    /// Converging or converged on the desired count.
    #[default]
    Active,
    /// Repeated pod failures; scheduler is backing off.
    Degraded,
}

/// Resource requests and limits for a workload's pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Guaranteed amounts the scheduler reserves.
    #[serde(default)]
    pub requests: Resources,
    /// Hard caps enforced on the isolate.
    #[serde(default)]
    pub limits: Resources,
}

/// A desired replica set with an addressable overlay identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Service identity; doubles as the overlay hostname label.
    pub id: ServiceId,
    /// Namespace.
    pub namespace: Namespace,
    /// Pack this service runs.
    pub pack_id: PackId,
    /// Pack version pods are created from.
    pub pack_version: String,
    /// Whether rollouts should chase the newest published version.
    pub follow_latest: bool,
    /// Desired replica count; `0` designates a DaemonSet.
    pub replicas: u32,
    /// Aggregate health.
    pub status: WorkloadStatus,
    /// Labels applied to the service's pods.
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    pub scheduling: SchedulingConstraints,
    /// Pod resource requests and limits.
    pub resources: ResourceSpec,
    /// Scheduling priority of this service's pods.
    pub priority: i32,
    /// Overlay visibility.
    pub visibility: Visibility,
    /// Whether external ingress may reach this service.
    pub exposed: bool,
    /// Services allowed to call this one when visibility is private/system.
    pub allowed_sources: Vec<ServiceId>,
    /// Ingress port, when exposed.
    pub ingress_port: Option<u16>,
    /// Observed replicas in `Running`.
    pub ready_replicas: u32,
    /// Observed replicas in any active state.
    pub available_replicas: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter.
    pub version: u64,
}

impl Service {
    /// Whether the service runs in DaemonSet mode (one pod per eligible
    /// node).
    #[must_use]
    pub const fn is_daemon_set(&self) -> bool {
        self.replicas == 0
    }
}

/// A desired replica set without overlay addressability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment identity.
    pub id: DeploymentId,
    /// Operator-chosen name.
    pub name: String,
    /// Namespace.
    pub namespace: Namespace,
    /// Pack this deployment runs.
    pub pack_id: PackId,
    /// Pack version pods are created from.
    pub pack_version: String,
    /// Whether rollouts should chase the newest published version.
    pub follow_latest: bool,
    /// Desired replica count; `0` designates a DaemonSet.
    pub replicas: u32,
    /// Aggregate health.
    pub status: WorkloadStatus,
    /// Labels applied to the deployment's pods.
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    pub scheduling: SchedulingConstraints,
    /// Pod resource requests and limits.
    pub resources: ResourceSpec,
    /// Scheduling priority of this deployment's pods.
    pub priority: i32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter.
    pub version: u64,
}

impl Deployment {
    /// Whether the deployment runs in DaemonSet mode.
    #[must_use]
    pub const fn is_daemon_set(&self) -> bool {
        self.replicas == 0
    }
}

/// The replica set a pod belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PodOwner {
    /// Owned by a service; addressable via the overlay.
    Service(ServiceId),
    /// Owned by a deployment.
    Deployment(DeploymentId),
}

impl PodOwner {
    /// The owning service, when there is one.
    #[must_use]
    pub const fn service_id(&self) -> Option<&ServiceId> {
        match self {
            Self::Service(id) => Some(id),
            Self::Deployment(_) => None,
        }
    }
}

impl std::fmt::Display for PodOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(id) => write!(f, "service/{id}"),
            Self::Deployment(id) => write!(f, "deployment/{id}"),
        }
    }
}

/// A single running instance of a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    /// Pod identity.
    pub id: PodId,
    /// Owning replica set.
    pub owner: PodOwner,
    /// Node assignment; `None` exactly while `Pending`.
    pub node_id: Option<NodeId>,
    /// Pack this pod runs.
    pub pack_id: PackId,
    /// Pack version this pod was created from.
    pub pack_version: String,
    /// Namespace.
    pub namespace: Namespace,
    /// Lifecycle status.
    pub status: PodStatus,
    /// Detail for the current status (scheduling failures, crash info).
    pub status_message: Option<String>,
    /// Guaranteed resources.
    pub resource_requests: Resources,
    /// Resource caps.
    pub resource_limits: Resources,
    /// Pod labels (inherited from the owner).
    pub labels: BTreeMap<String, String>,
    /// Pod annotations.
    pub annotations: BTreeMap<String, String>,
    /// Scheduling priority, for preemption.
    pub priority: i32,
    /// Consecutive failure count, reset on a successful run.
    pub consecutive_failures: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter.
    pub version: u64,
}

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// Pod record created.
    Create,
    /// Pod placed on (or moved to) a node.
    Assign,
    /// Lifecycle status changed.
    Transition,
    /// Pack version changed during a rollout.
    VersionChange,
    /// Pod evicted by preemption or drain.
    Evict,
}

/// One append-only entry in a pod's history.
///
/// Exactly one entry exists per pod status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodHistoryEntry {
    /// The pod this entry belongs to.
    pub pod_id: PodId,
    /// What happened.
    pub action: HistoryAction,
    /// Status before the change, if any.
    pub previous_status: Option<PodStatus>,
    /// Status after the change.
    pub new_status: PodStatus,
    /// Node before the change.
    pub previous_node_id: Option<NodeId>,
    /// Node after the change.
    pub new_node_id: Option<NodeId>,
    /// Pack version before the change.
    pub previous_version: Option<String>,
    /// Pack version after the change.
    pub new_version: Option<String>,
    /// Short machine-oriented reason (`NodeLost`, `ScaleDown`...).
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// Who initiated the change, when attributable.
    pub actor: Option<String>,
    /// Extra context.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

/// An explicit allow/deny rule between two services.
///
/// The pair key `(source, target, namespace)` is unique; upsert replaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Rule identity, unique only.
    pub id: String,
    /// Calling service.
    pub source_service: ServiceId,
    /// Called service.
    pub target_service: ServiceId,
    /// Verdict for this pair.
    pub action: PolicyAction,
    /// Namespace the rule applies in.
    pub namespace: Namespace,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// The expose-model view of a service's network posture.
///
/// This is a projection of the service record, not separately stored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNetworkMeta {
    /// The service.
    pub service_id: ServiceId,
    /// Namespace.
    pub namespace: Namespace,
    /// Overlay visibility.
    pub visibility: Visibility,
    /// Whether ingress may reach the service.
    pub exposed: bool,
    /// Allowlisted callers for private/system visibility.
    pub allowed_sources: Vec<ServiceId>,
}

impl From<&Service> for ServiceNetworkMeta {
    fn from(service: &Service) -> Self {
        Self {
            service_id: service.id.clone(),
            namespace: service.namespace,
            visibility: service.visibility,
            exposed: service.exposed,
            allowed_sources: service.allowed_sources.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn daemon_set_is_replicas_zero() {
        let mut svc = test_service("web");
        assert!(!svc.is_daemon_set());
        svc.replicas = 0;
        assert!(svc.is_daemon_set());
    }

    #[test]
    fn node_free_resources() {
        let mut node = test_node("n1");
        node.allocatable = Resources::cpu_mem(1000, 1000);
        node.used = Resources::cpu_mem(400, 250);
        assert_eq!(node.free(), Resources::cpu_mem(600, 750));
    }

    #[test]
    fn pod_owner_service_projection() {
        let svc_owner = PodOwner::Service("web".parse().unwrap());
        assert!(svc_owner.service_id().is_some());

        let dep_owner = PodOwner::Deployment(DeploymentId::generate_deterministic(1));
        assert!(dep_owner.service_id().is_none());
    }

    #[test]
    fn network_meta_projects_service() {
        let mut svc = test_service("web");
        svc.visibility = Visibility::Private;
        svc.exposed = true;
        svc.allowed_sources = vec!["api".parse().unwrap()];

        let meta = ServiceNetworkMeta::from(&svc);
        assert_eq!(meta.service_id, svc.id);
        assert!(meta.exposed);
        assert_eq!(meta.visibility, Visibility::Private);
        assert_eq!(meta.allowed_sources.len(), 1);
    }

    pub(crate) fn test_node(name: &str) -> Node {
        Node {
            id: NodeId::generate_deterministic(u64::from(name.len() as u32)),
            name: name.to_string(),
            runtime_type: RuntimeType::Server,
            capabilities: Vec::new(),
            allocatable: Resources::cpu_mem(4000, 8 << 30),
            used: Resources::ZERO,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            taints: Vec::new(),
            status: NodeStatus::Ready,
            peer_addr: None,
            last_heartbeat: Utc::now(),
            version: 1,
        }
    }

    pub(crate) fn test_service(id: &str) -> Service {
        let now = Utc::now();
        Service {
            id: id.parse().unwrap(),
            namespace: Namespace::User,
            pack_id: PackId::generate_deterministic(1),
            pack_version: "1.0.0".to_string(),
            follow_latest: false,
            replicas: 2,
            status: WorkloadStatus::Active,
            labels: BTreeMap::new(),
            scheduling: SchedulingConstraints::default(),
            resources: ResourceSpec::default(),
            priority: 0,
            visibility: Visibility::Public,
            exposed: false,
            allowed_sources: Vec::new(),
            ingress_port: None,
            ready_replicas: 0,
            available_replicas: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}
