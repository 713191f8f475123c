//! Shared domain vocabulary: lifecycle states, runtime kinds, and
//! scheduling primitives.
//!
//! These enums appear in stored records, in wire frames, and in scheduler
//! decisions, so they live in the core crate rather than any one subsystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    /// Accepted but not yet placed on a node.
    Pending,
    /// Placed on a node; deploy command in flight.
    Scheduled,
    /// Agent is materializing the bundle and starting the isolate.
    Starting,
    /// Isolate is running user code.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Shut down cleanly.
    Stopped,
    /// Crashed, failed to start, or lost its node.
    Failed,
    /// Removed by preemption or node drain.
    Evicted,
}

impl PodStatus {
    /// Whether this status requires a node assignment.
    ///
    /// A pod in any of these states has a non-null `node_id`; a `Pending`
    /// pod never does.
    #[must_use]
    pub const fn requires_node(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Starting | Self::Running | Self::Stopping
        )
    }

    /// Whether this status counts toward the desired replica count.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Scheduled | Self::Starting | Self::Running
        )
    }

    /// Whether this is a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Evicted)
    }
}

/// Health status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Heartbeating and accepting pods.
    Ready,
    /// Missed heartbeats; existing pods stay, no new placements.
    NotReady,
    /// Administratively closed to new placements.
    Cordoned,
    /// Being emptied; pods are evicted and rescheduled.
    Draining,
    /// Presumed dead; pods are marked failed and rescheduled.
    Lost,
}

impl NodeStatus {
    /// Whether the scheduler may place new pods on a node in this status.
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// The runtime class of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// Server-class host; pods run as subprocesses.
    Server,
    /// Browser-resident host; pods run as workers.
    Browser,
}

/// The runtime requirement declared by a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTag {
    /// Runs only on server nodes.
    Server,
    /// Runs only on browser nodes.
    Browser,
    /// Runs anywhere.
    #[default]
    Universal,
}

impl RuntimeTag {
    /// Whether a pack with this tag can run on a node of the given type.
    #[must_use]
    pub const fn matches(self, node: RuntimeType) -> bool {
        match self {
            Self::Universal => true,
            Self::Server => matches!(node, RuntimeType::Server),
            Self::Browser => matches!(node, RuntimeType::Browser),
        }
    }
}

/// Namespace a pack or workload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Ordinary user workloads.
    #[default]
    User,
    /// Infrastructure workloads.
    System,
}

/// Overlay visibility of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Reachable from any service.
    Public,
    /// Reachable only from services on the allowlist.
    #[default]
    Private,
    /// Infra services; same allowlist rule as private.
    System,
}

/// Verdict of an explicit network policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Permit the flow.
    Allow,
    /// Reject the flow.
    Deny,
}

/// Effect of a node taint on pods that do not tolerate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    /// Untolerating pods are never placed here.
    NoSchedule,
    /// Placement is deprioritized but not forbidden.
    PreferNoSchedule,
}

/// A taint on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value; empty matches tolerations with any value.
    #[serde(default)]
    pub value: String,
    /// What happens to pods that do not tolerate this taint.
    pub effect: TaintEffect,
}

/// A pod's declared tolerance of a taint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Key this toleration matches.
    pub key: String,
    /// Value this toleration matches; `None` matches any value.
    #[serde(default)]
    pub value: Option<String>,
}

impl Toleration {
    /// Whether this toleration covers the given taint.
    #[must_use]
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.key != taint.key {
            return false;
        }
        match &self.value {
            None => true,
            Some(v) => *v == taint.value,
        }
    }
}

/// A label-match term used by node selectors and affinity rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels that must all be present with equal values.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// An empty selector, which matches everything.
    #[must_use]
    pub fn any() -> Self {
        Self {
            match_labels: BTreeMap::new(),
        }
    }

    /// Whether the given label set satisfies this selector.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Whether this selector constrains anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

/// A weighted affinity term.
///
/// Required terms act as filters; preferred terms contribute their weight to
/// the placement score when matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityTerm {
    /// The label selector this term matches against.
    pub selector: LabelSelector,
    /// Score contribution when matched (ignored for required terms).
    #[serde(default = "AffinityTerm::default_weight")]
    pub weight: i32,
    /// Whether the term is required during scheduling.
    #[serde(default)]
    pub required: bool,
}

impl AffinityTerm {
    const fn default_weight() -> i32 {
        1
    }

    /// A required term from plain labels.
    #[must_use]
    pub fn required(match_labels: BTreeMap<String, String>) -> Self {
        Self {
            selector: LabelSelector { match_labels },
            weight: 0,
            required: true,
        }
    }

    /// A preferred (weighted) term from plain labels.
    #[must_use]
    pub fn preferred(match_labels: BTreeMap<String, String>, weight: i32) -> Self {
        Self {
            selector: LabelSelector { match_labels },
            weight,
            required: false,
        }
    }
}

/// Scheduling constraints attached to a service or deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConstraints {
    /// Node labels that must all match.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Node affinity terms (required and preferred).
    #[serde(default)]
    pub affinity: Vec<AffinityTerm>,
    /// Inter-pod affinity terms, matched against co-located pod labels.
    #[serde(default)]
    pub pod_affinity: Vec<AffinityTerm>,
    /// Inter-pod anti-affinity terms; matches subtract their weight.
    #[serde(default)]
    pub pod_anti_affinity: Vec<AffinityTerm>,
    /// Taints this workload tolerates.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}
