//! The filter stage of the placement pipeline.
//!
//! Filtering eliminates nodes that cannot run the pod at all; the surviving
//! set goes to scoring. Each rejection carries a reason so unschedulable
//! pods get a useful `status_message`.

use std::collections::HashMap;
use std::fmt;

use stark_core::state::TaintEffect;
use stark_core::{NodeId, Resources};
use stark_store::Node;

use crate::types::WorkloadView;

/// Why a node was rejected for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReject {
    /// Node is not in a schedulable status.
    NotSchedulable,
    /// Pack runtime tag does not match the node runtime type.
    RuntimeMismatch,
    /// Node does not offer a capability the pack needs.
    MissingCapability(String),
    /// An untolerated `NoSchedule` taint.
    Tainted(String),
    /// Node selector labels not satisfied.
    SelectorMismatch,
    /// A required affinity term not satisfied.
    AffinityMismatch,
    /// Not enough free allocatable resources.
    InsufficientResources,
}

impl fmt::Display for FilterReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSchedulable => write!(f, "node not schedulable"),
            Self::RuntimeMismatch => write!(f, "runtime mismatch"),
            Self::MissingCapability(cap) => write!(f, "missing capability {cap}"),
            Self::Tainted(key) => write!(f, "untolerated taint {key}"),
            Self::SelectorMismatch => write!(f, "node selector mismatch"),
            Self::AffinityMismatch => write!(f, "required affinity mismatch"),
            Self::InsufficientResources => write!(f, "insufficient resources"),
        }
    }
}

/// One pod slot, added to every request so the node's pod capacity is
/// honored alongside cpu and memory.
#[must_use]
pub fn with_pod_slot(requests: &Resources) -> Resources {
    requests.saturating_add(&Resources {
        pods: 1,
        ..Resources::ZERO
    })
}

/// Check a single node against a pod's requirements.
///
/// `committed` is the sum of requests of active pods already placed on the
/// node this snapshot, which is what "free allocatable" is measured against.
///
/// # Errors
///
/// Returns the first failing check.
pub fn check_node(
    workload: &WorkloadView,
    requests: &Resources,
    node: &Node,
    committed: &Resources,
) -> Result<(), FilterReject> {
    if !node.status.is_schedulable() {
        return Err(FilterReject::NotSchedulable);
    }

    if !workload.runtime_tag.matches(node.runtime_type) {
        return Err(FilterReject::RuntimeMismatch);
    }

    for cap in &workload.required_capabilities {
        if !node.capabilities.iter().any(|c| c == cap) {
            return Err(FilterReject::MissingCapability(cap.clone()));
        }
    }

    for taint in &node.taints {
        if taint.effect == TaintEffect::NoSchedule
            && !workload
                .scheduling
                .tolerations
                .iter()
                .any(|t| t.tolerates(taint))
        {
            return Err(FilterReject::Tainted(taint.key.clone()));
        }
    }

    if !workload
        .scheduling
        .node_selector
        .iter()
        .all(|(k, v)| node.labels.get(k) == Some(v))
    {
        return Err(FilterReject::SelectorMismatch);
    }

    for term in &workload.scheduling.affinity {
        if term.required && !term.selector.matches(&node.labels) {
            return Err(FilterReject::AffinityMismatch);
        }
    }

    let free = node.allocatable.saturating_sub(committed);
    if !with_pod_slot(requests).fits_within(&free) {
        return Err(FilterReject::InsufficientResources);
    }

    Ok(())
}

/// Run the filter stage over all nodes.
///
/// Returns the surviving nodes and, when none survive, a compact tally of
/// rejection reasons for diagnostics.
pub fn eligible_nodes<'a>(
    workload: &WorkloadView,
    requests: &Resources,
    nodes: &'a [Node],
    committed: &HashMap<NodeId, Resources>,
) -> (Vec<&'a Node>, Vec<(NodeId, FilterReject)>) {
    let mut eligible = Vec::new();
    let mut rejections = Vec::new();
    for node in nodes {
        let used = committed.get(&node.id).copied().unwrap_or(Resources::ZERO);
        match check_node(workload, requests, node, &used) {
            Ok(()) => eligible.push(node),
            Err(reject) => rejections.push((node.id, reject)),
        }
    }
    (eligible, rejections)
}

/// Summarize rejection reasons into a status message.
#[must_use]
pub fn summarize_rejections(rejections: &[(NodeId, FilterReject)]) -> String {
    if rejections.is_empty() {
        return "no nodes registered".to_string();
    }
    let mut counts: HashMap<String, u32> = HashMap::new();
    for (_, reject) in rejections {
        *counts.entry(reject.to_string()).or_default() += 1;
    }
    let mut parts: Vec<String> = counts
        .into_iter()
        .map(|(reason, n)| format!("{n} node(s): {reason}"))
        .collect();
    parts.sort();
    format!("0/{} nodes eligible ({})", rejections.len(), parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, test_workload};
    use stark_core::state::{AffinityTerm, Taint, Toleration};
    use stark_core::{RuntimeTag, RuntimeType};
    use std::collections::BTreeMap;

    #[test]
    fn ready_node_accepts_fitting_pod() {
        let workload = test_workload("web", 2);
        let node = test_node(1);
        let requests = Resources::cpu_mem(500, 512 << 20);

        assert!(check_node(&workload, &requests, &node, &Resources::ZERO).is_ok());
    }

    #[test]
    fn cordoned_node_rejected() {
        let workload = test_workload("web", 2);
        let mut node = test_node(1);
        node.status = stark_core::NodeStatus::Cordoned;

        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert_eq!(result, Err(FilterReject::NotSchedulable));
    }

    #[test]
    fn runtime_tag_filters_browser_pack() {
        let mut workload = test_workload("web", 2);
        workload.runtime_tag = RuntimeTag::Browser;
        let node = test_node(1); // server node

        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert_eq!(result, Err(FilterReject::RuntimeMismatch));

        workload.runtime_tag = RuntimeTag::Universal;
        assert!(check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO).is_ok());
    }

    #[test]
    fn browser_node_runs_browser_pack() {
        let mut workload = test_workload("ui", 1);
        workload.runtime_tag = RuntimeTag::Browser;
        let mut node = test_node(1);
        node.runtime_type = RuntimeType::Browser;

        assert!(check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO).is_ok());
    }

    #[test]
    fn missing_capability_rejected() {
        let mut workload = test_workload("ml", 1);
        workload.required_capabilities = vec!["gpu".into()];
        let node = test_node(1);

        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert!(matches!(result, Err(FilterReject::MissingCapability(_))));
    }

    #[test]
    fn untolerated_taint_rejected_tolerated_accepted() {
        let mut workload = test_workload("web", 2);
        let mut node = test_node(1);
        node.taints.push(Taint {
            key: "dedicated".into(),
            value: "infra".into(),
            effect: TaintEffect::NoSchedule,
        });

        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert!(matches!(result, Err(FilterReject::Tainted(_))));

        workload.scheduling.tolerations.push(Toleration {
            key: "dedicated".into(),
            value: None,
        });
        assert!(check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO).is_ok());
    }

    #[test]
    fn prefer_no_schedule_taint_does_not_filter() {
        let workload = test_workload("web", 2);
        let mut node = test_node(1);
        node.taints.push(Taint {
            key: "flaky".into(),
            value: String::new(),
            effect: TaintEffect::PreferNoSchedule,
        });

        assert!(check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO).is_ok());
    }

    #[test]
    fn node_selector_and_required_affinity() {
        let mut workload = test_workload("web", 2);
        workload
            .scheduling
            .node_selector
            .insert("zone".into(), "eu-1".into());
        let mut node = test_node(1);

        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert_eq!(result, Err(FilterReject::SelectorMismatch));

        node.labels.insert("zone".into(), "eu-1".into());
        assert!(check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO).is_ok());

        let mut wanted = BTreeMap::new();
        wanted.insert("ssd".to_string(), "true".to_string());
        workload.scheduling.affinity.push(AffinityTerm::required(wanted));
        let result = check_node(&workload, &Resources::ZERO, &node, &Resources::ZERO);
        assert_eq!(result, Err(FilterReject::AffinityMismatch));
    }

    #[test]
    fn committed_resources_shrink_free() {
        let workload = test_workload("web", 2);
        let node = test_node(1); // 4000m cpu
        let requests = Resources::cpu_mem(3000, 0);

        assert!(check_node(&workload, &requests, &node, &Resources::ZERO).is_ok());

        let committed = Resources::cpu_mem(2000, 0);
        let result = check_node(&workload, &requests, &node, &committed);
        assert_eq!(result, Err(FilterReject::InsufficientResources));
    }

    #[test]
    fn pod_slot_axis_enforced() {
        let workload = test_workload("web", 2);
        let mut node = test_node(1);
        node.allocatable.pods = 1;

        let committed = with_pod_slot(&Resources::ZERO);
        let result = check_node(&workload, &Resources::ZERO, &node, &committed);
        assert_eq!(result, Err(FilterReject::InsufficientResources));
    }

    #[test]
    fn rejection_summary_counts() {
        let workload = test_workload("web", 2);
        let mut cordoned = test_node(1);
        cordoned.status = stark_core::NodeStatus::Cordoned;
        let mut tiny = test_node(2);
        tiny.allocatable = Resources::ZERO;
        let nodes = vec![cordoned, tiny];

        let (eligible, rejections) = eligible_nodes(
            &workload,
            &Resources::cpu_mem(100, 100),
            &nodes,
            &HashMap::new(),
        );
        assert!(eligible.is_empty());
        assert_eq!(rejections.len(), 2);
        let summary = summarize_rejections(&rejections);
        assert!(summary.starts_with("0/2 nodes eligible"));
    }
}
