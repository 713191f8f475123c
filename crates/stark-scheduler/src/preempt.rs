//! Preemption planning.
//!
//! When no node fits a pending pod, eligible lower-priority pods may be
//! evicted to make room. The planner picks the node that minimizes the
//! victim count first and the total victim priority second; ties break on
//! the stable node hash.

use std::collections::HashMap;

use stark_core::{NodeId, Resources};
use stark_store::{Node, Pod};

use crate::filter::{check_node, with_pod_slot, FilterReject};
use crate::score::tie_hash;
use crate::types::{PreemptionPlan, WorkloadView};

/// Plan a preemption for a pending pod, or `None` when no eviction set
/// would make it fit anywhere.
///
/// Only pods with priority strictly below `pending_priority` are eligible
/// victims. Victims are taken lowest priority first, and only as many as
/// needed to free the requested resources.
#[must_use]
pub fn plan_preemption(
    workload: &WorkloadView,
    requests: &Resources,
    pending_priority: i32,
    nodes: &[Node],
    pods_by_node: &HashMap<NodeId, Vec<&Pod>>,
    committed: &HashMap<NodeId, Resources>,
) -> Option<PreemptionPlan> {
    let needed = with_pod_slot(requests);

    let mut best: Option<(PreemptionPlan, u64)> = None;

    for node in nodes {
        let used = committed.get(&node.id).copied().unwrap_or(Resources::ZERO);

        // The node must fail only on resources; static constraints cannot
        // be fixed by evicting anyone.
        match check_node(workload, requests, node, &used) {
            Err(FilterReject::InsufficientResources) => {}
            Ok(()) | Err(_) => continue,
        }

        let mut victims: Vec<&Pod> = pods_by_node
            .get(&node.id)
            .map(|pods| {
                pods.iter()
                    .filter(|p| p.status.is_active() && p.priority < pending_priority)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        victims.sort_by_key(|p| (p.priority, p.created_at));

        let mut freed = Resources::ZERO;
        let mut chosen = Vec::new();
        let mut total_priority: i64 = 0;
        for victim in victims {
            let free_after = node
                .allocatable
                .saturating_sub(&used)
                .saturating_add(&freed);
            if needed.fits_within(&free_after) {
                break;
            }
            freed = freed.saturating_add(&with_pod_slot(&victim.resource_requests));
            chosen.push(victim.id);
            total_priority += i64::from(victim.priority);
        }

        let free_after = node
            .allocatable
            .saturating_sub(&used)
            .saturating_add(&freed);
        if chosen.is_empty() || !needed.fits_within(&free_after) {
            continue;
        }

        let plan = PreemptionPlan {
            node_id: node.id,
            victims: chosen,
            total_victim_priority: total_priority,
        };
        let hash = tie_hash(&node.id);
        let better = match &best {
            None => true,
            Some((current, current_hash)) => {
                let key = (plan.victims.len(), plan.total_victim_priority, hash);
                let current_key = (
                    current.victims.len(),
                    current.total_victim_priority,
                    *current_hash,
                );
                key < current_key
            }
        };
        if better {
            best = Some((plan, hash));
        }
    }

    best.map(|(plan, _)| plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, test_pod_with, test_workload};
    use stark_core::PodStatus;

    #[test]
    fn evicts_fewest_lowest_priority_victims() {
        let workload = test_workload("web", 1);
        let mut node = test_node(1);
        node.allocatable = Resources::cpu_mem(1000, 1 << 30);

        // Two low-priority pods fill the node.
        let small = test_pod_with(10, "filler", Resources::cpu_mem(400, 256 << 20), 0);
        let big = test_pod_with(11, "filler", Resources::cpu_mem(600, 512 << 20), 1);
        let mut pods_by_node: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        pods_by_node.insert(node.id, vec![&small, &big]);

        let mut committed = HashMap::new();
        committed.insert(node.id, Resources::cpu_mem(1000, 768 << 20));

        // Needs 500m; evicting only the 400m pod is not enough once its own
        // slot is counted against cpu, so the planner should reach for the
        // priority-0 pod first and stop as soon as the request fits.
        let nodes = vec![node];
        let plan = plan_preemption(
            &workload,
            &Resources::cpu_mem(500, 128 << 20),
            5,
            &nodes,
            &pods_by_node,
            &committed,
        )
        .expect("a plan");

        assert_eq!(plan.node_id, nodes[0].id);
        assert_eq!(plan.victims.len(), 2);
        // Lowest priority evicted first.
        assert_eq!(plan.victims[0], small.id);
    }

    #[test]
    fn equal_priority_pods_are_not_victims() {
        let workload = test_workload("web", 1);
        let mut node = test_node(1);
        node.allocatable = Resources::cpu_mem(1000, 1 << 30);

        let peer = test_pod_with(10, "peer", Resources::cpu_mem(1000, 1 << 30), 5);
        let mut pods_by_node: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        pods_by_node.insert(node.id, vec![&peer]);
        let mut committed = HashMap::new();
        committed.insert(node.id, Resources::cpu_mem(1000, 1 << 30));

        let nodes = vec![node];
        let plan = plan_preemption(
            &workload,
            &Resources::cpu_mem(500, 0),
            5,
            &nodes,
            &pods_by_node,
            &committed,
        );
        assert!(plan.is_none());
    }

    #[test]
    fn statically_ineligible_node_is_never_preempted() {
        let mut workload = test_workload("web", 1);
        workload
            .scheduling
            .node_selector
            .insert("zone".into(), "eu-1".into());

        let mut node = test_node(1);
        node.allocatable = Resources::cpu_mem(100, 100);
        let victim = test_pod_with(10, "filler", Resources::cpu_mem(100, 100), 0);
        let mut pods_by_node: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        pods_by_node.insert(node.id, vec![&victim]);
        let mut committed = HashMap::new();
        committed.insert(node.id, Resources::cpu_mem(100, 100));

        // Selector mismatch dominates the resource shortfall.
        let nodes = vec![node];
        let plan = plan_preemption(
            &workload,
            &Resources::cpu_mem(50, 50),
            5,
            &nodes,
            &pods_by_node,
            &committed,
        );
        assert!(plan.is_none());
    }

    #[test]
    fn prefers_node_with_fewer_victims() {
        let workload = test_workload("web", 1);
        let mut node_many = test_node(1);
        node_many.allocatable = Resources::cpu_mem(1000, 1 << 30);
        let mut node_one = test_node(2);
        node_one.allocatable = Resources::cpu_mem(1000, 1 << 30);

        let v1 = test_pod_with(10, "filler", Resources::cpu_mem(500, 0), 0);
        let v2 = test_pod_with(11, "filler", Resources::cpu_mem(500, 0), 0);
        let v3 = test_pod_with(12, "filler", Resources::cpu_mem(1000, 0), 0);

        let mut pods_by_node: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        pods_by_node.insert(node_many.id, vec![&v1, &v2]);
        pods_by_node.insert(node_one.id, vec![&v3]);

        let mut committed = HashMap::new();
        committed.insert(node_many.id, Resources::cpu_mem(1000, 0));
        committed.insert(node_one.id, Resources::cpu_mem(1000, 0));

        let nodes = vec![node_many, node_one];
        let plan = plan_preemption(
            &workload,
            &Resources::cpu_mem(900, 0),
            5,
            &nodes,
            &pods_by_node,
            &committed,
        )
        .expect("a plan");

        assert_eq!(plan.node_id, nodes[1].id);
        assert_eq!(plan.victims, vec![v3.id]);
    }
}
