//! The score and select stages of the placement pipeline.
//!
//! Every node surviving the filter gets a score; the highest wins. Ties are
//! broken by a deterministic hash of the node ID so repeated cycles with the
//! same inputs place pods identically.

use std::collections::HashMap;

use stark_core::state::TaintEffect;
use stark_core::{NodeId, Resources};
use stark_store::{Node, Pod};

use crate::types::WorkloadView;

/// Weight of the least-loaded term relative to one affinity weight unit.
const LOAD_WEIGHT: f64 = 10.0;

/// Penalty for an untolerated `PreferNoSchedule` taint.
const SOFT_TAINT_PENALTY: f64 = 5.0;

/// Penalty for the node a failed predecessor ran on.
const AVOID_NODE_PENALTY: f64 = 50.0;

/// Score one node for one pod.
///
/// Terms, per the placement pipeline:
/// - weighted preferred node-affinity matches,
/// - least-loaded `(1 - used/allocatable)`,
/// - inter-pod affinity (adds) and anti-affinity (subtracts) against the
///   pods already on the node,
/// - a soft penalty for untolerated `PreferNoSchedule` taints and for the
///   node a failed predecessor should avoid.
#[must_use]
pub fn score_node(
    workload: &WorkloadView,
    node: &Node,
    committed: &Resources,
    colocated: &[&Pod],
    avoid_node: Option<&NodeId>,
) -> f64 {
    let mut score = 0.0;

    for term in &workload.scheduling.affinity {
        if !term.required && term.selector.matches(&node.labels) {
            score += f64::from(term.weight);
        }
    }

    // Least-loaded: measure against the larger of committed requests and
    // the node's own heartbeat-reported usage.
    let committed_util = committed.utilization_of(&node.allocatable);
    let reported_util = node.used.utilization_of(&node.allocatable);
    score += LOAD_WEIGHT * (1.0 - committed_util.max(reported_util));

    for term in &workload.scheduling.pod_affinity {
        let matches = colocated
            .iter()
            .filter(|p| term.selector.matches(&p.labels))
            .count();
        #[allow(clippy::cast_precision_loss)]
        let matched = matches as f64;
        score += f64::from(term.weight) * matched;
    }

    for term in &workload.scheduling.pod_anti_affinity {
        let matches = colocated
            .iter()
            .filter(|p| term.selector.matches(&p.labels))
            .count();
        #[allow(clippy::cast_precision_loss)]
        let matched = matches as f64;
        score -= f64::from(term.weight) * matched;
    }

    for taint in &node.taints {
        if taint.effect == TaintEffect::PreferNoSchedule
            && !workload
                .scheduling
                .tolerations
                .iter()
                .any(|t| t.tolerates(taint))
        {
            score -= SOFT_TAINT_PENALTY;
        }
    }

    if avoid_node == Some(&node.id) {
        score -= AVOID_NODE_PENALTY;
    }

    score
}

/// Deterministic tie-break hash for a node.
#[must_use]
pub fn tie_hash(node_id: &NodeId) -> u64 {
    let digest = blake3::hash(node_id.as_ref());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Pick the best node: highest score, ties broken by the stable hash.
#[must_use]
pub fn select_node<'a>(
    workload: &WorkloadView,
    candidates: &[&'a Node],
    committed: &HashMap<NodeId, Resources>,
    pods_by_node: &HashMap<NodeId, Vec<&Pod>>,
    avoid_node: Option<&NodeId>,
) -> Option<&'a Node> {
    candidates
        .iter()
        .map(|node| {
            let used = committed.get(&node.id).copied().unwrap_or(Resources::ZERO);
            let colocated = pods_by_node
                .get(&node.id)
                .map_or(&[][..], Vec::as_slice);
            let score = score_node(workload, node, &used, colocated, avoid_node);
            (score, tie_hash(&node.id), *node)
        })
        .max_by(|(score_a, hash_a, _), (score_b, hash_b, _)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(hash_b.cmp(hash_a))
        })
        .map(|(_, _, node)| node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, test_pod, test_workload};
    use stark_core::state::AffinityTerm;
    use std::collections::BTreeMap;

    #[test]
    fn less_loaded_node_wins() {
        let workload = test_workload("web", 2);
        let idle = test_node(1);
        let busy = test_node(2);

        let mut committed = HashMap::new();
        committed.insert(busy.id, Resources::cpu_mem(3000, 6 << 30));

        let candidates = vec![&idle, &busy];
        let chosen = select_node(&workload, &candidates, &committed, &HashMap::new(), None)
            .expect("a node");
        assert_eq!(chosen.id, idle.id);
    }

    #[test]
    fn preferred_affinity_outweighs_small_load_difference() {
        let mut workload = test_workload("web", 2);
        let mut labels = BTreeMap::new();
        labels.insert("ssd".to_string(), "true".to_string());
        workload.scheduling.affinity.push(AffinityTerm::preferred(labels, 20));

        let mut ssd_node = test_node(1);
        ssd_node.labels.insert("ssd".into(), "true".into());
        let plain_node = test_node(2);

        // The ssd node is mildly busier, but the affinity weight dominates.
        let mut committed = HashMap::new();
        committed.insert(ssd_node.id, Resources::cpu_mem(400, 0));

        let candidates = vec![&plain_node, &ssd_node];
        let chosen = select_node(&workload, &candidates, &committed, &HashMap::new(), None)
            .expect("a node");
        assert_eq!(chosen.id, ssd_node.id);
    }

    #[test]
    fn anti_affinity_spreads_replicas() {
        let mut workload = test_workload("web", 2);
        let mut own_labels = BTreeMap::new();
        own_labels.insert("app".to_string(), "web".to_string());
        workload.labels = own_labels.clone();
        workload
            .scheduling
            .pod_anti_affinity
            .push(AffinityTerm::preferred(own_labels, 30));

        let node_a = test_node(1);
        let node_b = test_node(2);

        // One replica already lives on node A.
        let existing = test_pod(10, "web");
        let mut pods_by_node: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        pods_by_node.insert(node_a.id, vec![&existing]);

        let candidates = vec![&node_a, &node_b];
        let chosen = select_node(
            &workload,
            &candidates,
            &HashMap::new(),
            &pods_by_node,
            None,
        )
        .expect("a node");
        assert_eq!(chosen.id, node_b.id);
    }

    #[test]
    fn avoid_node_is_deprioritized_not_excluded() {
        let workload = test_workload("web", 2);
        let node_a = test_node(1);
        let node_b = test_node(2);

        let candidates = vec![&node_a, &node_b];
        let chosen = select_node(
            &workload,
            &candidates,
            &HashMap::new(),
            &HashMap::new(),
            Some(&node_a.id),
        )
        .expect("a node");
        assert_eq!(chosen.id, node_b.id);

        // With a single candidate, the avoided node is still used.
        let only = vec![&node_a];
        let chosen = select_node(
            &workload,
            &only,
            &HashMap::new(),
            &HashMap::new(),
            Some(&node_a.id),
        )
        .expect("a node");
        assert_eq!(chosen.id, node_a.id);
    }

    #[test]
    fn ties_break_deterministically() {
        let workload = test_workload("web", 2);
        let node_a = test_node(1);
        let node_b = test_node(2);

        let forward = vec![&node_a, &node_b];
        let backward = vec![&node_b, &node_a];
        let first = select_node(&workload, &forward, &HashMap::new(), &HashMap::new(), None)
            .expect("a node")
            .id;
        let second = select_node(&workload, &backward, &HashMap::new(), &HashMap::new(), None)
            .expect("a node")
            .id;
        assert_eq!(first, second);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let workload = test_workload("web", 2);
        assert!(select_node(&workload, &[], &HashMap::new(), &HashMap::new(), None).is_none());
    }
}
