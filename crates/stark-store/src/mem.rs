//! In-memory `Store` implementation.
//!
//! Each entity family sits in its own map behind its own lock, so writers to
//! different families never contend. Version checks happen under the write
//! lock, which is what serializes concurrent updates to the same row.

use parking_lot::RwLock;
use std::collections::HashMap;

use stark_core::state::Namespace;
use stark_core::{DeploymentId, NodeId, PackId, PodId, ServiceId};

use crate::error::{Result, StoreError};
use crate::types::{
    Deployment, NetworkPolicy, Node, Pack, Pod, PodHistoryEntry, PodOwner, Service,
};
use crate::Store;

type PolicyKey = (ServiceId, ServiceId, Namespace);

/// An in-memory, lock-per-family state store.
#[derive(Default)]
pub struct MemStore {
    nodes: RwLock<HashMap<NodeId, Node>>,
    packs: RwLock<HashMap<PackId, Pack>>,
    services: RwLock<HashMap<ServiceId, Service>>,
    deployments: RwLock<HashMap<DeploymentId, Deployment>>,
    pods: RwLock<HashMap<PodId, Pod>>,
    pod_history: RwLock<HashMap<PodId, Vec<PodHistoryEntry>>>,
    policies: RwLock<HashMap<PolicyKey, NetworkPolicy>>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Version-checked replace of an existing record.
///
/// Returns the stored copy with the bumped version.
fn versioned_replace<T: Clone>(
    existing: Option<&mut T>,
    incoming: &T,
    version_of: impl Fn(&T) -> u64,
    set_version: impl Fn(&mut T, u64),
    what: &str,
) -> Result<T> {
    let slot = existing.ok_or_else(|| StoreError::NotFound(what.to_string()))?;
    let stored_version = version_of(slot);
    let expected = version_of(incoming);
    if stored_version != expected {
        return Err(StoreError::Stale {
            expected,
            stored: stored_version,
        });
    }
    let mut updated = incoming.clone();
    set_version(&mut updated, stored_version + 1);
    *slot = updated.clone();
    Ok(updated)
}

impl Store for MemStore {
    // =========================================================================
    // Nodes
    // =========================================================================

    fn put_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(StoreError::Duplicate(format!("node {}", node.id)));
        }
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        Ok(self.nodes.read().get(id).cloned())
    }

    fn update_node(&self, node: &Node) -> Result<Node> {
        let mut nodes = self.nodes.write();
        versioned_replace(
            nodes.get_mut(&node.id),
            node,
            |n| n.version,
            |n, v| n.version = v,
            &format!("node {}", node.id),
        )
    }

    fn delete_node(&self, id: &NodeId) -> Result<()> {
        self.nodes
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.read().values().cloned().collect())
    }

    // =========================================================================
    // Packs
    // =========================================================================

    fn put_pack(&self, pack: &Pack) -> Result<()> {
        let mut packs = self.packs.write();
        if packs.contains_key(&pack.id) {
            return Err(StoreError::Duplicate(format!("pack {}", pack.id)));
        }
        if packs
            .values()
            .any(|p| p.name == pack.name && p.version == pack.version)
        {
            return Err(StoreError::Duplicate(format!(
                "pack {}@{}",
                pack.name, pack.version
            )));
        }
        packs.insert(pack.id, pack.clone());
        Ok(())
    }

    fn get_pack(&self, id: &PackId) -> Result<Option<Pack>> {
        Ok(self.packs.read().get(id).cloned())
    }

    fn list_packs(&self) -> Result<Vec<Pack>> {
        Ok(self.packs.read().values().cloned().collect())
    }

    fn latest_pack(&self, name: &str) -> Result<Option<Pack>> {
        Ok(self
            .packs
            .read()
            .values()
            .filter(|p| p.name == name)
            .max_by_key(|p| p.published_at)
            .cloned())
    }

    // =========================================================================
    // Services
    // =========================================================================

    fn put_service(&self, service: &Service) -> Result<()> {
        let mut services = self.services.write();
        if services.contains_key(&service.id) {
            return Err(StoreError::Duplicate(format!("service {}", service.id)));
        }
        services.insert(service.id.clone(), service.clone());
        Ok(())
    }

    fn get_service(&self, id: &ServiceId) -> Result<Option<Service>> {
        Ok(self.services.read().get(id).cloned())
    }

    fn update_service(&self, service: &Service) -> Result<Service> {
        let mut services = self.services.write();
        versioned_replace(
            services.get_mut(&service.id),
            service,
            |s| s.version,
            |s, v| s.version = v,
            &format!("service {}", service.id),
        )
    }

    fn delete_service(&self, id: &ServiceId) -> Result<()> {
        self.services
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("service {id}")))
    }

    fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.read().values().cloned().collect())
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    fn put_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut deployments = self.deployments.write();
        if deployments.contains_key(&deployment.id) {
            return Err(StoreError::Duplicate(format!(
                "deployment {}",
                deployment.id
            )));
        }
        deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>> {
        Ok(self.deployments.read().get(id).cloned())
    }

    fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut deployments = self.deployments.write();
        versioned_replace(
            deployments.get_mut(&deployment.id),
            deployment,
            |d| d.version,
            |d, v| d.version = v,
            &format!("deployment {}", deployment.id),
        )
    }

    fn delete_deployment(&self, id: &DeploymentId) -> Result<()> {
        self.deployments
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("deployment {id}")))
    }

    fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.deployments.read().values().cloned().collect())
    }

    // =========================================================================
    // Pods
    // =========================================================================

    fn put_pod(&self, pod: &Pod) -> Result<()> {
        let mut pods = self.pods.write();
        if pods.contains_key(&pod.id) {
            return Err(StoreError::Duplicate(format!("pod {}", pod.id)));
        }
        pods.insert(pod.id, pod.clone());
        Ok(())
    }

    fn get_pod(&self, id: &PodId) -> Result<Option<Pod>> {
        Ok(self.pods.read().get(id).cloned())
    }

    fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        let mut pods = self.pods.write();
        versioned_replace(
            pods.get_mut(&pod.id),
            pod,
            |p| p.version,
            |p, v| p.version = v,
            &format!("pod {}", pod.id),
        )
    }

    fn delete_pod(&self, id: &PodId) -> Result<()> {
        self.pods
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("pod {id}")))
    }

    fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.read().values().cloned().collect())
    }

    fn list_pods_by_owner(&self, owner: &PodOwner) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .read()
            .values()
            .filter(|p| p.owner == *owner)
            .cloned()
            .collect())
    }

    fn list_pods_by_node(&self, node_id: &NodeId) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .read()
            .values()
            .filter(|p| p.node_id.as_ref() == Some(node_id))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Pod history
    // =========================================================================

    fn append_pod_history(&self, entry: &PodHistoryEntry) -> Result<()> {
        self.pod_history
            .write()
            .entry(entry.pod_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn list_pod_history(&self, pod_id: &PodId) -> Result<Vec<PodHistoryEntry>> {
        Ok(self
            .pod_history
            .read()
            .get(pod_id)
            .cloned()
            .unwrap_or_default())
    }

    // =========================================================================
    // Network policies
    // =========================================================================

    fn upsert_network_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        let key = (
            policy.source_service.clone(),
            policy.target_service.clone(),
            policy.namespace,
        );
        self.policies.write().insert(key, policy.clone());
        Ok(())
    }

    fn remove_network_policy(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<bool> {
        let key = (source.clone(), target.clone(), namespace);
        Ok(self.policies.write().remove(&key).is_some())
    }

    fn find_network_policy(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<Option<NetworkPolicy>> {
        let key = (source.clone(), target.clone(), namespace);
        Ok(self.policies.read().get(&key).cloned())
    }

    fn list_network_policies(&self, namespace: Namespace) -> Result<Vec<NetworkPolicy>> {
        Ok(self
            .policies
            .read()
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    fn network_policy_count(&self, namespace: Namespace) -> Result<usize> {
        Ok(self
            .policies
            .read()
            .keys()
            .filter(|(_, _, ns)| *ns == namespace)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HistoryAction, WorkloadStatus};
    use chrono::Utc;
    use stark_core::state::PolicyAction;
    use stark_core::{PodStatus, Resources, RuntimeTag, RuntimeType};
    use std::collections::BTreeMap;

    fn node(seed: u64) -> Node {
        Node {
            id: NodeId::generate_deterministic(seed),
            name: format!("node-{seed}"),
            runtime_type: RuntimeType::Server,
            capabilities: Vec::new(),
            allocatable: Resources::cpu_mem(4000, 8 << 30),
            used: Resources::ZERO,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            taints: Vec::new(),
            status: stark_core::NodeStatus::Ready,
            peer_addr: None,
            last_heartbeat: Utc::now(),
            version: 1,
        }
    }

    fn pod(seed: u64, owner: &PodOwner) -> Pod {
        let now = Utc::now();
        Pod {
            id: PodId::generate_deterministic(seed),
            owner: owner.clone(),
            node_id: None,
            pack_id: PackId::generate_deterministic(1),
            pack_version: "1.0.0".into(),
            namespace: Namespace::User,
            status: PodStatus::Pending,
            status_message: None,
            resource_requests: Resources::ZERO,
            resource_limits: Resources::ZERO,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            priority: 0,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn node_crud() {
        let store = MemStore::new();
        let n = node(1);

        store.put_node(&n).unwrap();
        assert!(matches!(
            store.put_node(&n),
            Err(StoreError::Duplicate(_))
        ));

        let fetched = store.get_node(&n.id).unwrap().unwrap();
        assert_eq!(fetched.name, "node-1");

        store.delete_node(&n.id).unwrap();
        assert!(store.get_node(&n.id).unwrap().is_none());
        assert!(matches!(
            store.delete_node(&n.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn stale_update_rejected() {
        let store = MemStore::new();
        let n = node(1);
        store.put_node(&n).unwrap();

        // First writer succeeds and bumps the version.
        let mut first = n.clone();
        first.name = "renamed".into();
        let stored = store.update_node(&first).unwrap();
        assert_eq!(stored.version, 2);

        // Second writer still holds version 1.
        let mut second = n.clone();
        second.name = "lost-the-race".into();
        let result = store.update_node(&second);
        assert!(matches!(
            result,
            Err(StoreError::Stale {
                expected: 1,
                stored: 2
            })
        ));

        // Reload-and-retry succeeds.
        let mut retry = store.get_node(&n.id).unwrap().unwrap();
        retry.name = "lost-the-race".into();
        let stored = store.update_node(&retry).unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.name, "lost-the-race");
    }

    #[test]
    fn pack_name_version_unique() {
        let store = MemStore::new();
        let pack = Pack {
            id: PackId::generate_deterministic(1),
            name: "api".into(),
            version: "1.0.0".into(),
            runtime_tag: RuntimeTag::Universal,
            namespace: Namespace::User,
            bundle: b"code".to_vec(),
            enable_ephemeral: false,
            metadata: BTreeMap::new(),
            granted_capabilities: Vec::new(),
            published_at: Utc::now(),
        };
        store.put_pack(&pack).unwrap();

        let mut clash = pack.clone();
        clash.id = PackId::generate_deterministic(2);
        assert!(matches!(
            store.put_pack(&clash),
            Err(StoreError::Duplicate(_))
        ));

        let mut next = pack.clone();
        next.id = PackId::generate_deterministic(3);
        next.version = "1.1.0".into();
        next.published_at = Utc::now();
        store.put_pack(&next).unwrap();

        let latest = store.latest_pack("api").unwrap().unwrap();
        assert_eq!(latest.version, "1.1.0");
    }

    #[test]
    fn pods_indexed_by_owner_and_node() {
        let store = MemStore::new();
        let owner_a = PodOwner::Service("a".parse().unwrap());
        let owner_b = PodOwner::Service("b".parse().unwrap());
        let node_id = NodeId::generate_deterministic(9);

        let mut p1 = pod(1, &owner_a);
        p1.node_id = Some(node_id);
        p1.status = PodStatus::Running;
        let p2 = pod(2, &owner_a);
        let p3 = pod(3, &owner_b);

        store.put_pod(&p1).unwrap();
        store.put_pod(&p2).unwrap();
        store.put_pod(&p3).unwrap();

        assert_eq!(store.list_pods_by_owner(&owner_a).unwrap().len(), 2);
        assert_eq!(store.list_pods_by_owner(&owner_b).unwrap().len(), 1);
        assert_eq!(store.list_pods_by_node(&node_id).unwrap().len(), 1);
    }

    #[test]
    fn history_appends_in_order() {
        let store = MemStore::new();
        let pod_id = PodId::generate_deterministic(1);

        for (i, status) in [PodStatus::Pending, PodStatus::Scheduled, PodStatus::Running]
            .into_iter()
            .enumerate()
        {
            store
                .append_pod_history(&PodHistoryEntry {
                    pod_id,
                    action: if i == 0 {
                        HistoryAction::Create
                    } else {
                        HistoryAction::Transition
                    },
                    previous_status: None,
                    new_status: status,
                    previous_node_id: None,
                    new_node_id: None,
                    previous_version: None,
                    new_version: None,
                    reason: "test".into(),
                    message: String::new(),
                    actor: None,
                    metadata: BTreeMap::new(),
                    timestamp: Utc::now(),
                })
                .unwrap();
        }

        let history = store.list_pod_history(&pod_id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].new_status, PodStatus::Pending);
        assert_eq!(history[2].new_status, PodStatus::Running);
    }

    #[test]
    fn policy_upsert_replaces_pair() {
        let store = MemStore::new();
        let src: ServiceId = "a".parse().unwrap();
        let tgt: ServiceId = "b".parse().unwrap();

        let mut policy = NetworkPolicy {
            id: "netpol-1".into(),
            source_service: src.clone(),
            target_service: tgt.clone(),
            action: PolicyAction::Allow,
            namespace: Namespace::User,
            created_at: Utc::now(),
        };
        store.upsert_network_policy(&policy).unwrap();
        store.upsert_network_policy(&policy).unwrap();
        assert_eq!(store.network_policy_count(Namespace::User).unwrap(), 1);

        policy.action = PolicyAction::Deny;
        store.upsert_network_policy(&policy).unwrap();
        let found = store
            .find_network_policy(&src, &tgt, Namespace::User)
            .unwrap()
            .unwrap();
        assert_eq!(found.action, PolicyAction::Deny);

        assert!(store
            .remove_network_policy(&src, &tgt, Namespace::User)
            .unwrap());
        assert!(!store
            .remove_network_policy(&src, &tgt, Namespace::User)
            .unwrap());
    }

    #[test]
    fn network_meta_projection() {
        let store = MemStore::new();
        let svc = crate::types::tests::test_service("web");
        store.put_service(&svc).unwrap();

        let meta = store.service_network_meta(&svc.id).unwrap().unwrap();
        assert_eq!(meta.service_id, svc.id);
        assert!(store
            .service_network_meta(&"ghost".parse().unwrap())
            .unwrap()
            .is_none());

        // Service status fields are preserved through updates.
        let mut svc2 = store.get_service(&svc.id).unwrap().unwrap();
        svc2.status = WorkloadStatus::Degraded;
        store.update_service(&svc2).unwrap();
        assert_eq!(
            store.get_service(&svc.id).unwrap().unwrap().status,
            WorkloadStatus::Degraded
        );
    }
}
