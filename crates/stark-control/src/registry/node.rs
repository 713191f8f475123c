//! The node registry: live view of registered nodes.
//!
//! Mutations are load-modify-update against the store; a stale write is
//! reloaded and retried once, which serializes concurrent writers per node.

use chrono::Utc;
use std::sync::Arc;

use stark_core::proto::Register;
use stark_core::{NodeId, NodeStatus, Resources};
use stark_store::{Node, Store, StoreError};

use crate::error::{ControlError, Result};

/// Registry of nodes, backed by the store.
pub struct NodeRegistry<S> {
    store: Arc<S>,
}

impl<S: Store> NodeRegistry<S> {
    /// Create a registry over the store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a node from its session's `register` frame.
    ///
    /// A node re-registering under a name it already holds keeps its ID and
    /// has its attributes refreshed; anything else creates a new node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn register(&self, registration: &Register) -> Result<Node> {
        let existing = self
            .store
            .list_nodes()?
            .into_iter()
            .find(|n| n.name == registration.node_name);

        if let Some(node) = existing {
            let updated = self.mutate(&node.id, |n| {
                n.runtime_type = registration.runtime_type;
                n.capabilities = registration.capabilities.clone();
                n.allocatable = registration.allocatable;
                n.labels = registration.labels.clone();
                n.taints = registration.taints.clone();
                n.peer_addr = registration.peer_addr.clone();
                n.status = NodeStatus::Ready;
                n.last_heartbeat = Utc::now();
            })?;
            tracing::info!(node_id = %updated.id, name = %updated.name, "Node re-registered");
            return Ok(updated);
        }

        let node = Node {
            id: NodeId::generate(),
            name: registration.node_name.clone(),
            runtime_type: registration.runtime_type,
            capabilities: registration.capabilities.clone(),
            allocatable: registration.allocatable,
            used: Resources::ZERO,
            labels: registration.labels.clone(),
            annotations: std::collections::BTreeMap::new(),
            taints: registration.taints.clone(),
            status: NodeStatus::Ready,
            peer_addr: registration.peer_addr.clone(),
            last_heartbeat: Utc::now(),
            version: 1,
        };
        self.store.put_node(&node)?;
        tracing::info!(node_id = %node.id, name = %node.name, "Node registered");
        Ok(node)
    }

    /// Record a heartbeat: refresh the timestamp and used resources, and
    /// recover `NotReady`/`Lost` nodes back to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn heartbeat(&self, node_id: &NodeId, used: Resources) -> Result<Node> {
        self.mutate(node_id, |n| {
            n.last_heartbeat = Utc::now();
            n.used = used;
            if matches!(n.status, NodeStatus::NotReady | NodeStatus::Lost) {
                tracing::info!(node_id = %n.id, from = ?n.status, "Node recovered by heartbeat");
                n.status = NodeStatus::Ready;
            }
        })
    }

    /// Set a node's status directly.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn update_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<Node> {
        self.mutate(node_id, |n| n.status = status)
    }

    /// Close a node to new placements.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn cordon(&self, node_id: &NodeId) -> Result<Node> {
        self.update_status(node_id, NodeStatus::Cordoned)
    }

    /// Reopen a cordoned or draining node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn uncordon(&self, node_id: &NodeId) -> Result<Node> {
        self.update_status(node_id, NodeStatus::Ready)
    }

    /// Mark a node lost.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn mark_lost(&self, node_id: &NodeId) -> Result<Node> {
        self.update_status(node_id, NodeStatus::Lost)
    }

    /// Get a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn get(&self, node_id: &NodeId) -> Result<Node> {
        self.store
            .get_node(node_id)?
            .ok_or(ControlError::NodeNotFound(*node_id))
    }

    /// List nodes, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list(&self, status: Option<NodeStatus>) -> Result<Vec<Node>> {
        let mut nodes = self.store.list_nodes()?;
        if let Some(wanted) = status {
            nodes.retain(|n| n.status == wanted);
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    /// Remove a node on explicit deregistration.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn deregister(&self, node_id: &NodeId) -> Result<()> {
        self.store.delete_node(node_id)?;
        tracing::info!(node_id = %node_id, "Node deregistered");
        Ok(())
    }

    /// Load-modify-update with a single retry on a stale write.
    fn mutate(&self, node_id: &NodeId, apply: impl Fn(&mut Node)) -> Result<Node> {
        for attempt in 0..2 {
            let mut node = self
                .store
                .get_node(node_id)?
                .ok_or(ControlError::NodeNotFound(*node_id))?;
            apply(&mut node);
            match self.store.update_node(&node) {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Stale { .. }) if attempt == 0 => {
                    tracing::debug!(node_id = %node_id, "Stale node write, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Store(StoreError::Internal(format!(
            "node {node_id} update kept racing"
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stark_core::RuntimeType;
    use stark_store::MemStore;
    use std::collections::BTreeMap;

    fn registration(name: &str) -> Register {
        Register {
            node_name: name.to_string(),
            runtime_type: RuntimeType::Server,
            capabilities: vec!["net".into()],
            allocatable: Resources::cpu_mem(4000, 8 << 30),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            peer_addr: Some("10.0.0.1:7700".into()),
        }
    }

    fn registry() -> NodeRegistry<MemStore> {
        NodeRegistry::new(Arc::new(MemStore::new()))
    }

    #[test]
    fn register_creates_ready_node() {
        let registry = registry();
        let node = registry.register(&registration("n1")).unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.name, "n1");
        assert_eq!(node.peer_addr.as_deref(), Some("10.0.0.1:7700"));
    }

    #[test]
    fn reregistration_keeps_id() {
        let registry = registry();
        let first = registry.register(&registration("n1")).unwrap();

        let mut again = registration("n1");
        again.allocatable = Resources::cpu_mem(8000, 16 << 30);
        let second = registry.register(&again).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.allocatable.cpu_millis, 8000);
        assert_eq!(registry.list(None).unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_recovers_not_ready() {
        let registry = registry();
        let node = registry.register(&registration("n1")).unwrap();

        registry.update_status(&node.id, NodeStatus::NotReady).unwrap();
        let recovered = registry
            .heartbeat(&node.id, Resources::cpu_mem(100, 200))
            .unwrap();
        assert_eq!(recovered.status, NodeStatus::Ready);
        assert_eq!(recovered.used.cpu_millis, 100);
    }

    #[test]
    fn heartbeat_leaves_cordon_alone() {
        let registry = registry();
        let node = registry.register(&registration("n1")).unwrap();

        registry.cordon(&node.id).unwrap();
        let after = registry.heartbeat(&node.id, Resources::ZERO).unwrap();
        assert_eq!(after.status, NodeStatus::Cordoned);

        let back = registry.uncordon(&node.id).unwrap();
        assert_eq!(back.status, NodeStatus::Ready);
    }

    #[test]
    fn list_filters_by_status() {
        let registry = registry();
        let a = registry.register(&registration("a")).unwrap();
        registry.register(&registration("b")).unwrap();
        registry.cordon(&a.id).unwrap();

        let cordoned = registry.list(Some(NodeStatus::Cordoned)).unwrap();
        assert_eq!(cordoned.len(), 1);
        assert_eq!(cordoned[0].name, "a");
        assert_eq!(registry.list(None).unwrap().len(), 2);
    }

    #[test]
    fn unknown_node_errors() {
        let registry = registry();
        let ghost = NodeId::generate_deterministic(1);
        assert!(matches!(
            registry.heartbeat(&ghost, Resources::ZERO),
            Err(ControlError::NodeNotFound(_))
        ));
        assert!(matches!(
            registry.deregister(&ghost),
            Err(ControlError::Store(StoreError::NotFound(_)))
        ));
    }
}
