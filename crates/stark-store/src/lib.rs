//! State records and the StateStore interface for stark.
//!
//! The authoritative row store is an external collaborator; the orchestrator
//! reaches it only through the [`Store`] trait defined here. Records are
//! typed (see `types`), writes are optimistic: every record carries a version
//! counter and `update_*` operations fail with [`StoreError::Stale`] when a
//! concurrent writer got there first. The crate ships [`MemStore`], an
//! in-memory implementation used by the orchestrator binary and by tests.
//!
//! # Example
//!
//! ```
//! use stark_store::{MemStore, Store};
//!
//! let store = MemStore::new();
//! assert!(store.list_nodes().unwrap().is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod mem;
pub mod types;

pub use error::{Result, StoreError};
pub use mem::MemStore;
pub use types::{
    Deployment, HistoryAction, NetworkPolicy, Node, Pack, Pod, PodHistoryEntry, PodOwner,
    ResourceSpec, Service, ServiceNetworkMeta, WorkloadStatus,
};

use stark_core::state::Namespace;
use stark_core::{DeploymentId, NodeId, PackId, PodId, ServiceId};

/// The narrow interface through which all orchestrator state is reached.
///
/// Implementations must serialize concurrent updates to the same row: the
/// second writer either observes the first's write or fails with
/// [`StoreError::Stale`].
pub trait Store: Send + Sync {
    // =========================================================================
    // Nodes
    // =========================================================================

    /// Insert a new node record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the node already exists.
    fn put_node(&self, node: &Node) -> Result<()>;

    /// Get a node by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_node(&self, id: &NodeId) -> Result<Option<Node>>;

    /// Update a node, checking its version.
    ///
    /// Returns the stored record with the bumped version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the node does not exist and
    /// `StoreError::Stale` on a version mismatch.
    fn update_node(&self, node: &Node) -> Result<Node>;

    /// Delete a node by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the node does not exist.
    fn delete_node(&self, id: &NodeId) -> Result<()>;

    /// List all nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_nodes(&self) -> Result<Vec<Node>>;

    // =========================================================================
    // Packs
    // =========================================================================

    /// Publish a pack. Packs are immutable after publish.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the pack ID, or the
    /// `(name, version)` pair, is already taken.
    fn put_pack(&self, pack: &Pack) -> Result<()>;

    /// Get a pack by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_pack(&self, id: &PackId) -> Result<Option<Pack>>;

    /// List all published packs.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_packs(&self) -> Result<Vec<Pack>>;

    /// The most recently published pack with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn latest_pack(&self, name: &str) -> Result<Option<Pack>>;

    // =========================================================================
    // Services
    // =========================================================================

    /// Insert a new service record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the service already exists.
    fn put_service(&self, service: &Service) -> Result<()>;

    /// Get a service by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_service(&self, id: &ServiceId) -> Result<Option<Service>>;

    /// Update a service, checking its version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` or `StoreError::Stale`.
    fn update_service(&self, service: &Service) -> Result<Service>;

    /// Delete a service by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the service does not exist.
    fn delete_service(&self, id: &ServiceId) -> Result<()>;

    /// List all services.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_services(&self) -> Result<Vec<Service>>;

    // =========================================================================
    // Deployments
    // =========================================================================

    /// Insert a new deployment record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the deployment already exists.
    fn put_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Get a deployment by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>>;

    /// Update a deployment, checking its version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` or `StoreError::Stale`.
    fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Delete a deployment by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the deployment does not exist.
    fn delete_deployment(&self, id: &DeploymentId) -> Result<()>;

    /// List all deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_deployments(&self) -> Result<Vec<Deployment>>;

    // =========================================================================
    // Pods
    // =========================================================================

    /// Insert a new pod record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Duplicate` if the pod already exists.
    fn put_pod(&self, pod: &Pod) -> Result<()>;

    /// Get a pod by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_pod(&self, id: &PodId) -> Result<Option<Pod>>;

    /// Update a pod, checking its version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` or `StoreError::Stale`.
    fn update_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the pod does not exist.
    fn delete_pod(&self, id: &PodId) -> Result<()>;

    /// List all pods.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_pods(&self) -> Result<Vec<Pod>>;

    /// List all pods belonging to the given owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_pods_by_owner(&self, owner: &PodOwner) -> Result<Vec<Pod>>;

    /// List all pods assigned to the given node.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_pods_by_node(&self, node_id: &NodeId) -> Result<Vec<Pod>>;

    // =========================================================================
    // Pod history
    // =========================================================================

    /// Append one history entry. Entries are never modified or deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append_pod_history(&self, entry: &PodHistoryEntry) -> Result<()>;

    /// List a pod's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_pod_history(&self, pod_id: &PodId) -> Result<Vec<PodHistoryEntry>>;

    // =========================================================================
    // Network policies
    // =========================================================================

    /// Insert or replace the rule for `(source, target, namespace)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert_network_policy(&self, policy: &NetworkPolicy) -> Result<()>;

    /// Remove the rule for the pair key, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove_network_policy(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<bool>;

    /// The rule for the pair key, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn find_network_policy(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<Option<NetworkPolicy>>;

    /// All rules in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_network_policies(&self, namespace: Namespace) -> Result<Vec<NetworkPolicy>>;

    /// Number of rules in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn network_policy_count(&self, namespace: Namespace) -> Result<usize>;

    // =========================================================================
    // Projections
    // =========================================================================

    /// The expose-model network posture of a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn service_network_meta(&self, id: &ServiceId) -> Result<Option<ServiceNetworkMeta>> {
        Ok(self.get_service(id)?.map(|s| ServiceNetworkMeta::from(&s)))
    }
}
