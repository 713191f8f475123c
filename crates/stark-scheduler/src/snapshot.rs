//! Point-in-time view of the store taken at the start of each cycle.
//!
//! The snapshot is advisory: the lifecycle controller enforces final
//! transitions, and anything that changes mid-cycle is observed next cycle.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use stark_core::{NodeId, PackId, Resources, RuntimeTag};
use stark_store::{Node, Pod, PodOwner, Store};

use crate::error::Result;
use crate::filter::with_pod_slot;
use crate::types::WorkloadView;

/// Everything one reconcile cycle looks at.
pub struct Snapshot {
    /// All nodes.
    pub nodes: Vec<Node>,
    /// All pods.
    pub pods: Vec<Pod>,
    /// All workloads (services and deployments), flattened.
    pub workloads: Vec<WorkloadView>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Load a snapshot from the store.
    ///
    /// Workloads whose pack no longer resolves are skipped with a warning;
    /// their pods simply stay as they are until the pack reappears.
    ///
    /// # Errors
    ///
    /// Returns an error if any store read fails.
    pub fn load(store: &dyn Store) -> Result<Self> {
        let nodes = store.list_nodes()?;
        let pods = store.list_pods()?;
        let packs: HashMap<PackId, (RuntimeTag, Vec<String>)> = store
            .list_packs()?
            .into_iter()
            .map(|p| (p.id, (p.runtime_tag, p.granted_capabilities)))
            .collect();

        let mut workloads = Vec::new();
        for service in store.list_services()? {
            if let Some((tag, caps)) = packs.get(&service.pack_id) {
                workloads.push(WorkloadView::of_service(&service, *tag, caps.clone()));
            } else {
                tracing::warn!(
                    service_id = %service.id,
                    pack_id = %service.pack_id,
                    "Service references an unknown pack, skipping"
                );
            }
        }
        for deployment in store.list_deployments()? {
            if let Some((tag, caps)) = packs.get(&deployment.pack_id) {
                workloads.push(WorkloadView::of_deployment(&deployment, *tag, caps.clone()));
            } else {
                tracing::warn!(
                    deployment_id = %deployment.id,
                    pack_id = %deployment.pack_id,
                    "Deployment references an unknown pack, skipping"
                );
            }
        }

        Ok(Self {
            nodes,
            pods,
            workloads,
            taken_at: Utc::now(),
        })
    }

    /// Active pods (pending through running) belonging to an owner.
    #[must_use]
    pub fn active_pods_of(&self, owner: &PodOwner) -> Vec<&Pod> {
        self.pods
            .iter()
            .filter(|p| p.owner == *owner && p.status.is_active())
            .collect()
    }

    /// The most recently updated failed pod of an owner, if any.
    #[must_use]
    pub fn latest_failed_pod_of(&self, owner: &PodOwner) -> Option<&Pod> {
        self.pods
            .iter()
            .filter(|p| p.owner == *owner && p.status == stark_core::PodStatus::Failed)
            .max_by_key(|p| p.updated_at)
    }

    /// Active pods grouped by their node.
    #[must_use]
    pub fn pods_by_node(&self) -> HashMap<NodeId, Vec<&Pod>> {
        let mut map: HashMap<NodeId, Vec<&Pod>> = HashMap::new();
        for pod in &self.pods {
            if let Some(node_id) = pod.node_id {
                if pod.status.is_active() || pod.status == stark_core::PodStatus::Stopping {
                    map.entry(node_id).or_default().push(pod);
                }
            }
        }
        map
    }

    /// Resources committed per node: the summed requests (plus one pod slot
    /// each) of every placed, non-terminal pod.
    #[must_use]
    pub fn committed_by_node(&self) -> HashMap<NodeId, Resources> {
        let mut map: HashMap<NodeId, Resources> = HashMap::new();
        for pod in &self.pods {
            if let Some(node_id) = pod.node_id {
                if pod.status.is_active() || pod.status == stark_core::PodStatus::Stopping {
                    let entry = map.entry(node_id).or_insert(Resources::ZERO);
                    *entry = entry.saturating_add(&with_pod_slot(&pod.resource_requests));
                }
            }
        }
        map
    }

    /// The workload owning a pod, if it still exists.
    #[must_use]
    pub fn workload_of(&self, owner: &PodOwner) -> Option<&WorkloadView> {
        self.workloads.iter().find(|w| w.owner == *owner)
    }
}
