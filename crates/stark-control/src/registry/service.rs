//! The service registry: authoritative endpoint index and target selection.
//!
//! `serviceId → {podId, nodeId, status}` entries are maintained by the pod
//! lifecycle controller as pods come and go. Only endpoints whose pod is
//! `Running` on a `Ready` node are selectable. Changes fan out to
//! subscribers over a broadcast channel.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use stark_core::{NodeId, NodeStatus, PodId, PodStatus, ServiceId};
use stark_store::Store;

use crate::error::{ControlError, Result};

/// One pod endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The pod.
    pub pod_id: PodId,
    /// The node hosting it.
    pub node_id: NodeId,
    /// The pod's last known status.
    pub status: PodStatus,
}

/// Target-selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectStrategy {
    /// Pick once at random, record it, and keep answering with the same
    /// pod while it stays selectable.
    #[default]
    StickyRandomFirst,
    /// Rotate through the selectable endpoints.
    RoundRobin,
    /// Independent random pick each call.
    Random,
}

/// A change to a service's endpoint set.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// An endpoint appeared.
    Added {
        /// The service.
        service_id: ServiceId,
        /// The new endpoint.
        endpoint: Endpoint,
    },
    /// An endpoint disappeared.
    Removed {
        /// The service.
        service_id: ServiceId,
        /// The departed pod.
        pod_id: PodId,
    },
    /// An endpoint's pod status changed.
    StatusChanged {
        /// The service.
        service_id: ServiceId,
        /// The pod.
        pod_id: PodId,
        /// Its new status.
        status: PodStatus,
    },
}

/// The endpoint index plus selection state.
pub struct ServiceRegistry<S> {
    store: Arc<S>,
    endpoints: RwLock<HashMap<ServiceId, Vec<Endpoint>>>,
    sticky: Mutex<HashMap<ServiceId, PodId>>,
    round_robin: Mutex<HashMap<ServiceId, usize>>,
    pick_seed: Mutex<u64>,
    events: broadcast::Sender<EndpointEvent>,
}

impl<S: Store> ServiceRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            endpoints: RwLock::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            pick_seed: Mutex::new(0x5145_1f2e),
            events,
        }
    }

    /// Subscribe to endpoint changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Add (or refresh) a pod endpoint.
    pub fn add_pod_endpoint(
        &self,
        service_id: &ServiceId,
        pod_id: PodId,
        node_id: NodeId,
        status: PodStatus,
    ) {
        let endpoint = Endpoint {
            pod_id,
            node_id,
            status,
        };
        let mut endpoints = self.endpoints.write();
        let list = endpoints.entry(service_id.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|e| e.pod_id == pod_id) {
            *existing = endpoint.clone();
        } else {
            list.push(endpoint.clone());
        }
        drop(endpoints);
        let _ = self.events.send(EndpointEvent::Added {
            service_id: service_id.clone(),
            endpoint,
        });
    }

    /// Remove a pod endpoint.
    pub fn remove_pod_endpoint(&self, service_id: &ServiceId, pod_id: &PodId) {
        let mut endpoints = self.endpoints.write();
        if let Some(list) = endpoints.get_mut(service_id) {
            list.retain(|e| e.pod_id != *pod_id);
            if list.is_empty() {
                endpoints.remove(service_id);
            }
        }
        drop(endpoints);

        let mut sticky = self.sticky.lock();
        if sticky.get(service_id) == Some(pod_id) {
            sticky.remove(service_id);
        }
        drop(sticky);

        let _ = self.events.send(EndpointEvent::Removed {
            service_id: service_id.clone(),
            pod_id: *pod_id,
        });
    }

    /// Record a status change on an existing endpoint.
    pub fn status_changed(&self, service_id: &ServiceId, pod_id: &PodId, status: PodStatus) {
        let mut endpoints = self.endpoints.write();
        if let Some(endpoint) = endpoints
            .get_mut(service_id)
            .and_then(|list| list.iter_mut().find(|e| e.pod_id == *pod_id))
        {
            endpoint.status = status;
        }
        drop(endpoints);
        let _ = self.events.send(EndpointEvent::StatusChanged {
            service_id: service_id.clone(),
            pod_id: *pod_id,
            status,
        });
    }

    /// All endpoints of a service, selectable or not.
    #[must_use]
    pub fn endpoints_of(&self, service_id: &ServiceId) -> Vec<Endpoint> {
        self.endpoints
            .read()
            .get(service_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The selectable endpoints: `Running` pods on `Ready` nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the node lookup fails.
    pub fn selectable(&self, service_id: &ServiceId) -> Result<Vec<Endpoint>> {
        let candidates = self.endpoints_of(service_id);
        let mut selectable = Vec::new();
        for endpoint in candidates {
            if endpoint.status != PodStatus::Running {
                continue;
            }
            let node_ready = self
                .store
                .get_node(&endpoint.node_id)?
                .is_some_and(|n| n.status == NodeStatus::Ready);
            if node_ready {
                selectable.push(endpoint);
            }
        }
        Ok(selectable)
    }

    /// Select a target pod for a service using the given strategy.
    ///
    /// # Errors
    ///
    /// Returns `NoEndpoint` when nothing is selectable.
    pub fn select_target(
        &self,
        service_id: &ServiceId,
        strategy: SelectStrategy,
    ) -> Result<Endpoint> {
        let selectable = self.selectable(service_id)?;
        if selectable.is_empty() {
            return Err(ControlError::NoEndpoint(service_id.clone()));
        }

        let endpoint = match strategy {
            SelectStrategy::StickyRandomFirst => {
                let mut sticky = self.sticky.lock();
                if let Some(recorded) = sticky.get(service_id) {
                    if let Some(found) = selectable.iter().find(|e| e.pod_id == *recorded) {
                        return Ok(found.clone());
                    }
                }
                let chosen = selectable[self.pick(selectable.len())].clone();
                sticky.insert(service_id.clone(), chosen.pod_id);
                chosen
            }
            SelectStrategy::RoundRobin => {
                let mut counters = self.round_robin.lock();
                let counter = counters.entry(service_id.clone()).or_insert(0);
                let chosen = selectable[*counter % selectable.len()].clone();
                *counter = counter.wrapping_add(1);
                chosen
            }
            SelectStrategy::Random => selectable[self.pick(selectable.len())].clone(),
        };
        Ok(endpoint)
    }

    /// A pseudo-random index without a PRNG dependency: hash a mixing seed.
    fn pick(&self, len: usize) -> usize {
        let mut seed = self.pick_seed.lock();
        *seed = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
        let digest = blake3::hash(&seed.to_le_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        usize::try_from(u64::from_le_bytes(bytes)).unwrap_or(0) % len
    }
}
