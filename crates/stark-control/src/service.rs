//! The orchestrator root: owns every control-plane component and exposes
//! the operations the gateway and CLI surface.
//!
//! Components are long-lived values wired here and passed explicitly to
//! their consumers; nothing is a global.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

use stark_auth::TokenAuthority;
use stark_core::state::Namespace;
use stark_core::{CoreError, DeploymentId, NodeId, PodId, ServiceId};
use stark_scheduler::{SchedulerHandle, Trigger};
use stark_store::{
    Deployment, NetworkPolicy, Node, Pack, Pod, PodHistoryEntry, PodOwner, Service, Store,
    StoreError, WorkloadStatus,
};

use crate::error::{ControlError, Result};
use crate::lifecycle::LifecycleController;
use crate::podgroup::PodGroupStore;
use crate::policy::PolicyEngine;
use crate::registry::{NodeRegistry, ServiceRegistry};
use crate::session::SessionHub;
use crate::signaling::SignalingHub;
use crate::types::{
    ControlConfig, CreateDeploymentRequest, CreateServiceRequest, PublishPackRequest,
    RolloutRequest,
};

/// The orchestrator control plane.
pub struct Orchestrator<S> {
    pub(crate) store: Arc<S>,
    pub(crate) sessions: Arc<SessionHub>,
    pub(crate) nodes: NodeRegistry<S>,
    pub(crate) services: Arc<ServiceRegistry<S>>,
    pub(crate) lifecycle: LifecycleController<S>,
    pub(crate) policy: Arc<PolicyEngine<S>>,
    pub(crate) signaling: SignalingHub<S>,
    pub(crate) groups: PodGroupStore,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) config: ControlConfig,
}

impl<S: Store + 'static> Orchestrator<S> {
    /// Wire up the control plane.
    ///
    /// Returns the orchestrator and the trigger receiver to hand to the
    /// scheduler's reconcile loop.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        tokens: Arc<TokenAuthority>,
        config: ControlConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let sessions = Arc::new(SessionHub::new(config.request_timeout()));
        let service_registry = Arc::new(ServiceRegistry::new(Arc::clone(&store)));
        let policy = Arc::new(PolicyEngine::new(Arc::clone(&store)));
        let (scheduler, trigger_rx) = SchedulerHandle::channel();

        let lifecycle = LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&tokens),
            Arc::clone(&service_registry),
            scheduler.clone(),
            config.clone(),
        );
        let signaling = SignalingHub::new(
            Arc::clone(&sessions),
            Arc::clone(&store),
            tokens,
            Arc::clone(&policy),
        );

        let orchestrator = Self {
            nodes: NodeRegistry::new(Arc::clone(&store)),
            groups: PodGroupStore::new(config.group_member_cap),
            services: service_registry,
            sessions,
            lifecycle,
            policy,
            signaling,
            scheduler,
            config,
            store,
        };
        (orchestrator, trigger_rx)
    }

    /// The session hub.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionHub> {
        &self.sessions
    }

    /// The lifecycle controller; it doubles as the scheduler's placement
    /// sink.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleController<S> {
        &self.lifecycle
    }

    /// The node registry.
    #[must_use]
    pub const fn nodes(&self) -> &NodeRegistry<S> {
        &self.nodes
    }

    /// The service registry.
    #[must_use]
    pub fn service_registry(&self) -> &Arc<ServiceRegistry<S>> {
        &self.services
    }

    /// The policy engine.
    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyEngine<S>> {
        &self.policy
    }

    /// The pod-group store.
    #[must_use]
    pub const fn groups(&self) -> &PodGroupStore {
        &self.groups
    }

    /// The control-plane configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    // =========================================================================
    // Packs
    // =========================================================================

    /// Publish a pack.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the `(name, version)` pair exists and
    /// `Invalid` for a malformed bundle.
    pub fn publish_pack(&self, request: PublishPackRequest) -> Result<Pack> {
        use base64::Engine as _;
        let bundle = base64::engine::general_purpose::STANDARD
            .decode(&request.bundle)
            .map_err(|e| CoreError::Invalid(format!("bundle is not valid base64: {e}")))?;

        let pack = Pack {
            id: stark_core::PackId::generate(),
            name: request.name,
            version: request.version,
            runtime_tag: request.runtime_tag,
            namespace: request.namespace,
            bundle,
            enable_ephemeral: request.enable_ephemeral,
            metadata: request.metadata,
            granted_capabilities: request.granted_capabilities,
            published_at: Utc::now(),
        };
        self.store.put_pack(&pack)?;
        tracing::info!(pack_id = %pack.id, name = %pack.name, version = %pack.version, "Pack published");
        Ok(pack)
    }

    /// List all packs.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_packs(&self) -> Result<Vec<Pack>> {
        Ok(self.store.list_packs()?)
    }

    /// Resolve a pack by name and optional version.
    fn resolve_pack(&self, name: &str, version: Option<&str>) -> Result<Pack> {
        match version {
            Some(wanted) => self
                .store
                .list_packs()?
                .into_iter()
                .find(|p| p.name == name && p.version == wanted)
                .ok_or_else(|| {
                    ControlError::Core(CoreError::NotFound(format!("pack {name}@{wanted}")))
                }),
            None => self
                .store
                .latest_pack(name)?
                .ok_or_else(|| ControlError::Core(CoreError::NotFound(format!("pack {name}")))),
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Create a service.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for duplicate IDs and `NotFound` for unknown
    /// packs.
    pub fn create_service(&self, request: CreateServiceRequest) -> Result<Service> {
        let pack = self.resolve_pack(&request.pack_name, request.pack_version.as_deref())?;
        let now = Utc::now();
        let service = Service {
            id: request.id,
            namespace: request.namespace,
            pack_id: pack.id,
            pack_version: pack.version,
            follow_latest: request.pack_version.is_none(),
            replicas: request.replicas,
            status: WorkloadStatus::Active,
            labels: request.labels,
            scheduling: request.scheduling,
            resources: request.resources,
            priority: request.priority,
            visibility: request.visibility,
            exposed: request.exposed,
            allowed_sources: request.allowed_sources,
            ingress_port: request.ingress_port,
            ready_replicas: 0,
            available_replicas: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.store.put_service(&service)?;
        self.scheduler.nudge(Trigger::WorkloadChanged);
        tracing::info!(service_id = %service.id, replicas = service.replicas, "Service created");
        Ok(service)
    }

    /// Get a service.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` for unknown services.
    pub fn get_service(&self, id: &ServiceId) -> Result<Service> {
        self.store
            .get_service(id)?
            .ok_or_else(|| ControlError::ServiceNotFound(id.clone()))
    }

    /// List all services.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_services(&self) -> Result<Vec<Service>> {
        let mut services = self.store.list_services()?;
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    /// Change a service's desired replica count.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` for unknown services.
    pub fn scale_service(&self, id: &ServiceId, replicas: u32) -> Result<Service> {
        let updated = self.mutate_service(id, |s| s.replicas = replicas)?;
        self.scheduler.nudge(Trigger::WorkloadChanged);
        tracing::info!(service_id = %id, replicas, "Service scaled");
        Ok(updated)
    }

    /// Roll a service to a new pack version (or the latest).
    ///
    /// The reconcile loop performs the actual replacement in
    /// `max_unavailable` batches; a rollback is simply a rollout to the
    /// older version.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` or `NotFound` for an unknown version.
    pub fn rollout_service(&self, id: &ServiceId, request: &RolloutRequest) -> Result<Service> {
        let service = self.get_service(id)?;
        let current_pack = self
            .store
            .get_pack(&service.pack_id)?
            .ok_or_else(|| CoreError::NotFound(format!("pack {}", service.pack_id)))?;
        let target = self.resolve_pack(&current_pack.name, request.pack_version.as_deref())?;

        let updated = self.mutate_service(id, |s| {
            s.pack_id = target.id;
            s.pack_version = target.version.clone();
            s.follow_latest = request.pack_version.is_none();
        })?;
        self.scheduler.nudge(Trigger::WorkloadChanged);
        tracing::info!(
            service_id = %id,
            version = %updated.pack_version,
            "Service rollout started"
        );
        Ok(updated)
    }

    /// Delete a service: stop its pods, drop its endpoints, remove the
    /// record.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` for unknown services.
    pub fn delete_service(&self, id: &ServiceId) -> Result<()> {
        let service = self.get_service(id)?;
        let owner = PodOwner::Service(service.id.clone());
        for pod in self.store.list_pods_by_owner(&owner)? {
            if !pod.status.is_terminal() {
                if let Err(e) = self.lifecycle.stop_pod_now(&pod.id, "ServiceDeleted") {
                    tracing::warn!(pod_id = %pod.id, error = %e, "Stop on delete failed");
                }
            }
            self.services.remove_pod_endpoint(id, &pod.id);
        }
        self.store.delete_service(id)?;
        self.scheduler.nudge(Trigger::WorkloadChanged);
        tracing::info!(service_id = %id, "Service deleted");
        Ok(())
    }

    fn mutate_service(&self, id: &ServiceId, apply: impl Fn(&mut Service)) -> Result<Service> {
        for attempt in 0..2 {
            let mut service = self.get_service(id)?;
            apply(&mut service);
            service.updated_at = Utc::now();
            match self.store.update_service(&service) {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Stale { .. }) if attempt == 0 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Store(StoreError::Internal(format!(
            "service {id} update kept racing"
        ))))
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    /// Create a deployment.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for duplicates and `NotFound` for unknown packs.
    pub fn create_deployment(&self, request: CreateDeploymentRequest) -> Result<Deployment> {
        let pack = self.resolve_pack(&request.pack_name, request.pack_version.as_deref())?;
        let now = Utc::now();
        let deployment = Deployment {
            id: DeploymentId::generate(),
            name: request.name,
            namespace: request.namespace,
            pack_id: pack.id,
            pack_version: pack.version,
            follow_latest: request.pack_version.is_none(),
            replicas: request.replicas,
            status: WorkloadStatus::Active,
            labels: request.labels,
            scheduling: request.scheduling,
            resources: request.resources,
            priority: request.priority,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.store.put_deployment(&deployment)?;
        self.scheduler.nudge(Trigger::WorkloadChanged);
        tracing::info!(deployment_id = %deployment.id, name = %deployment.name, "Deployment created");
        Ok(deployment)
    }

    /// Get a deployment.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown deployments.
    pub fn get_deployment(&self, id: &DeploymentId) -> Result<Deployment> {
        self.store
            .get_deployment(id)?
            .ok_or_else(|| ControlError::Core(CoreError::NotFound(format!("deployment {id}"))))
    }

    /// List all deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.store.list_deployments()?)
    }

    /// Change a deployment's desired replica count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown deployments.
    pub fn scale_deployment(&self, id: &DeploymentId, replicas: u32) -> Result<Deployment> {
        for attempt in 0..2 {
            let mut deployment = self.get_deployment(id)?;
            deployment.replicas = replicas;
            deployment.updated_at = Utc::now();
            match self.store.update_deployment(&deployment) {
                Ok(updated) => {
                    self.scheduler.nudge(Trigger::WorkloadChanged);
                    return Ok(updated);
                }
                Err(StoreError::Stale { .. }) if attempt == 0 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Store(StoreError::Internal(format!(
            "deployment {id} update kept racing"
        ))))
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// List nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.nodes.list(None)
    }

    /// Cordon a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn cordon_node(&self, id: &NodeId) -> Result<Node> {
        let node = self.nodes.cordon(id)?;
        self.scheduler.nudge(Trigger::NodeChanged);
        Ok(node)
    }

    /// Uncordon a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn uncordon_node(&self, id: &NodeId) -> Result<Node> {
        let node = self.nodes.uncordon(id)?;
        self.scheduler.nudge(Trigger::NodeChanged);
        Ok(node)
    }

    /// Drain a node: close it to placements and evict its pods for
    /// rescheduling elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub fn drain_node(&self, id: &NodeId) -> Result<u32> {
        self.nodes
            .update_status(id, stark_core::NodeStatus::Draining)?;
        let evicted = self.lifecycle.evict_pods_on_node(id, "NodeDrain")?;
        self.scheduler.nudge(Trigger::NodeChanged);
        tracing::info!(node_id = %id, evicted, "Node drained");
        Ok(evicted)
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Get a pod.
    ///
    /// # Errors
    ///
    /// Returns `PodNotFound` for unknown pods.
    pub fn get_pod(&self, id: &PodId) -> Result<Pod> {
        self.store
            .get_pod(id)?
            .ok_or(ControlError::PodNotFound(*id))
    }

    /// List all pods.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.store.list_pods()?)
    }

    /// A pod's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn pod_history(&self, id: &PodId) -> Result<Vec<PodHistoryEntry>> {
        Ok(self.store.list_pod_history(id)?)
    }

    // =========================================================================
    // Network policy
    // =========================================================================

    /// Record an explicit allow rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn allow_traffic(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<NetworkPolicy> {
        self.policy
            .put_rule(source, target, stark_core::state::PolicyAction::Allow, namespace)
    }

    /// Record an explicit deny rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn deny_traffic(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<NetworkPolicy> {
        self.policy
            .put_rule(source, target, stark_core::state::PolicyAction::Deny, namespace)
    }
}
