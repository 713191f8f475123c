//! The pod lifecycle controller.
//!
//! Owns the pod state machine and is the only writer of `Pod.status`. Every
//! transition appends exactly one history entry at the commit point. The
//! controller also implements the scheduler's [`PlacementSink`], translating
//! placement decisions into state writes and agent commands.
//!
//! # State machine
//!
//! ```text
//!  pending ──▶ scheduled ──▶ starting ──▶ running
//!     │            │            │            │
//!     │            │            │            ├──▶ stopping ──▶ stopped
//!     │            ├──▶ failed  ├──▶ failed  └──▶ failed  ──┐
//!     │            │            │                 (stopping │ can fail too)
//!     └──▶ evicted ◀────────────┴───────────────────────────┘
//!              (from any non-terminal state)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

use stark_auth::TokenAuthority;
use stark_core::proto::{Body, PackPayload, PodDeploy, PodRunState, PodStatusUpdate, PodStop};
use stark_core::{CoreError, NodeId, PodId, PodStatus};
use stark_scheduler::{NewPodSpec, PlacementSink, SchedulerHandle, Trigger, AVOID_NODE_ANNOTATION};
use stark_store::{
    HistoryAction, Pod, PodHistoryEntry, PodOwner, Store, StoreError, WorkloadStatus,
};

use crate::error::{ControlError, Result};
use crate::registry::ServiceRegistry;
use crate::session::SessionHub;
use crate::types::ControlConfig;

/// Whether a pod may move from `from` to `to`.
#[must_use]
pub const fn is_valid_transition(from: PodStatus, to: PodStatus) -> bool {
    use PodStatus::{Evicted, Failed, Pending, Running, Scheduled, Starting, Stopped, Stopping};

    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Scheduled, Starting)
            | (Starting, Running)
            // A stop can land before the pod ever reaches running.
            | (Scheduled | Starting | Running, Stopping)
            | (Stopping, Stopped)
            | (Scheduled | Starting | Running | Stopping, Failed)
            | (Pending | Scheduled | Starting | Running | Stopping, Evicted)
    )
}

/// The pod lifecycle controller.
///
/// Cheap to clone; all state lives behind shared handles so command
/// dispatch can run on spawned tasks.
pub struct LifecycleController<S> {
    store: Arc<S>,
    hub: Arc<SessionHub>,
    tokens: Arc<TokenAuthority>,
    services: Arc<ServiceRegistry<S>>,
    scheduler: SchedulerHandle,
    config: ControlConfig,
}

impl<S> Clone for LifecycleController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            hub: Arc::clone(&self.hub),
            tokens: Arc::clone(&self.tokens),
            services: Arc::clone(&self.services),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store + 'static> LifecycleController<S> {
    /// Wire up the controller.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        hub: Arc<SessionHub>,
        tokens: Arc<TokenAuthority>,
        services: Arc<ServiceRegistry<S>>,
        scheduler: SchedulerHandle,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            hub,
            tokens,
            services,
            scheduler,
            config,
        }
    }

    /// Apply a validated transition, appending its history entry.
    ///
    /// A transition to the pod's current status is a no-op and writes no
    /// history. Returns the updated pod.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for moves outside the state machine and
    /// `PodNotFound` for unknown pods.
    pub fn transition(
        &self,
        pod_id: &PodId,
        to: PodStatus,
        reason: &str,
        message: Option<String>,
        actor: Option<&str>,
    ) -> Result<Pod> {
        for attempt in 0..2 {
            let mut pod = self
                .store
                .get_pod(pod_id)?
                .ok_or(ControlError::PodNotFound(*pod_id))?;

            if pod.status == to {
                return Ok(pod);
            }
            if !is_valid_transition(pod.status, to) {
                tracing::warn!(
                    pod_id = %pod_id,
                    from = ?pod.status,
                    to = ?to,
                    reason = %reason,
                    "Rejected illegal transition"
                );
                return Err(ControlError::InvalidTransition {
                    pod_id: *pod_id,
                    from: pod.status,
                    to,
                });
            }

            let previous_status = pod.status;
            let previous_node = pod.node_id;
            pod.status = to;
            pod.status_message = message.clone();
            if to == PodStatus::Failed {
                pod.consecutive_failures += 1;
            }
            pod.updated_at = Utc::now();

            match self.store.update_pod(&pod) {
                Ok(updated) => {
                    self.append_history(PodHistoryEntry {
                        pod_id: *pod_id,
                        action: if to == PodStatus::Evicted {
                            HistoryAction::Evict
                        } else {
                            HistoryAction::Transition
                        },
                        previous_status: Some(previous_status),
                        new_status: to,
                        previous_node_id: previous_node,
                        new_node_id: updated.node_id,
                        previous_version: None,
                        new_version: None,
                        reason: reason.to_string(),
                        message: message.clone().unwrap_or_default(),
                        actor: actor.map(str::to_string),
                        metadata: BTreeMap::new(),
                        timestamp: updated.updated_at,
                    });
                    self.sync_registry(&updated, previous_status);
                    if to.is_terminal() {
                        self.scheduler.nudge(Trigger::PodTerminal);
                    }
                    tracing::info!(
                        pod_id = %pod_id,
                        from = ?previous_status,
                        to = ?to,
                        reason = %reason,
                        "Pod transition"
                    );
                    return Ok(updated);
                }
                Err(StoreError::Stale { .. }) if attempt == 0 => {
                    tracing::debug!(pod_id = %pod_id, "Stale pod write, retrying transition");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Store(StoreError::Internal(format!(
            "pod {pod_id} transition kept racing"
        ))))
    }

    /// Keep the service registry in step with a pod transition.
    fn sync_registry(&self, pod: &Pod, previous: PodStatus) {
        let Some(service_id) = pod.owner.service_id() else {
            return;
        };
        let Some(node_id) = pod.node_id else {
            return;
        };
        match pod.status {
            PodStatus::Running => {
                self.services
                    .add_pod_endpoint(service_id, pod.id, node_id, PodStatus::Running);
            }
            PodStatus::Stopping | PodStatus::Stopped | PodStatus::Failed | PodStatus::Evicted
                if previous == PodStatus::Running || previous == PodStatus::Stopping =>
            {
                self.services.remove_pod_endpoint(service_id, &pod.id);
            }
            _ => {}
        }
    }

    fn append_history(&self, entry: PodHistoryEntry) {
        if let Err(e) = self.store.append_pod_history(&entry) {
            tracing::error!(pod_id = %entry.pod_id, error = %e, "History append failed");
        }
    }

    /// Handle a `pod:status` frame from the pod's hosting agent.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the pod is not assigned to the reporting node,
    /// and transition errors for out-of-machine reports.
    pub fn handle_agent_pod_status(
        &self,
        node_id: &NodeId,
        update: &PodStatusUpdate,
    ) -> Result<()> {
        let pod = self
            .store
            .get_pod(&update.pod_id)?
            .ok_or(ControlError::PodNotFound(update.pod_id))?;

        if pod.node_id != Some(*node_id) {
            return Err(ControlError::Core(CoreError::Invalid(format!(
                "pod {} is not assigned to node {node_id}",
                update.pod_id
            ))));
        }

        self.transition(
            &update.pod_id,
            update.status,
            "AgentReport",
            update.message.clone(),
            Some("agent"),
        )?;
        Ok(())
    }

    /// Reconcile per-pod liveness reported in a heartbeat: a pod the agent
    /// says is dead while the store says it should be up has crashed.
    pub fn reconcile_heartbeat_pods(&self, node_id: &NodeId, pod_statuses: &[PodRunState]) {
        for report in pod_statuses {
            if report.running {
                continue;
            }
            let Ok(Some(pod)) = self.store.get_pod(&report.pod_id) else {
                continue;
            };
            if pod.node_id != Some(*node_id) {
                continue;
            }
            if matches!(pod.status, PodStatus::Starting | PodStatus::Running) {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| "isolate died".to_string());
                if let Err(e) = self.transition(
                    &pod.id,
                    PodStatus::Failed,
                    "CrashDetected",
                    Some(message),
                    Some("agent-heartbeat"),
                ) {
                    tracing::warn!(pod_id = %pod.id, error = %e, "Crash transition failed");
                }
            }
        }
    }

    /// Fail every placed pod on a node; used when the node is `Lost`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod listing fails; individual transition
    /// failures are logged.
    pub fn fail_pods_on_node(&self, node_id: &NodeId, reason: &str) -> Result<u32> {
        let mut failed = 0;
        for pod in self.store.list_pods_by_node(node_id)? {
            if pod.status.requires_node() {
                match self.transition(
                    &pod.id,
                    PodStatus::Failed,
                    reason,
                    Some(format!("node {node_id} lost")),
                    None,
                ) {
                    Ok(_) => failed += 1,
                    Err(e) => {
                        tracing::warn!(pod_id = %pod.id, error = %e, "Node-loss transition failed");
                    }
                }
            }
        }
        if failed > 0 {
            self.scheduler.nudge(Trigger::NodeChanged);
        }
        Ok(failed)
    }

    /// Evict every placed pod on a node; used by drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod listing fails.
    pub fn evict_pods_on_node(&self, node_id: &NodeId, reason: &str) -> Result<u32> {
        let mut evicted = 0;
        for pod in self.store.list_pods_by_node(node_id)? {
            if pod.status.requires_node() {
                match self.transition(&pod.id, PodStatus::Evicted, reason, None, None) {
                    Ok(_) => {
                        self.send_stop_command(&pod, reason, self.config.grace_period_ms);
                        evicted += 1;
                    }
                    Err(e) => {
                        tracing::warn!(pod_id = %pod.id, error = %e, "Drain eviction failed");
                    }
                }
            }
        }
        Ok(evicted)
    }

    /// Fire a `pod:stop` at the pod's agent without waiting for the reply.
    fn send_stop_command(&self, pod: &Pod, reason: &str, grace_period_ms: u64) {
        let Some(node_id) = pod.node_id else {
            return;
        };
        let body = Body::PodStop(PodStop {
            pod_id: pod.id,
            reason: reason.to_string(),
            grace_period_ms,
        });
        if let Err(e) = self.hub.send_event(&node_id, body) {
            tracing::debug!(
                pod_id = %pod.id,
                node_id = %node_id,
                error = %e,
                "Stop command not delivered"
            );
        }
    }

    /// Re-dispatch deploy commands for scheduled pods of a node; called
    /// when its session (re)connects.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod listing fails.
    pub fn redeliver_scheduled(&self, node_id: &NodeId) -> Result<()> {
        for pod in self.store.list_pods_by_node(node_id)? {
            if pod.status == PodStatus::Scheduled {
                tracing::info!(pod_id = %pod.id, node_id = %node_id, "Redelivering deploy");
                self.dispatch_deploy(pod, *node_id);
            }
        }
        Ok(())
    }

    /// Build and dispatch the deploy command for a freshly scheduled pod on
    /// a spawned task; a dispatch failure fails the pod.
    ///
    /// With no live session the deploy is deferred: it is redelivered on
    /// reconnect, or the pod is failed over by the liveness monitor.
    fn dispatch_deploy(&self, pod: Pod, node_id: NodeId) {
        if !self.hub.is_connected(&node_id) {
            tracing::warn!(
                pod_id = %pod.id,
                node_id = %node_id,
                "No session for node, deploy deferred"
            );
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.deploy_once(&pod, &node_id).await;
            if let Err(e) = result {
                tracing::warn!(pod_id = %pod.id, error = %e, "Deploy dispatch failed");
                if let Err(e) = this.transition(
                    &pod.id,
                    PodStatus::Failed,
                    "DeployDispatchFailed",
                    Some(e.to_string()),
                    None,
                ) {
                    tracing::warn!(pod_id = %pod.id, error = %e, "Failure transition failed");
                }
            }
        });
    }

    async fn deploy_once(&self, pod: &Pod, node_id: &NodeId) -> Result<()> {
        let pack = self
            .store
            .get_pack(&pod.pack_id)?
            .ok_or_else(|| CoreError::NotFound(format!("pack {}", pod.pack_id)))?;
        let token_pair = self.tokens.mint_pod_token(&pod.id)?;

        let payload = PodDeploy {
            pod_id: pod.id,
            service_id: pod.owner.service_id().cloned(),
            pack: PackPayload {
                pack_id: pack.id,
                name: pack.name.clone(),
                version: pack.version.clone(),
                bundle: PackPayload::encode_bundle(&pack.bundle),
                enable_ephemeral: pack.enable_ephemeral,
                metadata: pack.metadata.clone(),
            },
            capabilities: pack.granted_capabilities.clone(),
            pod_token: token_pair.token,
            refresh_token: token_pair.refresh_token,
            limits: pod.resource_limits,
        };

        self.hub
            .request(node_id, Body::PodDeploy(payload))
            .await
            .map_err(ControlError::Core)?;
        Ok(())
    }

    /// Graceful stop of one pod, outside the scheduler path (service
    /// deletion, operator action).
    ///
    /// # Errors
    ///
    /// Returns transition errors.
    pub fn stop_pod_now(&self, pod_id: &PodId, reason: &str) -> Result<()> {
        self.stop_pod_inner(pod_id, reason)
    }

    /// Graceful stop of one pod: transition plus the agent command.
    ///
    /// Pending pods have nothing running anywhere and are evicted instead.
    fn stop_pod_inner(&self, pod_id: &PodId, reason: &str) -> Result<()> {
        let pod = self
            .store
            .get_pod(pod_id)?
            .ok_or(ControlError::PodNotFound(*pod_id))?;

        if pod.status == PodStatus::Pending {
            self.transition(pod_id, PodStatus::Evicted, reason, None, None)?;
            return Ok(());
        }

        let updated = self.transition(pod_id, PodStatus::Stopping, reason, None, None)?;
        self.send_stop_command(&updated, reason, self.config.grace_period_ms);
        Ok(())
    }

    fn update_workload_status(&self, owner: &PodOwner, apply_degraded: bool) -> Result<()> {
        match owner {
            PodOwner::Service(id) => {
                let Some(mut service) = self.store.get_service(id)? else {
                    return Ok(());
                };
                let wanted = if apply_degraded {
                    WorkloadStatus::Degraded
                } else {
                    WorkloadStatus::Active
                };
                if service.status != wanted {
                    service.status = wanted;
                    service.updated_at = Utc::now();
                    self.store.update_service(&service)?;
                }
            }
            PodOwner::Deployment(id) => {
                let Some(mut deployment) = self.store.get_deployment(id)? else {
                    return Ok(());
                };
                let wanted = if apply_degraded {
                    WorkloadStatus::Degraded
                } else {
                    WorkloadStatus::Active
                };
                if deployment.status != wanted {
                    deployment.status = wanted;
                    deployment.updated_at = Utc::now();
                    self.store.update_deployment(&deployment)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store + 'static> PlacementSink for LifecycleController<S> {
    async fn create_pod(&self, spec: NewPodSpec) -> stark_core::Result<PodId> {
        let now = Utc::now();
        let id = PodId::generate();
        let mut annotations = BTreeMap::new();
        if let Some(avoid) = spec.avoid_node {
            annotations.insert(AVOID_NODE_ANNOTATION.to_string(), avoid.to_string());
        }
        let pod = Pod {
            id,
            owner: spec.owner,
            node_id: None,
            pack_id: spec.pack_id,
            pack_version: spec.pack_version,
            namespace: spec.namespace,
            status: PodStatus::Pending,
            status_message: None,
            resource_requests: spec.requests,
            resource_limits: spec.limits,
            labels: spec.labels,
            annotations,
            priority: spec.priority,
            consecutive_failures: spec.consecutive_failures,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.store.put_pod(&pod).map_err(CoreError::from)?;
        self.append_history(PodHistoryEntry {
            pod_id: id,
            action: HistoryAction::Create,
            previous_status: None,
            new_status: PodStatus::Pending,
            previous_node_id: None,
            new_node_id: None,
            previous_version: None,
            new_version: Some(pod.pack_version.clone()),
            reason: spec.reason,
            message: String::new(),
            actor: Some("scheduler".to_string()),
            metadata: BTreeMap::new(),
            timestamp: now,
        });
        Ok(id)
    }

    async fn assign_pod(&self, pod_id: &PodId, node_id: &NodeId) -> stark_core::Result<()> {
        let mut pod = self
            .store
            .get_pod(pod_id)
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::pod_not_found(pod_id))?;

        if !is_valid_transition(pod.status, PodStatus::Scheduled) {
            return Err(CoreError::Conflict(format!(
                "pod {pod_id}: cannot assign from {:?}",
                pod.status
            )));
        }

        let previous_status = pod.status;
        pod.node_id = Some(*node_id);
        pod.status = PodStatus::Scheduled;
        pod.status_message = None;
        pod.updated_at = Utc::now();
        let updated = self.store.update_pod(&pod).map_err(CoreError::from)?;

        self.append_history(PodHistoryEntry {
            pod_id: *pod_id,
            action: HistoryAction::Assign,
            previous_status: Some(previous_status),
            new_status: PodStatus::Scheduled,
            previous_node_id: None,
            new_node_id: Some(*node_id),
            previous_version: None,
            new_version: None,
            reason: "Placed".to_string(),
            message: String::new(),
            actor: Some("scheduler".to_string()),
            metadata: BTreeMap::new(),
            timestamp: updated.updated_at,
        });

        tracing::info!(pod_id = %pod_id, node_id = %node_id, "Pod assigned");
        self.dispatch_deploy(updated, *node_id);
        Ok(())
    }

    async fn stop_pod(&self, pod_id: &PodId, reason: &str) -> stark_core::Result<()> {
        self.stop_pod_inner(pod_id, reason).map_err(CoreError::from)
    }

    async fn rollout_pod(&self, pod_id: &PodId, new_version: &str) -> stark_core::Result<()> {
        let pod = self
            .store
            .get_pod(pod_id)
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::pod_not_found(pod_id))?;
        let previous_version = pod.pack_version.clone();
        let previous_status = pod.status;

        self.stop_pod_inner(pod_id, "Rollout").map_err(CoreError::from)?;

        // The version change is what the rollout is about; record it on top
        // of the stop transition. A still-pending outdated pod is evicted
        // rather than stopped, so read the status the stop landed on.
        let after = self
            .store
            .get_pod(pod_id)
            .map_err(CoreError::from)?
            .map_or(PodStatus::Stopping, |p| p.status);
        self.append_history(PodHistoryEntry {
            pod_id: *pod_id,
            action: HistoryAction::VersionChange,
            previous_status: Some(previous_status),
            new_status: after,
            previous_node_id: pod.node_id,
            new_node_id: pod.node_id,
            previous_version: Some(previous_version),
            new_version: Some(new_version.to_string()),
            reason: "Rollout".to_string(),
            message: String::new(),
            actor: Some("scheduler".to_string()),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn evict_pod(&self, pod_id: &PodId, reason: &str) -> stark_core::Result<()> {
        let pod = self
            .store
            .get_pod(pod_id)
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::pod_not_found(pod_id))?;
        self.transition(pod_id, PodStatus::Evicted, reason, None, None)
            .map_err(CoreError::from)?;
        self.send_stop_command(&pod, reason, self.config.grace_period_ms.min(2_000));
        Ok(())
    }

    async fn mark_schedule_failed(&self, pod_id: &PodId, message: &str) -> stark_core::Result<()> {
        let mut pod = self
            .store
            .get_pod(pod_id)
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::pod_not_found(pod_id))?;
        pod.consecutive_failures += 1;
        pod.status_message = Some(message.to_string());
        pod.updated_at = Utc::now();
        self.store.update_pod(&pod).map_err(CoreError::from)?;
        tracing::debug!(pod_id = %pod_id, message = %message, "Pod unschedulable this cycle");
        Ok(())
    }

    async fn set_workload_degraded(
        &self,
        owner: &PodOwner,
        degraded: bool,
    ) -> stark_core::Result<()> {
        self.update_workload_status(owner, degraded)
            .map_err(CoreError::from)
    }

    async fn record_replica_counts(
        &self,
        owner: &PodOwner,
        ready: u32,
        available: u32,
    ) -> stark_core::Result<()> {
        if let PodOwner::Service(id) = owner {
            let Some(mut service) = self.store.get_service(id).map_err(CoreError::from)? else {
                return Ok(());
            };
            if service.ready_replicas != ready || service.available_replicas != available {
                service.ready_replicas = ready;
                service.available_replicas = available;
                self.store
                    .update_service(&service)
                    .map_err(CoreError::from)?;
            }
        }
        Ok(())
    }
}
