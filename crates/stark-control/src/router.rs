//! Routing of in-session frames from agents to control-plane components.
//!
//! The gateway owns the transport and the auth/register handshake; every
//! frame after that flows through [`Orchestrator::handle_frame`], which
//! dispatches to the registries, lifecycle controller, signaling hub, and
//! pod-group store, and produces the correlated reply when one is due.

use stark_core::proto::{
    Body, Frame, GroupRoster, PolicyDecision, RegisterAck, ResolvedTarget,
};
use stark_core::{CoreError, CorrelationId, NodeId};
use stark_store::{PodOwner, Store};

use crate::error::{ControlError, Result};
use crate::registry::SelectStrategy;
use crate::service::Orchestrator;
use crate::signaling::SignalKind;

impl<S: Store + 'static> Orchestrator<S> {
    /// Handle the `register` frame that completes a session handshake.
    ///
    /// Registers (or refreshes) the node and returns the ack payload. The
    /// transport must call [`Orchestrator::session_established`] once the
    /// hub session is installed so deferred deploys can be redelivered.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn handle_register(
        &self,
        registration: &stark_core::proto::Register,
    ) -> Result<RegisterAck> {
        let node = self.nodes.register(registration)?;
        Ok(RegisterAck {
            node_id: node.id,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        })
    }

    /// Called by the transport once a node's hub session is live: deploys
    /// deferred while the node was away are redelivered now.
    pub fn session_established(&self, node_id: &NodeId) {
        if let Err(e) = self.lifecycle.redeliver_scheduled(node_id) {
            tracing::warn!(node_id = %node_id, error = %e, "Deploy redelivery failed");
        }
    }

    /// Handle one in-session frame from `node_id`.
    ///
    /// Returns the reply frame when the incoming frame was a correlated
    /// request; fire-and-forget frames and reply frames return `None`.
    pub async fn handle_frame(&self, node_id: &NodeId, frame: Frame) -> Option<Frame> {
        let correlation_id = frame.correlation_id;
        let result = self.dispatch(node_id, frame).await;

        match (correlation_id, result) {
            (Some(corr), Ok(Some(value))) => {
                Some(Frame::reply_ok(corr, &value).unwrap_or_else(|e| Frame::reply_err(corr, &e)))
            }
            (Some(corr), Ok(None)) => {
                Some(Frame::reply_ok(corr, &serde_json::json!({})).unwrap_or_else(|e| {
                    Frame::reply_err(corr, &e)
                }))
            }
            (Some(corr), Err(e)) => {
                let core: CoreError = e.into();
                Some(Frame::reply_err(corr, &core))
            }
            (None, Err(e)) => {
                tracing::warn!(node_id = %node_id, error = %e, "Uncorrelated frame failed");
                None
            }
            (None, Ok(_)) => None,
        }
    }

    /// Dispatch a frame body; `Some(value)` becomes the `ok` payload.
    async fn dispatch(
        &self,
        node_id: &NodeId,
        frame: Frame,
    ) -> Result<Option<serde_json::Value>> {
        match frame.body {
            Body::Ok { value } => {
                self.resolve(node_id, frame.correlation_id, Ok(value));
                Ok(None)
            }
            Body::Error { code, message } => {
                self.resolve(
                    node_id,
                    frame.correlation_id,
                    Err(CoreError::from_wire(&code, &message)),
                );
                Ok(None)
            }

            Body::Heartbeat(heartbeat) => {
                self.nodes.heartbeat(node_id, heartbeat.used_resources)?;
                self.lifecycle
                    .reconcile_heartbeat_pods(node_id, &heartbeat.pod_statuses);
                Ok(None)
            }

            Body::PodStatusUpdate(update) => {
                self.lifecycle.handle_agent_pod_status(node_id, &update)?;
                // A terminated pod's memberships die with it.
                if update.status.is_terminal() {
                    self.groups.leave_all(&update.pod_id);
                }
                Ok(None)
            }

            Body::SignalOffer(signal) => {
                self.signaling.relay(SignalKind::Offer, signal).await?;
                Ok(None)
            }
            Body::SignalAnswer(signal) => {
                self.signaling.relay(SignalKind::Answer, signal).await?;
                Ok(None)
            }
            Body::SignalIce(signal) => {
                self.signaling.relay(SignalKind::Ice, signal).await?;
                Ok(None)
            }

            Body::GroupJoin(join) => {
                self.assert_pod_on_node(node_id, &join.pod_id)?;
                let ttl_ms = if join.ttl_ms == 0 {
                    self.config.group_ttl_ms
                } else {
                    join.ttl_ms
                };
                let members = self.groups.join(
                    &join.group_id,
                    join.pod_id,
                    *node_id,
                    ttl_ms,
                    join.metadata,
                )?;
                Ok(Some(serde_json::to_value(GroupRoster {
                    group_id: join.group_id,
                    members,
                })
                .map_err(|e| CoreError::Internal(e.to_string()))?))
            }
            Body::GroupLeave(leave) => {
                let left = self.groups.leave(&leave.group_id, &leave.pod_id);
                Ok(Some(serde_json::json!({ "left": left })))
            }
            Body::GroupMembers(request) => {
                let members = self.groups.list(&request.group_id);
                Ok(Some(serde_json::to_value(GroupRoster {
                    group_id: request.group_id,
                    members,
                })
                .map_err(|e| CoreError::Internal(e.to_string()))?))
            }

            Body::ResolveTarget(resolve) => {
                let value = self.resolve_target(node_id, &resolve)?;
                Ok(Some(value))
            }
            Body::PolicyCheck(check) => {
                let source_service = self.source_service_of(&check.from_pod_id)?;
                let namespace = self
                    .store
                    .get_service(&check.to_service)?
                    .map(|s| s.namespace)
                    .unwrap_or_default();
                let allowed = self
                    .policy
                    .is_allowed(&source_service, &check.to_service, namespace)?;
                Ok(Some(
                    serde_json::to_value(PolicyDecision { allowed })
                        .map_err(|e| CoreError::Internal(e.to_string()))?,
                ))
            }

            Body::Auth { .. } | Body::Register(_) => Err(ControlError::Core(CoreError::Invalid(
                "handshake frame after session establishment".to_string(),
            ))),
            Body::PodDeploy(_) | Body::PodStop(_) => Err(ControlError::Core(CoreError::Invalid(
                "orchestrator-bound frame from agent".to_string(),
            ))),
        }
    }

    /// Resolve a target pod for a service call from a pod on `node_id`.
    fn resolve_target(
        &self,
        node_id: &NodeId,
        resolve: &stark_core::proto::ResolveTarget,
    ) -> Result<serde_json::Value> {
        self.assert_pod_on_node(node_id, &resolve.pod_id)?;
        let source_service = self.source_service_of(&resolve.pod_id)?;

        // Policy is enforced here as well as at the signaling hub and the
        // calling agent; resolution must not leak topology for forbidden
        // flows.
        let namespace = self
            .store
            .get_service(&resolve.service_id)?
            .map(|s| s.namespace)
            .unwrap_or_default();
        if !self
            .policy
            .is_allowed(&source_service, &resolve.service_id, namespace)?
        {
            return Err(ControlError::PolicyDenied {
                source_service,
                target_service: resolve.service_id.clone(),
            });
        }

        let strategy = if resolve.sticky {
            SelectStrategy::StickyRandomFirst
        } else {
            SelectStrategy::Random
        };
        let endpoint = self.services.select_target(&resolve.service_id, strategy)?;
        let peer_addr = self
            .store
            .get_node(&endpoint.node_id)?
            .and_then(|n| n.peer_addr);

        serde_json::to_value(ResolvedTarget {
            service_id: resolve.service_id.clone(),
            pod_id: endpoint.pod_id,
            node_id: endpoint.node_id,
            peer_addr,
            ttl_ms: self.config.target_ttl_ms,
        })
        .map_err(|e| ControlError::Core(CoreError::Internal(e.to_string())))
    }

    /// The service a pod calls out as; only service pods join the overlay.
    fn source_service_of(&self, pod_id: &stark_core::PodId) -> Result<stark_core::ServiceId> {
        let pod = self
            .store
            .get_pod(pod_id)?
            .ok_or(ControlError::PodNotFound(*pod_id))?;
        match pod.owner {
            PodOwner::Service(id) => Ok(id),
            PodOwner::Deployment(_) => Err(ControlError::Core(CoreError::Invalid(format!(
                "pod {pod_id} belongs to a deployment and has no overlay identity"
            )))),
        }
    }

    /// A pod-scoped request must come from the pod's own node.
    fn assert_pod_on_node(&self, node_id: &NodeId, pod_id: &stark_core::PodId) -> Result<()> {
        let pod = self
            .store
            .get_pod(pod_id)?
            .ok_or(ControlError::PodNotFound(*pod_id))?;
        if pod.node_id != Some(*node_id) {
            return Err(ControlError::Core(CoreError::Invalid(format!(
                "pod {pod_id} is not hosted on node {node_id}"
            ))));
        }
        Ok(())
    }

    fn resolve(
        &self,
        node_id: &NodeId,
        correlation_id: Option<CorrelationId>,
        result: stark_core::Result<serde_json::Value>,
    ) {
        let Some(corr) = correlation_id else {
            tracing::debug!(node_id = %node_id, "Reply frame without correlation id");
            return;
        };
        self.sessions.resolve_reply(node_id, corr, result);
    }
}
