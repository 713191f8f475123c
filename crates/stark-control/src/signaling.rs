//! The signaling hub: relays peer-channel negotiation frames.
//!
//! Offers, answers, and ICE candidates travel through the orchestrator so
//! it can authenticate the sender and enforce policy before two agents talk
//! directly. The hub stores nothing beyond session bookkeeping; the frame
//! payload is opaque.

use std::sync::Arc;

use stark_auth::{TokenAuthority, TokenVerifier};
use stark_core::proto::{Body, Signal};
use stark_core::{CoreError, NodeId};
use stark_store::{PodOwner, Store};

use crate::error::{ControlError, Result};
use crate::policy::PolicyEngine;
use crate::session::SessionHub;

/// Which signaling frame is being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Connection offer with the initiator's candidates.
    Offer,
    /// Answer with the responder's candidates.
    Answer,
    /// Additional candidates for an in-flight negotiation.
    Ice,
}

impl SignalKind {
    fn body(self, signal: Signal) -> Body {
        match self {
            Self::Offer => Body::SignalOffer(signal),
            Self::Answer => Body::SignalAnswer(signal),
            Self::Ice => Body::SignalIce(signal),
        }
    }
}

/// The signaling relay.
pub struct SignalingHub<S> {
    sessions: Arc<SessionHub>,
    store: Arc<S>,
    tokens: Arc<TokenAuthority>,
    policy: Arc<PolicyEngine<S>>,
}

impl<S: Store> SignalingHub<S> {
    /// Wire up the hub.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionHub>,
        store: Arc<S>,
        tokens: Arc<TokenAuthority>,
        policy: Arc<PolicyEngine<S>>,
    ) -> Self {
        Self {
            sessions,
            store,
            tokens,
            policy,
        }
    }

    /// Verify and relay one signaling frame.
    ///
    /// Checks, in order: the signature is a valid token for the claimed
    /// source pod, the target pod is assigned to a known node, and policy
    /// permits source service → target service. Nothing is forwarded unless
    /// every check passes.
    ///
    /// Returns the node the frame was forwarded to.
    ///
    /// # Errors
    ///
    /// `Auth` for signature mismatches, `PodNotFound`/`Invalid` for missing
    /// or unplaced pods, `PolicyDenied` when the flow is not allowed, and
    /// `NoSession` when the destination node has no live session.
    pub async fn relay(&self, kind: SignalKind, signal: Signal) -> Result<NodeId> {
        let token_pod = self.tokens.verify_pod(&signal.signature).await?;
        if token_pod != signal.from_pod_id {
            return Err(ControlError::Core(CoreError::Auth(format!(
                "signature is for pod {token_pod}, frame claims {}",
                signal.from_pod_id
            ))));
        }

        let from_pod = self
            .store
            .get_pod(&signal.from_pod_id)?
            .ok_or(ControlError::PodNotFound(signal.from_pod_id))?;
        let PodOwner::Service(source_service) = &from_pod.owner else {
            return Err(ControlError::Core(CoreError::Invalid(
                "only service pods participate in the overlay".to_string(),
            )));
        };

        let to_pod = self
            .store
            .get_pod(&signal.to_pod_id)?
            .ok_or(ControlError::PodNotFound(signal.to_pod_id))?;
        let Some(target_node) = to_pod.node_id else {
            return Err(ControlError::Core(CoreError::Invalid(format!(
                "pod {} is not assigned to a node",
                signal.to_pod_id
            ))));
        };
        let PodOwner::Service(target_service) = &to_pod.owner else {
            return Err(ControlError::Core(CoreError::Invalid(
                "target pod is not overlay-addressable".to_string(),
            )));
        };

        if !self
            .policy
            .is_allowed(source_service, target_service, to_pod.namespace)?
        {
            tracing::info!(
                source = %source_service,
                target = %target_service,
                kind = ?kind,
                "Signal blocked by policy"
            );
            return Err(ControlError::PolicyDenied {
                source_service: source_service.clone(),
                target_service: target_service.clone(),
            });
        }

        self.sessions
            .send_event(&target_node, kind.body(signal))
            .map_err(|_| ControlError::NoSession(target_node))?;

        tracing::debug!(
            target_node = %target_node,
            kind = ?kind,
            "Signal relayed"
        );
        Ok(target_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_node, seed_pack, seed_service, seed_pending_pod};
    use stark_auth::AuthConfig;
    use stark_core::proto::Frame;
    use stark_core::{PodId, PodStatus};
    use stark_store::MemStore;
    use std::time::Duration;

    struct Rig {
        hub: SignalingHub<MemStore>,
        sessions: Arc<SessionHub>,
        store: Arc<MemStore>,
        tokens: Arc<TokenAuthority>,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemStore::new());
        let sessions = Arc::new(SessionHub::new(Duration::from_millis(200)));
        let tokens = Arc::new(TokenAuthority::new(AuthConfig::with_secret("sig-test")));
        let policy = Arc::new(PolicyEngine::new(Arc::clone(&store)));
        let hub = SignalingHub::new(
            Arc::clone(&sessions),
            Arc::clone(&store),
            Arc::clone(&tokens),
            policy,
        );
        Rig {
            hub,
            sessions,
            store,
            tokens,
        }
    }

    /// Seed service `name` with one pod placed on a fresh node.
    fn placed_pod(rig: &Rig, name: &str, node_seed: u64) -> (PodId, stark_core::NodeId) {
        let pack = seed_pack(&rig.store);
        let node_id = seed_node(&rig.store, node_seed);
        seed_service(&rig.store, name, 1, &pack);
        let pod_id = seed_pending_pod(&rig.store, name, &pack);
        let mut pod = rig.store.get_pod(&pod_id).unwrap().unwrap();
        pod.node_id = Some(node_id);
        pod.status = PodStatus::Running;
        rig.store.update_pod(&pod).unwrap();
        (pod_id, node_id)
    }

    fn signal(rig: &Rig, from: PodId, to: PodId) -> Signal {
        Signal {
            from_pod_id: from,
            to_pod_id: to,
            data: serde_json::json!({"addrs": ["10.0.0.1:7700"]}),
            signature: rig.tokens.mint_pod_token(&from).unwrap().token,
        }
    }

    #[tokio::test]
    async fn relays_allowed_offer_to_target_node() {
        let rig = rig();
        let (from, _) = placed_pod(&rig, "a", 1);
        let (to, target_node) = {
            // Second service on a second node, same pack.
            let pack = rig.store.list_packs().unwrap().remove(0);
            let node_id = seed_node(&rig.store, 2);
            seed_service(&rig.store, "b", 1, &pack);
            let pod_id = seed_pending_pod(&rig.store, "b", &pack);
            let mut pod = rig.store.get_pod(&pod_id).unwrap().unwrap();
            pod.node_id = Some(node_id);
            pod.status = PodStatus::Running;
            rig.store.update_pod(&pod).unwrap();
            (pod_id, node_id)
        };
        let mut rx = rig.sessions.register_session(target_node);

        let forwarded_to = rig
            .hub
            .relay(SignalKind::Offer, signal(&rig, from, to))
            .await
            .unwrap();
        assert_eq!(forwarded_to, target_node);

        let frame: Frame = rx.try_recv().unwrap();
        assert!(matches!(frame.body, Body::SignalOffer(_)));
    }

    #[tokio::test]
    async fn policy_denial_forwards_nothing() {
        let rig = rig();
        let (from, _) = placed_pod(&rig, "a", 1);
        let (to, target_node) = {
            let pack = rig.store.list_packs().unwrap().remove(0);
            let node_id = seed_node(&rig.store, 2);
            let mut service = seed_service(&rig.store, "b", 1, &pack);
            service.visibility = stark_core::Visibility::Private;
            service.allowed_sources = Vec::new();
            rig.store.update_service(&service).unwrap();
            let pod_id = seed_pending_pod(&rig.store, "b", &pack);
            let mut pod = rig.store.get_pod(&pod_id).unwrap().unwrap();
            pod.node_id = Some(node_id);
            pod.status = PodStatus::Running;
            rig.store.update_pod(&pod).unwrap();
            (pod_id, node_id)
        };
        let mut rx = rig.sessions.register_session(target_node);

        let result = rig.hub.relay(SignalKind::Offer, signal(&rig, from, to)).await;
        assert!(matches!(result, Err(ControlError::PolicyDenied { .. })));
        assert!(rx.try_recv().is_err(), "no frame reached the session");
    }

    #[tokio::test]
    async fn forged_signature_rejected() {
        let rig = rig();
        let (from, _) = placed_pod(&rig, "a", 1);
        let (to, _) = {
            let pack = rig.store.list_packs().unwrap().remove(0);
            let node_id = seed_node(&rig.store, 2);
            seed_service(&rig.store, "b", 1, &pack);
            let pod_id = seed_pending_pod(&rig.store, "b", &pack);
            let mut pod = rig.store.get_pod(&pod_id).unwrap().unwrap();
            pod.node_id = Some(node_id);
            rig.store.update_pod(&pod).unwrap();
            (pod_id, node_id)
        };

        // Token minted for a different pod.
        let imposter = PodId::generate_deterministic(99);
        let mut forged = signal(&rig, from, to);
        forged.signature = rig.tokens.mint_pod_token(&imposter).unwrap().token;

        let result = rig.hub.relay(SignalKind::Ice, forged).await;
        assert!(matches!(
            result,
            Err(ControlError::Core(CoreError::Auth(_)))
        ));
    }

    #[tokio::test]
    async fn unplaced_target_rejected() {
        let rig = rig();
        let (from, _) = placed_pod(&rig, "a", 1);
        let to = {
            let pack = rig.store.list_packs().unwrap().remove(0);
            seed_service(&rig.store, "b", 1, &pack);
            // Pod exists but was never assigned a node.
            seed_pending_pod(&rig.store, "b", &pack)
        };

        let result = rig.hub.relay(SignalKind::Answer, signal(&rig, from, to)).await;
        assert!(matches!(
            result,
            Err(ControlError::Core(CoreError::Invalid(_)))
        ));
    }
}
