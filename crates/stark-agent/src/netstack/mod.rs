//! The agent network stack.
//!
//! Every pack-issued call to a `*.internal` URL comes through here: policy
//! check (cached decision or a hub round-trip), sticky target resolution,
//! peer-channel management, and envelope correlation. Inbound envelopes are
//! routed to the named local pod.

pub mod cache;
pub mod correlator;
pub mod peer;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stark_core::envelope::{PeerFrame, RequestEnvelope, ResponseEnvelope};
use stark_core::overlay::VirtualTarget;
use stark_core::proto::{Body, PolicyCheck, PolicyDecision, ResolveTarget, ResolvedTarget};
use stark_core::{CoreError, EnvelopeId, NodeId, PodId, ServiceId};

use crate::config::AgentConfig;
use crate::session::ControlChannel;
use cache::{CachedTarget, TargetCache};
use correlator::EnvelopeCorrelator;
use peer::PeerManager;

/// How long a policy verdict may be reused before asking the hub again,
/// in seconds.
const POLICY_CACHE_TTL_SECS: i64 = 30;

/// Routes inbound envelopes to the pod they name.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Serve one request envelope addressed to a local pod.
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope;
}

/// Pod tokens held by this agent, keyed by pod.
#[derive(Default)]
pub struct PodTokens {
    tokens: Mutex<HashMap<PodId, String>>,
}

impl PodTokens {
    /// Create an empty token table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The token for a pod, if we hold one.
    #[must_use]
    pub fn get(&self, pod_id: &PodId) -> Option<String> {
        self.tokens.lock().get(pod_id).cloned()
    }

    /// Install or replace a pod's token.
    pub fn set(&self, pod_id: PodId, token: String) {
        self.tokens.lock().insert(pod_id, token);
    }

    /// Drop a pod's token.
    pub fn remove(&self, pod_id: &PodId) {
        self.tokens.lock().remove(pod_id);
    }
}

struct PolicyVerdict {
    allowed: bool,
    expires_at: chrono::DateTime<Utc>,
}

/// The per-agent network stack.
pub struct NetworkStack {
    session: Arc<dyn ControlChannel>,
    peers: Arc<PeerManager>,
    cache: TargetCache,
    correlator: Arc<EnvelopeCorrelator>,
    inbound: Arc<dyn InboundHandler>,
    pod_tokens: Arc<PodTokens>,
    policy_cache: Mutex<HashMap<(PodId, ServiceId), PolicyVerdict>>,
    config: Arc<AgentConfig>,
    self_node: NodeId,
}

impl NetworkStack {
    /// Wire up the stack for a connected session.
    #[must_use]
    pub fn new(
        self_node: NodeId,
        session: Arc<dyn ControlChannel>,
        config: Arc<AgentConfig>,
        inbound: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let correlator = Arc::new(EnvelopeCorrelator::new());
        let pod_tokens = Arc::new(PodTokens::new());
        let peers = PeerManager::new(
            self_node,
            Arc::clone(&session),
            Arc::clone(&config),
            Arc::clone(&correlator),
            Arc::clone(&inbound),
            Arc::clone(&pod_tokens),
        );
        Arc::new(Self {
            session,
            peers,
            cache: TargetCache::new(),
            correlator,
            inbound,
            pod_tokens,
            policy_cache: Mutex::new(HashMap::new()),
            config,
            self_node,
        })
    }

    /// The peer manager, for the listener task and signal routing.
    #[must_use]
    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Install a pod this agent hosts: its token authenticates outbound
    /// signaling.
    pub fn register_pod(&self, pod_id: PodId, token: String) {
        self.pod_tokens.set(pod_id, token);
    }

    /// Remove a terminated pod's stack state.
    pub fn unregister_pod(&self, pod_id: &PodId) {
        self.pod_tokens.remove(pod_id);
        self.cache.forget_source(pod_id);
        let mut policies = self.policy_cache.lock();
        policies.retain(|(pod, _), _| pod != pod_id);
    }

    /// Replace a pod's token after a refresh.
    pub fn refresh_pod_token(&self, pod_id: PodId, token: String) {
        self.pod_tokens.set(pod_id, token);
    }

    /// The outbound path: one overlay HTTP call from a local pod.
    ///
    /// A policy denial returns a 403 response envelope with a
    /// machine-readable body; transport failures surface as errors. A call
    /// whose cached target fails is re-resolved and retried once within the
    /// same invocation.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for non-overlay URLs, `NotFound` when no target is
    /// selectable, and transport-kind errors when both attempts fail.
    pub async fn request(
        &self,
        source_pod: PodId,
        url: &str,
        method: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> stark_core::Result<ResponseEnvelope> {
        let target = VirtualTarget::parse_url(url)?;

        match self.check_policy(source_pod, &target.service_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(ResponseEnvelope::policy_denied(
                    EnvelopeId::generate(),
                    "caller",
                    target.service_id.as_str(),
                ));
            }
            Err(e) => return Err(e),
        }

        let mut last_err = CoreError::TransportClosed;
        for attempt in 0..2 {
            let resolved = self.resolve(source_pod, &target.service_id).await?;
            match self
                .dispatch(
                    source_pod,
                    resolved.pod_id,
                    resolved.node_id,
                    method,
                    &target.path,
                    headers.clone(),
                    body.clone(),
                    self.config.request_timeout,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && attempt == 0 => {
                    tracing::debug!(
                        service = %target.service_id,
                        target_pod = %resolved.pod_id,
                        error = %e,
                        "Envelope failed, invalidating cached target"
                    );
                    self.cache.invalidate(&source_pod, &target.service_id);
                    self.cache.mark_target_unhealthy(&resolved.pod_id);
                    last_err = e;
                }
                Err(CoreError::PolicyDenied {
                    source_service,
                    target_service,
                }) => {
                    return Ok(ResponseEnvelope::policy_denied(
                        EnvelopeId::generate(),
                        source_service.as_str(),
                        target_service.as_str(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Direct envelope to a known pod, used by the ephemeral plane.
    ///
    /// Skips service resolution; channel establishment still passes the
    /// signaling hub's policy check.
    ///
    /// # Errors
    ///
    /// Returns transport-kind errors on channel or deadline failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_to_pod(
        &self,
        source_pod: PodId,
        target_pod: PodId,
        target_node: NodeId,
        method: &str,
        path: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> stark_core::Result<ResponseEnvelope> {
        self.dispatch(
            source_pod,
            target_pod,
            target_node,
            method,
            path,
            Vec::new(),
            body,
            timeout,
        )
        .await
    }

    /// Cached policy decision, refreshed from the hub when stale.
    async fn check_policy(
        &self,
        source_pod: PodId,
        service: &ServiceId,
    ) -> stark_core::Result<bool> {
        let key = (source_pod, service.clone());
        let now = Utc::now();
        if let Some(verdict) = self.policy_cache.lock().get(&key) {
            if now < verdict.expires_at {
                return Ok(verdict.allowed);
            }
        }

        let value = self
            .session
            .request(Body::PolicyCheck(PolicyCheck {
                from_pod_id: source_pod,
                to_service: service.clone(),
            }))
            .await?;
        let decision: PolicyDecision = serde_json::from_value(value)
            .map_err(|e| CoreError::Invalid(format!("bad policy reply: {e}")))?;

        self.policy_cache.lock().insert(
            key,
            PolicyVerdict {
                allowed: decision.allowed,
                expires_at: now + ChronoDuration::seconds(POLICY_CACHE_TTL_SECS),
            },
        );
        Ok(decision.allowed)
    }

    /// Sticky resolution: the cache answers while valid, the registry
    /// otherwise.
    async fn resolve(
        &self,
        source_pod: PodId,
        service: &ServiceId,
    ) -> stark_core::Result<CachedTarget> {
        if let Some(hit) = self.cache.get(&source_pod, service) {
            return Ok(hit);
        }

        let value = self
            .session
            .request(Body::ResolveTarget(ResolveTarget {
                pod_id: source_pod,
                service_id: service.clone(),
                sticky: true,
            }))
            .await?;
        let resolved: ResolvedTarget = serde_json::from_value(value)
            .map_err(|e| CoreError::Invalid(format!("bad resolve reply: {e}")))?;

        let entry = CachedTarget {
            pod_id: resolved.pod_id,
            node_id: resolved.node_id,
            peer_addr: resolved.peer_addr,
            expires_at: Utc::now()
                + ChronoDuration::milliseconds(
                    i64::try_from(resolved.ttl_ms).unwrap_or(i64::MAX),
                ),
            healthy: true,
        };
        self.cache.insert(source_pod, service.clone(), entry.clone());
        Ok(entry)
    }

    /// Frame, send, and await one envelope.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        source_pod: PodId,
        target_pod: PodId,
        target_node: NodeId,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> stark_core::Result<ResponseEnvelope> {
        let deadline = Utc::now()
            + ChronoDuration::milliseconds(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));
        let envelope = RequestEnvelope {
            envelope_id: EnvelopeId::generate(),
            source_pod_id: source_pod,
            target_pod_id: target_pod,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
            deadline_ms: u64::try_from(deadline.timestamp_millis()).unwrap_or(u64::MAX),
        };

        // Same-node targets short-circuit the peer plane entirely.
        if target_node == self.self_node {
            return Ok(self.inbound.handle(envelope).await);
        }

        self.peers
            .ensure_channel(source_pod, target_pod, target_node)
            .await?;

        let envelope_id = envelope.envelope_id;
        let rx = self.correlator.register(envelope_id, target_node);
        if let Err(e) = self.peers.send(&target_node, PeerFrame::Request(envelope)) {
            self.correlator.forget(&envelope_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::TransportClosed),
            Err(_) => {
                self.correlator.fail(
                    &envelope_id,
                    CoreError::Timeout {
                        elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    },
                );
                Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}
