//! The agent ⇄ orchestrator wire protocol.
//!
//! Frames are JSON objects `{type, payload, correlationId?}` carried over a
//! duplex transport (WebSocket in both binaries). Requests that expect a
//! response carry a correlation ID; responses are generic `ok` / `error`
//! frames echoing it, with typed payloads nested in the `ok` value.
//!
//! Per-session ordering is preserved end to end; nothing is promised across
//! sessions.

use crate::error::CoreError;
use crate::ids::{CorrelationId, GroupId, NodeId, PackId, PodId, ServiceId};
use crate::resources::Resources;
use crate::state::{PodStatus, RuntimeType, Taint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Pairs a request with its `ok`/`error` response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// The typed message body.
    #[serde(flatten)]
    pub body: Body,
}

impl Frame {
    /// A fire-and-forget frame with no correlation.
    #[must_use]
    pub const fn event(body: Body) -> Self {
        Self {
            correlation_id: None,
            body,
        }
    }

    /// A request frame with a fresh correlation ID.
    #[must_use]
    pub fn request(body: Body) -> Self {
        Self {
            correlation_id: Some(CorrelationId::generate()),
            body,
        }
    }

    /// An `ok` response echoing `correlation_id`, with a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the payload cannot be serialized.
    pub fn reply_ok<T: Serialize>(
        correlation_id: CorrelationId,
        payload: &T,
    ) -> Result<Self, CoreError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| CoreError::Invalid(format!("unserializable reply payload: {e}")))?;
        Ok(Self {
            correlation_id: Some(correlation_id),
            body: Body::Ok { value },
        })
    }

    /// An `error` response echoing `correlation_id`.
    #[must_use]
    pub fn reply_err(correlation_id: CorrelationId, err: &CoreError) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            body: Body::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Serialize to the JSON text put on the wire.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if serialization fails.
    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Invalid(format!("encode frame: {e}")))
    }

    /// Parse a frame from wire text.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the text is not a valid frame.
    pub fn decode(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::Invalid(format!("decode frame: {e}")))
    }
}

/// All message bodies, tagged by their wire `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Body {
    /// First frame on a session: bearer token. A → O.
    #[serde(rename = "auth")]
    Auth {
        /// Bearer token for the agent identity.
        token: String,
    },

    /// Node registration after successful auth. A → O.
    #[serde(rename = "register")]
    Register(Register),

    /// Periodic liveness + resource report. A → O.
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),

    /// Deploy a pod onto the agent. O → A.
    #[serde(rename = "pod:deploy")]
    PodDeploy(PodDeploy),

    /// Stop a pod, gracefully within the grace period. O → A.
    #[serde(rename = "pod:stop")]
    PodStop(PodStop),

    /// Pod lifecycle event observed by the agent. A → O.
    #[serde(rename = "pod:status")]
    PodStatusUpdate(PodStatusUpdate),

    /// Peer-channel offer, relayed through the hub. Bidirectional.
    #[serde(rename = "signal:offer")]
    SignalOffer(Signal),

    /// Peer-channel answer. Bidirectional.
    #[serde(rename = "signal:answer")]
    SignalAnswer(Signal),

    /// Additional connection candidates. Bidirectional.
    #[serde(rename = "signal:ice")]
    SignalIce(Signal),

    /// Join (or refresh) a pod-group membership. A → O.
    #[serde(rename = "podgroup:join")]
    GroupJoin(GroupJoin),

    /// Leave a pod group. A → O.
    #[serde(rename = "podgroup:leave")]
    GroupLeave(GroupLeave),

    /// Request the current member roster of a group. A → O.
    #[serde(rename = "podgroup:members")]
    GroupMembers(GroupMembers),

    /// Resolve a target pod for a service call. A → O.
    #[serde(rename = "net:resolve")]
    ResolveTarget(ResolveTarget),

    /// Ask for a policy decision on a service-to-service flow. A → O.
    #[serde(rename = "net:policy")]
    PolicyCheck(PolicyCheck),

    /// Generic success response; `value` holds the typed payload.
    #[serde(rename = "ok")]
    Ok {
        /// Response payload, shaped by the request type.
        #[serde(default)]
        value: serde_json::Value,
    },

    /// Generic failure response.
    #[serde(rename = "error")]
    Error {
        /// Machine-readable error code from the core taxonomy.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl Body {
    /// The wire name of this body, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Register(_) => "register",
            Self::Heartbeat(_) => "heartbeat",
            Self::PodDeploy(_) => "pod:deploy",
            Self::PodStop(_) => "pod:stop",
            Self::PodStatusUpdate(_) => "pod:status",
            Self::SignalOffer(_) => "signal:offer",
            Self::SignalAnswer(_) => "signal:answer",
            Self::SignalIce(_) => "signal:ice",
            Self::GroupJoin(_) => "podgroup:join",
            Self::GroupLeave(_) => "podgroup:leave",
            Self::GroupMembers(_) => "podgroup:members",
            Self::ResolveTarget(_) => "net:resolve",
            Self::PolicyCheck(_) => "net:policy",
            Self::Ok { .. } => "ok",
            Self::Error { .. } => "error",
        }
    }
}

/// Payload of `register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    /// Human-readable node name.
    pub node_name: String,
    /// Runtime class of this node.
    pub runtime_type: RuntimeType,
    /// Capability names this node can grant to packs.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Total allocatable resources.
    pub allocatable: Resources,
    /// Node labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Address other agents dial for peer channels, if this node accepts
    /// inbound peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
}

/// Typed payload inside the `ok` reply to `register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    /// The node ID assigned (or re-confirmed) by the orchestrator.
    pub node_id: NodeId,
    /// Heartbeat interval the agent must honor, in milliseconds.
    pub heartbeat_interval_ms: u64,
}

/// Payload of `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Resources currently consumed on the node.
    pub used_resources: Resources,
    /// Liveness of each pod the agent hosts.
    #[serde(default)]
    pub pod_statuses: Vec<PodRunState>,
}

/// One pod's liveness as seen by its agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRunState {
    /// The pod.
    pub pod_id: PodId,
    /// Whether the isolate is alive.
    pub running: bool,
    /// Optional detail (exit status, signal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of `pod:deploy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDeploy {
    /// The pod to run.
    pub pod_id: PodId,
    /// Overlay identity, when the pod belongs to a service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    /// The pack bundle and its metadata.
    pub pack: PackPayload,
    /// Capabilities granted to this pod.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Short-lived token authenticating signaling frames from this pod.
    pub pod_token: String,
    /// Token used to obtain a fresh pod token near expiry.
    pub refresh_token: String,
    /// Resource limits enforced on the isolate.
    #[serde(default)]
    pub limits: Resources,
}

/// The pack bundle as shipped to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackPayload {
    /// Pack identity.
    pub pack_id: PackId,
    /// Pack name.
    pub name: String,
    /// Pack version string.
    pub version: String,
    /// Bundle bytes, base64 on the wire.
    pub bundle: String,
    /// Whether the pod opts into the ephemeral plane.
    #[serde(default)]
    pub enable_ephemeral: bool,
    /// Free-form pack metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PackPayload {
    /// Decode the base64 bundle into raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the bundle is not valid base64.
    pub fn bundle_bytes(&self) -> Result<Vec<u8>, CoreError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.bundle)
            .map_err(|e| CoreError::Invalid(format!("bundle is not valid base64: {e}")))
    }

    /// Encode raw bundle bytes for the wire.
    #[must_use]
    pub fn encode_bundle(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

/// Payload of `pod:stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStop {
    /// The pod to stop.
    pub pod_id: PodId,
    /// Why the pod is stopping (scale-down, rollout, drain...).
    pub reason: String,
    /// How long the isolate gets to shut down cleanly.
    pub grace_period_ms: u64,
}

/// Payload of `pod:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusUpdate {
    /// The pod that changed.
    pub pod_id: PodId,
    /// Its new status.
    pub status: PodStatus,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of the three `signal:*` frame types.
///
/// `data` is opaque to the hub: offers and answers carry the dialable
/// listener addresses of the two agents, ICE frames carry additional
/// candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Pod originating the signal.
    pub from_pod_id: PodId,
    /// Pod the signal is addressed to.
    pub to_pod_id: PodId,
    /// Opaque negotiation data.
    pub data: serde_json::Value,
    /// The originating pod's token; the hub rejects frames whose signature
    /// does not verify for `from_pod_id`.
    pub signature: String,
}

/// Payload of `podgroup:join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupJoin {
    /// Joining pod.
    pub pod_id: PodId,
    /// Group to join.
    pub group_id: GroupId,
    /// Membership lifetime in milliseconds; refreshed on re-join.
    pub ttl_ms: u64,
    /// Free-form membership metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Payload of `podgroup:leave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLeave {
    /// Leaving pod.
    pub pod_id: PodId,
    /// Group to leave.
    pub group_id: GroupId,
}

/// Payload of `podgroup:members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembers {
    /// Group to list.
    pub group_id: GroupId,
}

/// One entry in the `ok` reply to `podgroup:members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberInfo {
    /// Member pod.
    pub pod_id: PodId,
    /// Node currently hosting the member.
    pub node_id: NodeId,
    /// When the membership was first created, epoch milliseconds.
    pub joined_at_ms: u64,
    /// Membership metadata supplied at join.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Typed payload inside the `ok` reply to `podgroup:members` and
/// `podgroup:join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRoster {
    /// The group.
    pub group_id: GroupId,
    /// Currently visible members.
    pub members: Vec<GroupMemberInfo>,
}

/// Payload of `net:resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveTarget {
    /// Pod asking for a target (the caller).
    pub pod_id: PodId,
    /// Service being called.
    pub service_id: ServiceId,
    /// Whether the registry should record a sticky selection.
    #[serde(default)]
    pub sticky: bool,
}

/// Typed payload inside the `ok` reply to `net:resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTarget {
    /// Service the resolution is for.
    pub service_id: ServiceId,
    /// Chosen target pod.
    pub pod_id: PodId,
    /// Node hosting the target pod.
    pub node_id: NodeId,
    /// Dialable peer address of that node, when it accepts inbound peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
    /// How long the caller may cache this selection, milliseconds.
    pub ttl_ms: u64,
}

/// Payload of `net:policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCheck {
    /// Calling pod.
    pub from_pod_id: PodId,
    /// Called service.
    pub to_service: ServiceId,
}

/// Typed payload inside the `ok` reply to `net:policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    /// Whether the flow is permitted.
    pub allowed: bool,
}
