//! Request envelopes exchanged between peer agents.
//!
//! Once a peer channel is open, every pod-to-pod call travels as a
//! [`RequestEnvelope`] answered by exactly one [`ResponseEnvelope`]. Frames
//! are CBOR-encoded on the channel; the envelope ID is the correlator.

use crate::error::CoreError;
use crate::ids::{EnvelopeId, NodeId, PodId};
use serde::{Deserialize, Serialize};

/// HTTP status code returned in a policy-denial response body, alongside the
/// machine-readable `policy_denied` code.
pub const POLICY_DENIED_STATUS: u16 = 403;

/// A frame on a peer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame after connecting: identifies the dialing node.
    Hello {
        /// The node that opened the connection.
        node_id: NodeId,
    },
    /// A pod-to-pod request.
    Request(RequestEnvelope),
    /// The reply to a request.
    Response(ResponseEnvelope),
}

impl PeerFrame {
    /// Encode to CBOR bytes for the channel.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::Invalid(format!("encode peer frame: {e}")))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the bytes are not a valid frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::Invalid(format!("decode peer frame: {e}")))
    }
}

/// A framed pod-to-pod request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlates the reply with this request.
    pub envelope_id: EnvelopeId,
    /// Calling pod.
    pub source_pod_id: PodId,
    /// Called pod, local to the receiving agent.
    pub target_pod_id: PodId,
    /// HTTP method.
    pub method: String,
    /// Request path, including any query string.
    pub path: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body bytes.
    pub body: Vec<u8>,
    /// Absolute deadline, epoch milliseconds.
    pub deadline_ms: u64,
}

impl RequestEnvelope {
    /// Whether the deadline has passed at `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.deadline_ms
    }
}

/// The reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoes the request's envelope ID.
    pub envelope_id: EnvelopeId,
    /// HTTP-style status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    /// A denial response handed to the calling pod when policy rejects the
    /// flow before the request leaves the node.
    #[must_use]
    pub fn policy_denied(envelope_id: EnvelopeId, source: &str, target: &str) -> Self {
        let body = serde_json::json!({
            "code": "policy_denied",
            "message": format!("policy denied: {source} -> {target}"),
        });
        Self {
            envelope_id,
            status: POLICY_DENIED_STATUS,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }

    /// Whether the status is a 2xx success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope {
            envelope_id: EnvelopeId::generate_deterministic(1),
            source_pod_id: PodId::generate_deterministic(2),
            target_pod_id: PodId::generate_deterministic(3),
            method: "GET".into(),
            path: "/ping?seq=7".into(),
            headers: vec![("accept".into(), "application/json".into())],
            body: Vec::new(),
            deadline_ms: 1_000,
        }
    }

    #[test]
    fn request_cbor_roundtrip() {
        let frame = PeerFrame::Request(sample_request());
        let bytes = frame.encode().unwrap();
        let decoded = PeerFrame::decode(&bytes).unwrap();
        match decoded {
            PeerFrame::Request(req) => {
                assert_eq!(req.envelope_id, EnvelopeId::generate_deterministic(1));
                assert_eq!(req.path, "/ping?seq=7");
            }
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn response_cbor_roundtrip() {
        let frame = PeerFrame::Response(ResponseEnvelope {
            envelope_id: EnvelopeId::generate_deterministic(1),
            status: 200,
            headers: Vec::new(),
            body: b"pong".to_vec(),
        });
        let bytes = frame.encode().unwrap();
        match PeerFrame::decode(&bytes).unwrap() {
            PeerFrame::Response(resp) => {
                assert!(resp.is_success());
                assert_eq!(resp.body, b"pong");
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn deadline_expiry() {
        let req = sample_request();
        assert!(!req.is_expired(999));
        assert!(!req.is_expired(1_000));
        assert!(req.is_expired(1_001));
    }

    #[test]
    fn policy_denied_body_is_machine_readable() {
        let resp =
            ResponseEnvelope::policy_denied(EnvelopeId::generate_deterministic(1), "a", "b");
        assert_eq!(resp.status, POLICY_DENIED_STATUS);
        assert!(!resp.is_success());
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value["code"], "policy_denied");
    }

    #[test]
    fn decode_garbage_fails() {
        let result = PeerFrame::decode(b"not cbor at all");
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }
}
