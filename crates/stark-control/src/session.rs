//! The session hub: connected agent sessions and correlated requests.
//!
//! The transport (WebSocket accept loop, auth handshake) lives in the
//! gateway; once a session is authenticated and registered it is handed to
//! the hub, which owns outbound delivery and request/response correlation.
//! One writer task per session preserves per-session frame order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use stark_core::proto::{Body, Frame};
use stark_core::{CoreError, CorrelationId, NodeId};

type ReplySender = oneshot::Sender<stark_core::Result<serde_json::Value>>;

/// One connected agent session.
pub struct AgentSession {
    node_id: NodeId,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<CorrelationId, ReplySender>>,
}

impl AgentSession {
    /// Queue a frame for the session's writer task.
    fn send(&self, frame: Frame) -> stark_core::Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| CoreError::TransportClosed)
    }

    /// Fail every pending request; called when the session drops.
    fn fail_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in pending {
            let _ = tx.send(Err(CoreError::TransportClosed));
        }
    }
}

/// Registry of live agent sessions, keyed by node.
pub struct SessionHub {
    sessions: Mutex<HashMap<NodeId, Arc<AgentSession>>>,
    request_timeout: Duration,
}

impl SessionHub {
    /// Create a hub with the given correlated-request timeout.
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Register a freshly authenticated session.
    ///
    /// Returns the outbound receiver the transport's writer task must
    /// drain. A previous session for the same node is replaced and its
    /// pending requests failed.
    pub fn register_session(&self, node_id: NodeId) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(AgentSession {
            node_id,
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
        });
        if let Some(previous) = self.sessions.lock().insert(node_id, session) {
            tracing::info!(node_id = %node_id, "Replacing existing session");
            previous.fail_pending();
        }
        rx
    }

    /// Drop a session, failing its pending requests.
    pub fn remove_session(&self, node_id: &NodeId) {
        if let Some(session) = self.sessions.lock().remove(node_id) {
            session.fail_pending();
            tracing::info!(node_id = %node_id, "Session removed");
        }
    }

    /// Whether a session for the node is live.
    #[must_use]
    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.sessions.lock().contains_key(node_id)
    }

    /// Nodes with a live session.
    #[must_use]
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Send a fire-and-forget frame to a node.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` if the node has no live session.
    pub fn send_event(&self, node_id: &NodeId, body: Body) -> stark_core::Result<()> {
        self.send_frame(node_id, Frame::event(body))
    }

    /// Queue an already-built frame (e.g. a correlated reply) on a node's
    /// session, preserving per-session order.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` if the node has no live session.
    pub fn send_frame(&self, node_id: &NodeId, frame: Frame) -> stark_core::Result<()> {
        let session = self
            .sessions
            .lock()
            .get(node_id)
            .cloned()
            .ok_or(CoreError::TransportClosed)?;
        session.send(frame)
    }

    /// Send a correlated request and await its `ok`/`error` reply.
    ///
    /// Exactly one of reply, timeout, or session loss resolves the wait.
    ///
    /// # Errors
    ///
    /// Returns the agent's error, `Timeout` after the hub's request
    /// timeout, or `TransportClosed` if the session drops first.
    pub async fn request(
        &self,
        node_id: &NodeId,
        body: Body,
    ) -> stark_core::Result<serde_json::Value> {
        let session = self
            .sessions
            .lock()
            .get(node_id)
            .cloned()
            .ok_or(CoreError::TransportClosed)?;

        let frame = Frame::request(body);
        let correlation_id = frame
            .correlation_id
            .expect("request frames always carry a correlation id");

        let (tx, rx) = oneshot::channel();
        session.pending.lock().insert(correlation_id, tx);

        if let Err(e) = session.send(frame) {
            session.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::TransportClosed),
            Err(_) => {
                session.pending.lock().remove(&correlation_id);
                Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(self.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Resolve a pending request from an incoming `ok`/`error` frame.
    ///
    /// Returns whether a waiter was found; unmatched replies are logged and
    /// dropped.
    pub fn resolve_reply(
        &self,
        node_id: &NodeId,
        correlation_id: CorrelationId,
        result: stark_core::Result<serde_json::Value>,
    ) -> bool {
        let Some(session) = self.sessions.lock().get(node_id).cloned() else {
            return false;
        };
        let found = session.pending.lock().remove(&correlation_id);
        match found {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                tracing::debug!(
                    node_id = %session.node_id,
                    correlation_id = %correlation_id,
                    "Reply with no pending request"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stark_core::proto::{GroupMembers, PodStop};
    use stark_core::PodId;

    fn hub() -> SessionHub {
        SessionHub::new(Duration::from_millis(200))
    }

    fn stop_body() -> Body {
        Body::PodStop(PodStop {
            pod_id: PodId::generate_deterministic(1),
            reason: "test".into(),
            grace_period_ms: 0,
        })
    }

    #[tokio::test]
    async fn request_resolves_on_reply() {
        let hub = Arc::new(hub());
        let node = NodeId::generate_deterministic(1);
        let mut rx = hub.register_session(node);

        let hub_clone = Arc::clone(&hub);
        let waiter =
            tokio::spawn(async move { hub_clone.request(&node, stop_body()).await });

        // The transport sees the outbound frame and replies.
        let frame = rx.recv().await.unwrap();
        let correlation_id = frame.correlation_id.unwrap();
        assert!(hub.resolve_reply(&node, correlation_id, Ok(serde_json::json!({"done": true}))));

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value["done"], true);
    }

    #[tokio::test]
    async fn request_times_out() {
        let hub = hub();
        let node = NodeId::generate_deterministic(1);
        let _rx = hub.register_session(node);

        let result = hub.request(&node, stop_body()).await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn session_loss_fails_pending() {
        let hub = Arc::new(hub());
        let node = NodeId::generate_deterministic(1);
        let _rx = hub.register_session(node);

        let hub_clone = Arc::clone(&hub);
        let waiter = tokio::spawn(async move {
            hub_clone
                .request(&node, Body::GroupMembers(GroupMembers {
                    group_id: "g".parse().unwrap(),
                }))
                .await
        });

        // Let the request enqueue, then drop the session.
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.remove_session(&node);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::TransportClosed)));
    }

    #[tokio::test]
    async fn request_to_unknown_node_is_transport_closed() {
        let hub = hub();
        let node = NodeId::generate_deterministic(9);
        let result = hub.request(&node, stop_body()).await;
        assert!(matches!(result, Err(CoreError::TransportClosed)));
    }

    #[tokio::test]
    async fn reregistration_replaces_session() {
        let hub = hub();
        let node = NodeId::generate_deterministic(1);
        let _rx1 = hub.register_session(node);
        let _rx2 = hub.register_session(node);

        assert!(hub.is_connected(&node));
        assert_eq!(hub.connected_nodes(), vec![node]);

        // Events go to the new session's receiver.
        hub.send_event(&node, stop_body()).unwrap();
    }
}
