//! Envelope correlation: pending request futures keyed by envelope ID.
//!
//! Exactly one of reply, timeout, or failure resolves each registered
//! envelope; the loser finds the slot already gone and is dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

use stark_core::envelope::ResponseEnvelope;
use stark_core::{CoreError, EnvelopeId, NodeId};

type Waiter = oneshot::Sender<stark_core::Result<ResponseEnvelope>>;

/// The pending-envelope table.
#[derive(Default)]
pub struct EnvelopeCorrelator {
    pending: Mutex<HashMap<EnvelopeId, (NodeId, Waiter)>>,
}

impl EnvelopeCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight envelope bound for `peer_node`.
    pub fn register(
        &self,
        envelope_id: EnvelopeId,
        peer_node: NodeId,
    ) -> oneshot::Receiver<stark_core::Result<ResponseEnvelope>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(envelope_id, (peer_node, tx));
        rx
    }

    /// Resolve an envelope from a reply frame. Returns whether a waiter was
    /// found.
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        match self.pending.lock().remove(&response.envelope_id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail one envelope (deadline, cancellation).
    pub fn fail(&self, envelope_id: &EnvelopeId, err: CoreError) {
        if let Some((_, tx)) = self.pending.lock().remove(envelope_id) {
            let _ = tx.send(Err(err));
        }
    }

    /// Drop an envelope without resolving it; the waiter has already
    /// moved on.
    pub fn forget(&self, envelope_id: &EnvelopeId) {
        self.pending.lock().remove(envelope_id);
    }

    /// Fail every envelope bound for a peer whose channel collapsed.
    pub fn fail_for_peer(&self, peer_node: &NodeId) {
        let mut pending = self.pending.lock();
        let stale: Vec<EnvelopeId> = pending
            .iter()
            .filter(|(_, (node, _))| node == peer_node)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(CoreError::TransportClosed));
            }
        }
    }

    /// Number of envelopes in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(seed: u64) -> ResponseEnvelope {
        ResponseEnvelope {
            envelope_id: EnvelopeId::generate_deterministic(seed),
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn reply_resolves_waiter() {
        let correlator = EnvelopeCorrelator::new();
        let id = EnvelopeId::generate_deterministic(1);
        let rx = correlator.register(id, NodeId::generate_deterministic(1));

        assert!(correlator.complete(response(1)));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_reply_is_dropped() {
        let correlator = EnvelopeCorrelator::new();
        assert!(!correlator.complete(response(9)));
    }

    #[tokio::test]
    async fn peer_collapse_fails_only_its_envelopes() {
        let correlator = EnvelopeCorrelator::new();
        let dead_peer = NodeId::generate_deterministic(1);
        let live_peer = NodeId::generate_deterministic(2);

        let rx_dead = correlator.register(EnvelopeId::generate_deterministic(1), dead_peer);
        let rx_live = correlator.register(EnvelopeId::generate_deterministic(2), live_peer);

        correlator.fail_for_peer(&dead_peer);

        let result = rx_dead.await.unwrap();
        assert!(matches!(result, Err(CoreError::TransportClosed)));
        assert_eq!(correlator.in_flight(), 1);

        assert!(correlator.complete(response(2)));
        assert!(rx_live.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn exactly_one_resolution_wins() {
        let correlator = EnvelopeCorrelator::new();
        let id = EnvelopeId::generate_deterministic(1);
        let rx = correlator.register(id, NodeId::generate_deterministic(1));

        correlator.fail(&id, CoreError::Timeout { elapsed_ms: 5 });
        // A late reply finds nothing to resolve.
        assert!(!correlator.complete(response(1)));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }
}
