//! Peer connection management.
//!
//! Channels between agents are negotiated through the orchestrator's
//! signaling hub: the initiator sends an offer carrying its candidate
//! addresses, the target answers with its own, and whichever side can
//! accept inbound connections is dialed by the other. Once a channel is
//! open it carries CBOR frames: requests in, responses out, multiplexed by
//! envelope ID.
//!
//! Worker-class nodes run no listener; their answers carry no candidates,
//! which tells the initiator to wait for the reverse dial.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::Message;

use stark_core::envelope::{PeerFrame, RequestEnvelope};
use stark_core::proto::{Body, Signal};
use stark_core::{CoreError, NodeId, PodId};

use crate::config::AgentConfig;
use crate::netstack::correlator::EnvelopeCorrelator;
use crate::netstack::{InboundHandler, PodTokens};
use crate::session::{ControlChannel, InboundSignal};

/// State of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Negotiation or dial in progress.
    Connecting,
    /// Channel open and usable.
    Connected,
    /// Negotiation or transport failed.
    Failed,
    /// Closed by either side.
    Closed,
}

/// Candidate addresses exchanged inside signal payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSet {
    /// The node these candidates belong to.
    pub node_id: NodeId,
    /// Dialable addresses, best first. Empty means "I will dial you".
    #[serde(default)]
    pub addrs: Vec<String>,
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerFrame>,
    state: PeerState,
}

/// Owner of all peer channels on this agent.
pub struct PeerManager {
    self_node: NodeId,
    session: Arc<dyn ControlChannel>,
    config: Arc<AgentConfig>,
    correlator: Arc<EnvelopeCorrelator>,
    inbound: Arc<dyn InboundHandler>,
    pod_tokens: Arc<PodTokens>,
    peers: Mutex<HashMap<NodeId, PeerHandle>>,
    pending_answers: Mutex<HashMap<(PodId, PodId), oneshot::Sender<CandidateSet>>>,
    peer_ready: Notify,
}

impl PeerManager {
    /// Wire up the manager.
    #[must_use]
    pub fn new(
        self_node: NodeId,
        session: Arc<dyn ControlChannel>,
        config: Arc<AgentConfig>,
        correlator: Arc<EnvelopeCorrelator>,
        inbound: Arc<dyn InboundHandler>,
        pod_tokens: Arc<PodTokens>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_node,
            session,
            config,
            correlator,
            inbound,
            pod_tokens,
            peers: Mutex::new(HashMap::new()),
            pending_answers: Mutex::new(HashMap::new()),
            peer_ready: Notify::new(),
        })
    }

    /// Whether a usable channel to the node exists.
    #[must_use]
    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.peers
            .lock()
            .get(node_id)
            .is_some_and(|p| p.state == PeerState::Connected)
    }

    /// Nodes with open channels.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Write a frame onto the channel to `node_id`.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` if no open channel exists.
    pub fn send(&self, node_id: &NodeId, frame: PeerFrame) -> stark_core::Result<()> {
        let peers = self.peers.lock();
        let peer = peers.get(node_id).ok_or(CoreError::TransportClosed)?;
        if peer.state != PeerState::Connected {
            return Err(CoreError::TransportClosed);
        }
        peer.tx.send(frame).map_err(|_| CoreError::TransportClosed)
    }

    /// Accept inbound peers on the given listener until aborted.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            "Peer listener accepting connections"
        );
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.accept_peer(stream).await {
                            tracing::debug!(peer = %addr, error = %e, "Inbound peer rejected");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Peer accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn accept_peer(self: &Arc<Self>, stream: TcpStream) -> stark_core::Result<()> {
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| CoreError::Invalid(format!("peer handshake: {e}")))?;

        // First frame must identify the dialing node.
        let remote = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => match PeerFrame::decode(&bytes)? {
                    PeerFrame::Hello { node_id } => break node_id,
                    _ => return Err(CoreError::Invalid("expected hello frame".to_string())),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                _ => return Err(CoreError::TransportClosed),
            }
        };

        tracing::info!(remote = %remote, "Inbound peer channel open");
        self.register_peer(remote, ws);
        Ok(())
    }

    /// Dial a peer's listener directly and say hello.
    async fn dial(self: &Arc<Self>, remote: NodeId, addr: &str) -> stark_core::Result<()> {
        let url = format!("ws://{addr}");
        let connect = tokio_tungstenite::connect_async(&url);
        let (mut ws, _) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| CoreError::Timeout {
                elapsed_ms: u64::try_from(self.config.connect_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            })?
            .map_err(|e| CoreError::Invalid(format!("peer dial {addr}: {e}")))?;

        let hello = PeerFrame::Hello {
            node_id: self.self_node,
        };
        ws.send(Message::Binary(hello.encode()?))
            .await
            .map_err(|_| CoreError::TransportClosed)?;

        tracing::info!(remote = %remote, addr = %addr, "Outbound peer channel open");
        self.register_peer(remote, ws);
        Ok(())
    }

    /// Install a freshly opened channel: one writer task, one reader task.
    fn register_peer<T>(self: &Arc<Self>, remote: NodeId, ws: tokio_tungstenite::WebSocketStream<T>)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerFrame>();
        self.peers.lock().insert(
            remote,
            PeerHandle {
                tx,
                state: PeerState::Connected,
            },
        );
        self.peer_ready.notify_waiters();

        let (mut sink, mut stream) = ws.split();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame.encode() {
                    Ok(bytes) => {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Unencodable peer frame"),
                }
            }
            let _ = sink.close().await;
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let bytes = match message {
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                    _ => break,
                };
                match PeerFrame::decode(&bytes) {
                    Ok(PeerFrame::Request(request)) => {
                        manager.serve_request(remote, request);
                    }
                    Ok(PeerFrame::Response(response)) => {
                        if !manager.correlator.complete(response) {
                            tracing::debug!(remote = %remote, "Late or unknown peer response");
                        }
                    }
                    Ok(PeerFrame::Hello { .. }) => {}
                    Err(e) => {
                        tracing::warn!(remote = %remote, error = %e, "Undecodable peer frame");
                    }
                }
            }
            manager.drop_peer(&remote);
        });
    }

    /// Serve one inbound request on its own task and reply on the same
    /// channel.
    fn serve_request(self: &Arc<Self>, remote: NodeId, request: RequestEnvelope) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let response = manager.inbound.handle(request).await;
            if let Err(e) = manager.send(&remote, PeerFrame::Response(response)) {
                tracing::debug!(remote = %remote, error = %e, "Peer reply dropped");
            }
        });
    }

    fn drop_peer(&self, remote: &NodeId) {
        if self.peers.lock().remove(remote).is_some() {
            tracing::info!(remote = %remote, "Peer channel closed");
        }
        self.correlator.fail_for_peer(remote);
    }

    /// Ensure an open channel to `target_node`, negotiating through the
    /// signaling hub if needed.
    ///
    /// # Errors
    ///
    /// Surfaces the hub's verdict (`PolicyDenied`, `Auth`, `NotFound`) when
    /// the offer is rejected, and `Timeout` when negotiation or dialing
    /// overruns the connect timeout.
    pub async fn ensure_channel(
        self: &Arc<Self>,
        source_pod: PodId,
        target_pod: PodId,
        target_node: NodeId,
    ) -> stark_core::Result<()> {
        if self.is_connected(&target_node) {
            return Ok(());
        }

        let token = self
            .pod_tokens
            .get(&source_pod)
            .ok_or_else(|| CoreError::Auth(format!("no pod token for {source_pod}")))?;

        let candidates = CandidateSet {
            node_id: self.self_node,
            addrs: self.config.advertised_peer_addr().into_iter().collect(),
        };
        let offer = Signal {
            from_pod_id: source_pod,
            to_pod_id: target_pod,
            data: serde_json::to_value(&candidates)
                .map_err(|e| CoreError::Internal(e.to_string()))?,
            signature: token,
        };

        let key = (source_pod, target_pod);
        let (tx, rx) = oneshot::channel();
        self.pending_answers.lock().insert(key, tx);

        // The hub's reply carries the policy verdict; a denial never
        // reaches the far agent.
        if let Err(e) = self.session.request(Body::SignalOffer(offer)).await {
            self.pending_answers.lock().remove(&key);
            return Err(e);
        }

        let answer = match tokio::time::timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => {
                return Err(CoreError::TransportClosed);
            }
            Err(_) => {
                self.pending_answers.lock().remove(&key);
                return Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(self.config.connect_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
        };

        if answer.addrs.is_empty() {
            // The target cannot accept inbound peers and dials us instead.
            return self.await_reverse_dial(answer.node_id).await;
        }

        let mut last_err = CoreError::TransportClosed;
        for addr in &answer.addrs {
            match self.dial(answer.node_id, addr).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "Candidate dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn await_reverse_dial(&self, target_node: NodeId) -> stark_core::Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            if self.is_connected(&target_node) {
                return Ok(());
            }
            let notified = self.peer_ready.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(self.config.connect_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Handle a signaling frame delivered on the orchestrator session.
    pub async fn handle_signal(self: &Arc<Self>, signal: InboundSignal) {
        match signal {
            InboundSignal::Offer(offer) => self.handle_offer(offer).await,
            InboundSignal::Answer(answer) | InboundSignal::Ice(answer) => {
                let key = (answer.to_pod_id, answer.from_pod_id);
                let Ok(candidates) = serde_json::from_value::<CandidateSet>(answer.data) else {
                    tracing::warn!("Answer with malformed candidate set");
                    return;
                };
                if let Some(tx) = self.pending_answers.lock().remove(&key) {
                    let _ = tx.send(candidates);
                } else {
                    tracing::debug!("Answer with no pending offer");
                }
            }
        }
    }

    /// A peer wants to reach one of our pods: answer with our candidates,
    /// or dial theirs when we run no listener.
    async fn handle_offer(self: &Arc<Self>, offer: Signal) {
        let Some(token) = self.pod_tokens.get(&offer.to_pod_id) else {
            tracing::warn!(pod_id = %offer.to_pod_id, "Offer for a pod we do not host");
            return;
        };
        let Ok(their_candidates) = serde_json::from_value::<CandidateSet>(offer.data.clone())
        else {
            tracing::warn!("Offer with malformed candidate set");
            return;
        };

        let our_addrs: Vec<String> = self.config.advertised_peer_addr().into_iter().collect();
        let answer = Signal {
            from_pod_id: offer.to_pod_id,
            to_pod_id: offer.from_pod_id,
            data: match serde_json::to_value(CandidateSet {
                node_id: self.self_node,
                addrs: our_addrs.clone(),
            }) {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(error = %e, "Unencodable answer");
                    return;
                }
            },
            signature: token,
        };

        if let Err(e) = self.session.request(Body::SignalAnswer(answer)).await {
            tracing::warn!(error = %e, "Answer relay failed");
            return;
        }

        // Listener-less nodes take the active role.
        if our_addrs.is_empty() {
            for addr in &their_candidates.addrs {
                match self.dial(their_candidates.node_id, addr).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(addr = %addr, error = %e, "Reverse dial failed");
                    }
                }
            }
            tracing::warn!(remote = %their_candidates.node_id, "All reverse dials failed");
        }
    }
}
