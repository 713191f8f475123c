//! The agent's session to the orchestrator.
//!
//! One WebSocket, authenticated with the node token, registered, then
//! pumped by a writer task (preserving frame order) and a reader task that
//! fans incoming frames out to the runtime (commands), the peer manager
//! (signals), and the pending-request table (replies).

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use stark_core::proto::{Body, Frame, Register, RegisterAck};
use stark_core::{CoreError, CorrelationId, NodeId};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// A command the orchestrator wants this agent to execute.
#[derive(Debug)]
pub enum Command {
    /// Deploy a pod.
    Deploy {
        /// The deploy payload.
        payload: stark_core::proto::PodDeploy,
        /// Correlation to reply on once accepted.
        correlation_id: Option<CorrelationId>,
    },
    /// Stop a pod.
    Stop {
        /// The stop payload.
        payload: stark_core::proto::PodStop,
        /// Correlation to reply on once complete.
        correlation_id: Option<CorrelationId>,
    },
}

/// A signaling frame delivered to this agent.
#[derive(Debug)]
pub enum InboundSignal {
    /// A peer wants to open a channel to one of our pods.
    Offer(stark_core::proto::Signal),
    /// Answer to an offer we sent.
    Answer(stark_core::proto::Signal),
    /// Additional candidates.
    Ice(stark_core::proto::Signal),
}

type ReplySender = oneshot::Sender<stark_core::Result<serde_json::Value>>;

/// The operations stack components need from the orchestrator session.
///
/// Split out as a trait so the network stack and ephemeral plane can be
/// exercised against a scripted orchestrator in tests.
#[async_trait::async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send a correlated request and await the typed reply value.
    async fn request(&self, body: Body) -> stark_core::Result<serde_json::Value>;

    /// Send a fire-and-forget frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` once the session is gone.
    fn send(&self, body: Body) -> stark_core::Result<()>;

    /// Send a pre-built frame, e.g. a correlated reply.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` once the session is gone.
    fn send_frame(&self, frame: Frame) -> stark_core::Result<()>;
}

/// A live session to the orchestrator.
pub struct Session {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<CorrelationId, ReplySender>>,
    request_timeout: Duration,
    node_id: NodeId,
    heartbeat_interval: Duration,
    closed_rx: watch::Receiver<bool>,
}

impl Session {
    /// Connect, authenticate, and register.
    ///
    /// Commands and signals arriving on the session are forwarded to the
    /// given channels; replies resolve the internal pending table.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport or handshake fails.
    pub async fn connect(
        config: &AgentConfig,
        commands: mpsc::UnboundedSender<Command>,
        signals: mpsc::UnboundedSender<InboundSignal>,
    ) -> Result<Arc<Self>> {
        let (ws, _) = tokio_tungstenite::connect_async(&config.orchestrator_url)
            .await
            .map_err(|e| AgentError::Transport(format!("connect: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        // Handshake frame 1: auth.
        let auth = Frame::request(Body::Auth {
            token: config.node_token.clone(),
        });
        let auth_corr = auth.correlation_id.expect("request frame");
        send_raw(&mut sink, &auth).await?;
        expect_ok(&mut stream, auth_corr).await?;

        // Handshake frame 2: register.
        let register = Frame::request(Body::Register(Register {
            node_name: config.node_name.clone(),
            runtime_type: config.runtime_type,
            capabilities: config.capabilities.clone(),
            allocatable: config.allocatable,
            labels: config.labels.clone(),
            taints: config.taints.clone(),
            peer_addr: config.advertised_peer_addr(),
        }));
        let register_corr = register.correlation_id.expect("request frame");
        send_raw(&mut sink, &register).await?;
        let ack_value = expect_ok(&mut stream, register_corr).await?;
        let ack: RegisterAck = serde_json::from_value(ack_value)
            .map_err(|e| AgentError::Transport(format!("bad register ack: {e}")))?;

        tracing::info!(
            node_id = %ack.node_id,
            heartbeat_ms = ack.heartbeat_interval_ms,
            "Registered with orchestrator"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let session = Arc::new(Self {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            request_timeout: config.request_timeout,
            node_id: ack.node_id,
            heartbeat_interval: Duration::from_millis(ack.heartbeat_interval_ms),
            closed_rx,
        });

        // Writer task: single consumer preserves per-session order.
        let writer_closed = Arc::clone(&closed_tx);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame.encode() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Unencodable outbound frame");
                    }
                }
            }
            let _ = sink.close().await;
            let _ = writer_closed.send(true);
        });

        // Reader task: fan frames out.
        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => continue,
                    Ok(Message::Close(_) | Message::Frame(_)) | Err(_) => break,
                };
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Undecodable session frame");
                        continue;
                    }
                };
                reader_session.route(frame, &commands, &signals);
            }
            reader_session.fail_pending(&CoreError::TransportClosed);
            let _ = closed_tx.send(true);
            tracing::info!("Orchestrator session reader ended");
        });

        Ok(session)
    }

    /// The node identity the orchestrator assigned.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The heartbeat cadence the orchestrator asked for.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Completes when the session transport has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a fire-and-forget frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` once the session is gone.
    pub fn send(&self, body: Body) -> stark_core::Result<()> {
        self.send_frame(Frame::event(body))
    }

    /// Send a pre-built frame (e.g. a correlated reply).
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` once the session is gone.
    pub fn send_frame(&self, frame: Frame) -> stark_core::Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| CoreError::TransportClosed)
    }

    /// Send a correlated request and await the typed reply value.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error, `Timeout`, or `TransportClosed`.
    pub async fn request(&self, body: Body) -> stark_core::Result<serde_json::Value> {
        let frame = Frame::request(body);
        let correlation_id = frame.correlation_id.expect("request frame");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        if let Err(e) = self.send_frame(frame) {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::TransportClosed),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(CoreError::Timeout {
                    elapsed_ms: u64::try_from(self.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    fn route(
        &self,
        frame: Frame,
        commands: &mpsc::UnboundedSender<Command>,
        signals: &mpsc::UnboundedSender<InboundSignal>,
    ) {
        match frame.body {
            Body::Ok { value } => self.resolve(frame.correlation_id, Ok(value)),
            Body::Error { code, message } => {
                self.resolve(frame.correlation_id, Err(CoreError::from_wire(&code, &message)));
            }
            Body::PodDeploy(payload) => {
                let _ = commands.send(Command::Deploy {
                    payload,
                    correlation_id: frame.correlation_id,
                });
            }
            Body::PodStop(payload) => {
                let _ = commands.send(Command::Stop {
                    payload,
                    correlation_id: frame.correlation_id,
                });
            }
            Body::SignalOffer(signal) => {
                let _ = signals.send(InboundSignal::Offer(signal));
            }
            Body::SignalAnswer(signal) => {
                let _ = signals.send(InboundSignal::Answer(signal));
            }
            Body::SignalIce(signal) => {
                let _ = signals.send(InboundSignal::Ice(signal));
            }
            other => {
                tracing::warn!(kind = other.kind(), "Unexpected frame on agent session");
            }
        }
    }

    fn resolve(
        &self,
        correlation_id: Option<CorrelationId>,
        result: stark_core::Result<serde_json::Value>,
    ) {
        let Some(corr) = correlation_id else {
            tracing::debug!("Reply frame without correlation id");
            return;
        };
        if let Some(tx) = self.pending.lock().remove(&corr) {
            let _ = tx.send(result);
        } else {
            tracing::debug!(correlation_id = %corr, "Reply with no pending request");
        }
    }

    fn fail_pending(&self, err: &CoreError) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

#[async_trait::async_trait]
impl ControlChannel for Session {
    async fn request(&self, body: Body) -> stark_core::Result<serde_json::Value> {
        Self::request(self, body).await
    }

    fn send(&self, body: Body) -> stark_core::Result<()> {
        Self::send(self, body)
    }

    fn send_frame(&self, frame: Frame) -> stark_core::Result<()> {
        Self::send_frame(self, frame)
    }
}

async fn send_raw<Si>(sink: &mut Si, frame: &Frame) -> Result<()>
where
    Si: SinkExt<Message> + Unpin,
{
    sink.send(Message::Text(frame.encode().map_err(AgentError::Core)?))
        .await
        .map_err(|_| AgentError::Transport("handshake send failed".to_string()))
}

async fn expect_ok<St>(
    stream: &mut St,
    correlation_id: CorrelationId,
) -> Result<serde_json::Value>
where
    St: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let message = stream
            .next()
            .await
            .ok_or_else(|| AgentError::Transport("handshake stream closed".to_string()))?
            .map_err(|e| AgentError::Transport(format!("handshake read: {e}")))?;
        let Message::Text(text) = message else {
            continue;
        };
        let frame = Frame::decode(&text).map_err(AgentError::Core)?;
        if frame.correlation_id != Some(correlation_id) {
            continue;
        }
        return match frame.body {
            Body::Ok { value } => Ok(value),
            Body::Error { code, message } => {
                Err(AgentError::Core(CoreError::from_wire(&code, &message)))
            }
            other => Err(AgentError::Transport(format!(
                "unexpected handshake reply {}",
                other.kind()
            ))),
        };
    }
}
