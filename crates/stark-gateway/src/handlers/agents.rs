//! The agent session endpoint.
//!
//! Agents hold one long-lived WebSocket here. The handshake is two frames:
//! `auth {token}` (a node token) then `register`; after that the session is
//! handed to the session hub and every frame flows through the
//! orchestrator's router. A writer task drains the hub's outbound queue so
//! per-session frame order is preserved end to end.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use stark_auth::{Principal, TokenVerifier};
use stark_core::proto::{Body, Frame};
use stark_core::{CoreError, NodeId};
use stark_store::Store;

use crate::state::SharedState;

/// `GET /api/v1/agents/ws`
pub async fn agent_ws_handler<S: Store + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<SharedState<S>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket<S: Store + 'static>(socket: WebSocket, state: SharedState<S>) {
    let (mut sink, mut stream) = socket.split();

    let node_id = match handshake(&mut sink, &mut stream, &state).await {
        Ok(node_id) => node_id,
        Err(e) => {
            tracing::info!(error = %e, "Agent handshake failed");
            let _ = sink.close().await;
            return;
        }
    };

    let outbound = state.orchestrator.sessions().register_session(node_id);
    state.orchestrator.session_established(&node_id);
    let writer = tokio::spawn(write_loop(sink, outbound, node_id));

    read_loop(&mut stream, &state, node_id).await;

    state.orchestrator.sessions().remove_session(&node_id);
    writer.abort();
    tracing::info!(node_id = %node_id, "Agent session closed");
}

/// Run the two-frame handshake; returns the registered node's ID.
async fn handshake<S: Store + 'static>(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    state: &SharedState<S>,
) -> stark_core::Result<NodeId> {
    // Frame 1: auth.
    let frame = next_frame(stream).await?;
    let Body::Auth { token } = frame.body else {
        return Err(CoreError::Invalid(format!(
            "expected auth frame, got {}",
            frame.body.kind()
        )));
    };
    let claims = state
        .tokens
        .verify(&token)
        .await
        .map_err(|e| CoreError::Auth(e.to_string()))?;
    let node_name = match claims.principal {
        Principal::Node(name) => name,
        other => {
            return Err(CoreError::Auth(format!(
                "{} token cannot open an agent session",
                other.kind()
            )))
        }
    };
    if let Some(corr) = frame.correlation_id {
        send_frame(sink, &Frame::reply_ok(corr, &serde_json::json!({}))?).await?;
    }

    // Frame 2: register.
    let frame = next_frame(stream).await?;
    let Body::Register(registration) = frame.body else {
        return Err(CoreError::Invalid(format!(
            "expected register frame, got {}",
            frame.body.kind()
        )));
    };
    if registration.node_name != node_name {
        return Err(CoreError::Auth(format!(
            "token subject {node_name} does not match registration {}",
            registration.node_name
        )));
    }

    let ack = state
        .orchestrator
        .handle_register(&registration)
        .map_err(CoreError::from)?;
    let node_id = ack.node_id;
    if let Some(corr) = frame.correlation_id {
        send_frame(sink, &Frame::reply_ok(corr, &ack)?).await?;
    }

    tracing::info!(node_id = %node_id, name = %node_name, "Agent session established");
    Ok(node_id)
}

/// Forward hub-queued frames onto the socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    node_id: NodeId,
) {
    while let Some(frame) = outbound.recv().await {
        match frame.encode() {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    tracing::debug!(node_id = %node_id, "Agent socket write failed");
                    break;
                }
            }
            Err(e) => {
                tracing::error!(node_id = %node_id, error = %e, "Unencodable outbound frame");
            }
        }
    }
    let _ = sink.close().await;
}

/// Route inbound frames until the socket closes.
async fn read_loop<S: Store + 'static>(
    stream: &mut SplitStream<WebSocket>,
    state: &SharedState<S>,
    node_id: NodeId,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Undecodable agent frame");
                continue;
            }
        };

        if let Some(reply) = state.orchestrator.handle_frame(&node_id, frame).await {
            if let Err(e) = state.orchestrator.sessions().send_frame(&node_id, reply) {
                tracing::debug!(node_id = %node_id, error = %e, "Reply enqueue failed");
                break;
            }
        }
    }
}

async fn next_frame(stream: &mut SplitStream<WebSocket>) -> stark_core::Result<Frame> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Frame::decode(&text),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(_)) | None => return Err(CoreError::TransportClosed),
            Some(Err(_)) => return Err(CoreError::TransportClosed),
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> stark_core::Result<()> {
    sink.send(Message::Text(frame.encode()?))
        .await
        .map_err(|_| CoreError::TransportClosed)
}
