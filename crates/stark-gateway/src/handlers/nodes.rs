//! Node admin handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use stark_core::NodeId;
use stark_store::{Node, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::SharedState;

/// Body of the node enrollment operation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollNodeRequest {
    /// Name the agent will register under.
    pub node_name: String,
}

/// `POST /api/v1/nodes/enroll`: mint a node token for a new agent.
pub async fn enroll<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<EnrollNodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state
        .tokens
        .issue_node_token(&request.node_name)
        .map_err(ApiError::from)?;
    tracing::info!(user = %user.user, node_name = %request.node_name, "Node enrolled via API");
    Ok(Json(serde_json::json!({
        "nodeName": request.node_name,
        "token": token,
    })))
}

fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid node id {raw}")))
}

/// `GET /api/v1/nodes`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<Node>>, ApiError> {
    Ok(Json(state.orchestrator.list_nodes()?))
}

/// `POST /api/v1/nodes/:id/cordon`
pub async fn cordon<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    let id = parse_node_id(&id)?;
    let node = state.orchestrator.cordon_node(&id)?;
    tracing::info!(user = %user.user, node_id = %id, "Node cordoned via API");
    Ok(Json(node))
}

/// `POST /api/v1/nodes/:id/uncordon`
pub async fn uncordon<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    let id = parse_node_id(&id)?;
    let node = state.orchestrator.uncordon_node(&id)?;
    tracing::info!(user = %user.user, node_id = %id, "Node uncordoned via API");
    Ok(Json(node))
}

/// `POST /api/v1/nodes/:id/drain`
pub async fn drain<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_node_id(&id)?;
    let evicted = state.orchestrator.drain_node(&id)?;
    tracing::info!(user = %user.user, node_id = %id, evicted, "Node drained via API");
    Ok(Json(serde_json::json!({ "evicted": evicted })))
}

/// `DELETE /api/v1/nodes/:id`
pub async fn deregister<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_node_id(&id)?;
    state.orchestrator.nodes().deregister(&id)?;
    tracing::info!(user = %user.user, node_id = %id, "Node deregistered via API");
    Ok(Json(serde_json::json!({ "deregistered": true })))
}
