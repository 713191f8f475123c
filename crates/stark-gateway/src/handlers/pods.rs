//! Pod read handlers.

use axum::extract::{Path, State};
use axum::Json;

use stark_core::PodId;
use stark_store::{Pod, PodHistoryEntry, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::SharedState;

fn parse_pod_id(raw: &str) -> Result<PodId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid pod id {raw}")))
}

/// `GET /api/v1/pods`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<Pod>>, ApiError> {
    let mut pods = state.orchestrator.list_pods()?;
    pods.sort_by_key(|p| p.created_at);
    Ok(Json(pods))
}

/// `GET /api/v1/pods/:id`
pub async fn get<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Pod>, ApiError> {
    let id = parse_pod_id(&id)?;
    Ok(Json(state.orchestrator.get_pod(&id)?))
}

/// `GET /api/v1/pods/:id/history`
pub async fn history<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<PodHistoryEntry>>, ApiError> {
    let id = parse_pod_id(&id)?;
    Ok(Json(state.orchestrator.pod_history(&id)?))
}
