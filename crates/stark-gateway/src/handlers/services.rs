//! Service CRUD, scale, and rollout handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use stark_control::{CreateServiceRequest, RolloutRequest};
use stark_core::ServiceId;
use stark_store::{Service, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::SharedState;

fn parse_service_id(raw: &str) -> Result<ServiceId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid service id {raw}: {e}")))
}

/// `POST /api/v1/services`
pub async fn create<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<CreateServiceRequest>,
) -> Result<Json<Service>, ApiError> {
    let service = state.orchestrator.create_service(request)?;
    tracing::info!(user = %user.user, service_id = %service.id, "Service created via API");
    Ok(Json(service))
}

/// `GET /api/v1/services`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<Service>>, ApiError> {
    Ok(Json(state.orchestrator.list_services()?))
}

/// `GET /api/v1/services/:id`
pub async fn get<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Service>, ApiError> {
    let id = parse_service_id(&id)?;
    Ok(Json(state.orchestrator.get_service(&id)?))
}

/// `DELETE /api/v1/services/:id`
pub async fn delete<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_service_id(&id)?;
    state.orchestrator.delete_service(&id)?;
    tracing::info!(user = %user.user, service_id = %id, "Service deleted via API");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Body of the scale operation.
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    /// New desired replica count; `0` designates a DaemonSet.
    pub replicas: u32,
}

/// `POST /api/v1/services/:id/scale`
pub async fn scale<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<Service>, ApiError> {
    let id = parse_service_id(&id)?;
    let service = state.orchestrator.scale_service(&id, request.replicas)?;
    tracing::info!(
        user = %user.user,
        service_id = %id,
        replicas = request.replicas,
        "Service scaled via API"
    );
    Ok(Json(service))
}

/// `POST /api/v1/services/:id/rollout`
pub async fn rollout<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<RolloutRequest>,
) -> Result<Json<Service>, ApiError> {
    let id = parse_service_id(&id)?;
    let service = state.orchestrator.rollout_service(&id, &request)?;
    tracing::info!(
        user = %user.user,
        service_id = %id,
        version = %service.pack_version,
        "Service rollout via API"
    );
    Ok(Json(service))
}
