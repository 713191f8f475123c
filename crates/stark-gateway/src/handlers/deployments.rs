//! Deployment CRUD and scale handlers.

use axum::extract::{Path, State};
use axum::Json;

use stark_control::CreateDeploymentRequest;
use stark_core::DeploymentId;
use stark_store::{Deployment, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::handlers::services::ScaleRequest;
use crate::state::SharedState;

fn parse_deployment_id(raw: &str) -> Result<DeploymentId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid deployment id {raw}")))
}

/// `POST /api/v1/deployments`
pub async fn create<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state.orchestrator.create_deployment(request)?;
    tracing::info!(
        user = %user.user,
        deployment_id = %deployment.id,
        "Deployment created via API"
    );
    Ok(Json(deployment))
}

/// `GET /api/v1/deployments`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.orchestrator.list_deployments()?))
}

/// `GET /api/v1/deployments/:id`
pub async fn get<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let id = parse_deployment_id(&id)?;
    Ok(Json(state.orchestrator.get_deployment(&id)?))
}

/// `POST /api/v1/deployments/:id/scale`
pub async fn scale<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<Deployment>, ApiError> {
    let id = parse_deployment_id(&id)?;
    let deployment = state.orchestrator.scale_deployment(&id, request.replicas)?;
    tracing::info!(
        user = %user.user,
        deployment_id = %id,
        replicas = request.replicas,
        "Deployment scaled via API"
    );
    Ok(Json(deployment))
}
