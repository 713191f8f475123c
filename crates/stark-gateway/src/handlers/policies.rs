//! Network policy handlers.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use stark_core::state::Namespace;
use stark_core::ServiceId;
use stark_store::{NetworkPolicy, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::SharedState;

/// Body naming a service pair.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPairRequest {
    /// Calling service.
    pub source: ServiceId,
    /// Called service.
    pub target: ServiceId,
    /// Namespace; defaults to the user namespace.
    #[serde(default)]
    pub namespace: Namespace,
}

/// `POST /api/v1/policies/allow`
pub async fn allow<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<PolicyPairRequest>,
) -> Result<Json<NetworkPolicy>, ApiError> {
    let rule = state.orchestrator.allow_traffic(
        &request.source,
        &request.target,
        request.namespace,
    )?;
    tracing::info!(
        user = %user.user,
        source = %request.source,
        target = %request.target,
        "Allow rule added via API"
    );
    Ok(Json(rule))
}

/// `POST /api/v1/policies/deny`
pub async fn deny<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<PolicyPairRequest>,
) -> Result<Json<NetworkPolicy>, ApiError> {
    let rule = state.orchestrator.deny_traffic(
        &request.source,
        &request.target,
        request.namespace,
    )?;
    tracing::info!(
        user = %user.user,
        source = %request.source,
        target = %request.target,
        "Deny rule added via API"
    );
    Ok(Json(rule))
}

/// `DELETE /api/v1/policies`
pub async fn remove<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<PolicyPairRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.orchestrator.policy().remove_rule(
        &request.source,
        &request.target,
        request.namespace,
    )?;
    tracing::info!(
        user = %user.user,
        source = %request.source,
        target = %request.target,
        removed,
        "Policy rule removed via API"
    );
    Ok(Json(serde_json::json!({ "removed": removed })))
}

/// `GET /api/v1/policies`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<NetworkPolicy>>, ApiError> {
    let mut rules = state.orchestrator.policy().list_rules(Namespace::User)?;
    rules.extend(state.orchestrator.policy().list_rules(Namespace::System)?);
    Ok(Json(rules))
}
