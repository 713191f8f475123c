//! Health and readiness probes.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Liveness probe.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "stark-gateway",
    })
}

/// Readiness probe.
pub async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}
