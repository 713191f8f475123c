//! Route table for the gateway.

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use stark_store::Store;

use crate::handlers;
use crate::state::SharedState;

/// Build the full router over the shared state.
pub fn router<S: Store + 'static>(state: SharedState<S>) -> Router {
    let api = Router::new()
        // Packs
        .route(
            "/packs",
            post(handlers::packs::publish::<S>).get(handlers::packs::list::<S>),
        )
        // Services
        .route(
            "/services",
            post(handlers::services::create::<S>).get(handlers::services::list::<S>),
        )
        .route(
            "/services/:id",
            get(handlers::services::get::<S>).delete(handlers::services::delete::<S>),
        )
        .route("/services/:id/scale", post(handlers::services::scale::<S>))
        .route(
            "/services/:id/rollout",
            post(handlers::services::rollout::<S>),
        )
        // Deployments
        .route(
            "/deployments",
            post(handlers::deployments::create::<S>).get(handlers::deployments::list::<S>),
        )
        .route("/deployments/:id", get(handlers::deployments::get::<S>))
        .route(
            "/deployments/:id/scale",
            post(handlers::deployments::scale::<S>),
        )
        // Nodes
        .route("/nodes", get(handlers::nodes::list::<S>))
        .route("/nodes/enroll", post(handlers::nodes::enroll::<S>))
        .route("/nodes/:id", delete(handlers::nodes::deregister::<S>))
        .route("/nodes/:id/cordon", post(handlers::nodes::cordon::<S>))
        .route("/nodes/:id/uncordon", post(handlers::nodes::uncordon::<S>))
        .route("/nodes/:id/drain", post(handlers::nodes::drain::<S>))
        // Pods
        .route("/pods", get(handlers::pods::list::<S>))
        .route("/pods/:id", get(handlers::pods::get::<S>))
        .route("/pods/:id/history", get(handlers::pods::history::<S>))
        // Network policy
        .route(
            "/policies",
            get(handlers::policies::list::<S>).delete(handlers::policies::remove::<S>),
        )
        .route("/policies/allow", post(handlers::policies::allow::<S>))
        .route("/policies/deny", post(handlers::policies::deny::<S>))
        // Agent sessions
        .route("/agents/ws", get(handlers::agents::agent_ws_handler::<S>));

    let body_limit = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();
    Router::new()
        .route("/health", get(handlers::health::health_handler))
        .route("/ready", get(handlers::health::ready_handler))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
