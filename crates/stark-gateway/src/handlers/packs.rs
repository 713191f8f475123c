//! Pack publish and listing handlers.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use stark_control::PublishPackRequest;
use stark_core::state::Namespace;
use stark_core::{PackId, RuntimeTag};
use stark_store::{Pack, Store};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::SharedState;

/// A pack as returned by the API: everything but the bundle bytes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackSummary {
    /// Pack identity.
    pub id: PackId,
    /// Pack name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Runtime requirement.
    pub runtime_tag: RuntimeTag,
    /// Namespace.
    pub namespace: Namespace,
    /// Bundle size in bytes.
    pub bundle_bytes: usize,
    /// Whether pods opt into the ephemeral plane.
    pub enable_ephemeral: bool,
    /// Publication time.
    pub published_at: DateTime<Utc>,
}

impl From<Pack> for PackSummary {
    fn from(pack: Pack) -> Self {
        Self {
            id: pack.id,
            name: pack.name,
            version: pack.version,
            runtime_tag: pack.runtime_tag,
            namespace: pack.namespace,
            bundle_bytes: pack.bundle.len(),
            enable_ephemeral: pack.enable_ephemeral,
            published_at: pack.published_at,
        }
    }
}

/// `POST /api/v1/packs`
pub async fn publish<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    user: AuthUser,
    Json(request): Json<PublishPackRequest>,
) -> Result<Json<PackSummary>, ApiError> {
    let pack = state.orchestrator.publish_pack(request)?;
    tracing::info!(user = %user.user, pack = %pack.name, version = %pack.version, "Pack published");
    Ok(Json(pack.into()))
}

/// `GET /api/v1/packs`
pub async fn list<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    _user: AuthUser,
) -> Result<Json<Vec<PackSummary>>, ApiError> {
    let mut packs: Vec<PackSummary> = state
        .orchestrator
        .list_packs()?
        .into_iter()
        .map(PackSummary::from)
        .collect();
    packs.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
    Ok(Json(packs))
}
