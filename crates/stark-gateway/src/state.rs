//! Gateway application state.

use std::sync::Arc;

use stark_auth::TokenAuthority;
use stark_control::Orchestrator;
use stark_store::Store;

use crate::config::GatewayConfig;

/// Shared state available to all request handlers.
pub struct GatewayState<S> {
    /// The orchestrator control plane.
    pub orchestrator: Arc<Orchestrator<S>>,
    /// The token authority for request authentication.
    pub tokens: Arc<TokenAuthority>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<S: Store> GatewayState<S> {
    /// Create a new gateway state.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator<S>>,
        tokens: Arc<TokenAuthority>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            orchestrator,
            tokens,
            config,
        }
    }
}

impl<S> Clone for GatewayState<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            tokens: Arc::clone(&self.tokens),
            config: self.config.clone(),
        }
    }
}

/// The state as handlers receive it.
pub type SharedState<S> = Arc<GatewayState<S>>;
