//! stark orchestrator - gateway binary.
//!
//! Wires the store, token authority, control plane, scheduler, liveness
//! monitor, and pod-group reaper, then serves the HTTP/WS surface.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stark_auth::{AuthConfig, TokenAuthority};
use stark_control::{ControlConfig, LivenessMonitor, Orchestrator};
use stark_gateway::{router, GatewayConfig, GatewayState};
use stark_scheduler::{Scheduler, SchedulerConfig};
use stark_store::MemStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stark=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting stark gateway");

    let gateway_config = GatewayConfig::from_env();
    let control_config = ControlConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env();
    let auth_config = AuthConfig::from_env();
    if auth_config.secret.is_empty() {
        return Err("STARK_AUTH_SECRET must be set".into());
    }

    let store = Arc::new(MemStore::new());
    let tokens = Arc::new(TokenAuthority::new(auth_config));

    // Dev convenience: print ready-made tokens so an operator and an agent
    // can connect without a separate enrollment flow.
    if std::env::var("STARK_DEV_TOKENS").as_deref() == Ok("1") {
        let admin = tokens.issue_user_token("admin", 24 * 3600)?;
        tracing::info!(token = %admin, "Dev admin token");
        for name in ["node-1", "node-2", "node-3"] {
            let token = tokens.issue_node_token(name)?;
            tracing::info!(node = name, token = %token, "Dev node token");
        }
    }

    let (orchestrator, trigger_rx) = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&tokens),
        control_config.clone(),
    );
    let orchestrator = Arc::new(orchestrator);

    // Scheduler reconcile loop.
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(orchestrator.lifecycle().clone()),
        scheduler_config,
    );
    tokio::spawn(async move {
        scheduler.run(trigger_rx).await;
    });

    // Node liveness monitor.
    let monitor = LivenessMonitor::new(
        Arc::new(stark_control::NodeRegistry::new(Arc::clone(&store))),
        orchestrator.lifecycle().clone(),
        control_config.clone(),
    );
    tokio::spawn(async move {
        monitor.run().await;
    });

    // Pod-group reaper.
    let reaper_orchestrator = Arc::clone(&orchestrator);
    let reaper_interval = control_config.reaper_interval();
    tokio::spawn(async move {
        reaper_orchestrator.groups().run_reaper(reaper_interval).await;
    });

    let state = Arc::new(GatewayState::new(
        Arc::clone(&orchestrator),
        tokens,
        gateway_config.clone(),
    ));
    let app = router(state);

    tracing::info!(listen_addr = %gateway_config.listen_addr, "Serving");
    let listener = tokio::net::TcpListener::bind(&gateway_config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
