//! stark node agent binary.

use stark_agent::{Agent, AgentConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stark=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env();
    if config.node_token.is_empty() {
        return Err("STARK_NODE_TOKEN must be set".into());
    }

    tracing::info!(
        node_name = %config.node_name,
        orchestrator = %config.orchestrator_url,
        runtime_type = ?config.runtime_type,
        "Starting stark agent"
    );

    Agent::new(config).run().await?;
    Ok(())
}
