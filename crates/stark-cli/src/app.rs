//! Command-line definitions and execution.

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use crate::client::{ApiClient, CliError, Result};

/// stark - workload orchestrator CLI.
#[derive(Debug, Parser)]
#[command(name = "stark", version, about = "Manage the stark orchestrator")]
pub struct Cli {
    /// Gateway base URL.
    #[arg(long, env = "STARK_API_URL", default_value = "http://127.0.0.1:7443")]
    pub api_url: String,

    /// Bearer token for the admin surface.
    #[arg(long, env = "STARK_TOKEN", hide_env_values = true)]
    pub token: String,

    #[command(subcommand)]
    pub command: TopCommand,
}

/// Top-level command groups.
#[derive(Debug, Subcommand)]
pub enum TopCommand {
    /// Manage services.
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Manage nodes.
    #[command(subcommand)]
    Node(NodeCommand),
    /// Manage network policy.
    #[command(subcommand)]
    Network(NetworkCommand),
    /// Manage packs.
    #[command(subcommand)]
    Pack(PackCommand),
    /// Inspect pods.
    #[command(subcommand)]
    Pod(PodCommand),
}

/// Service operations.
#[derive(Debug, Subcommand)]
pub enum ServiceCommand {
    /// Create a service.
    Create(CreateServiceArgs),
    /// List services.
    List,
    /// Show one service.
    Get {
        /// Service ID.
        id: String,
    },
    /// Change the desired replica count.
    Scale {
        /// Service ID.
        id: String,
        /// New replica count; 0 designates a DaemonSet.
        replicas: u32,
    },
    /// Roll the service to a new pack version.
    Rollout {
        /// Service ID.
        id: String,
        /// Target version; omitted rolls to the latest published version.
        #[arg(long)]
        version: Option<String>,
    },
    /// Delete a service and stop its pods.
    Delete {
        /// Service ID.
        id: String,
    },
}

/// Arguments for service creation.
#[derive(Debug, Args)]
pub struct CreateServiceArgs {
    /// Service ID (overlay hostname label).
    pub id: String,
    /// Pack name to run.
    #[arg(long)]
    pub pack: String,
    /// Pack version; omitted follows the latest.
    #[arg(long)]
    pub version: Option<String>,
    /// Desired replicas; 0 designates a DaemonSet.
    #[arg(long, default_value_t = 1)]
    pub replicas: u32,
    /// Overlay visibility: public, private, or system.
    #[arg(long, default_value = "private")]
    pub visibility: String,
    /// Expose the service to external ingress.
    #[arg(long)]
    pub exposed: bool,
    /// Services allowed to call this one (repeatable).
    #[arg(long = "allow")]
    pub allowed_sources: Vec<String>,
    /// Ingress port when exposed.
    #[arg(long)]
    pub ingress_port: Option<u16>,
}

/// Node operations.
#[derive(Debug, Subcommand)]
pub enum NodeCommand {
    /// Enroll a new node: mints the token its agent connects with.
    Register {
        /// Node name.
        name: String,
    },
    /// List nodes.
    List,
    /// Close a node to new placements.
    Cordon {
        /// Node ID.
        id: String,
    },
    /// Reopen a cordoned node.
    Uncordon {
        /// Node ID.
        id: String,
    },
    /// Drain a node: cordon it and reschedule its pods elsewhere.
    Drain {
        /// Node ID.
        id: String,
    },
}

/// Network policy operations.
#[derive(Debug, Subcommand)]
pub enum NetworkCommand {
    /// Allow traffic from one service to another.
    Allow {
        /// Calling service.
        source: String,
        /// Called service.
        target: String,
    },
    /// Deny traffic from one service to another.
    Deny {
        /// Calling service.
        source: String,
        /// Called service.
        target: String,
    },
    /// Remove the explicit rule for a pair.
    Remove {
        /// Calling service.
        source: String,
        /// Called service.
        target: String,
    },
    /// List explicit rules.
    List,
}

/// Pack operations.
#[derive(Debug, Subcommand)]
pub enum PackCommand {
    /// Publish a pack bundle.
    Publish {
        /// Pack name.
        name: String,
        /// Version string.
        version: String,
        /// Path to the bundle file.
        #[arg(long)]
        file: std::path::PathBuf,
        /// Runtime requirement: server, browser, or universal.
        #[arg(long, default_value = "universal")]
        runtime: String,
        /// Grant the pack the ephemeral plane.
        #[arg(long)]
        ephemeral: bool,
    },
    /// List packs.
    List,
}

/// Pod operations.
#[derive(Debug, Subcommand)]
pub enum PodCommand {
    /// List pods.
    List,
    /// Show one pod.
    Get {
        /// Pod ID.
        id: String,
    },
    /// Show a pod's history.
    History {
        /// Pod ID.
        id: String,
    },
}

/// Execute a parsed command against the gateway.
pub async fn run(cli: Cli) -> Result<()> {
    let client = ApiClient::new(&cli.api_url, &cli.token);
    match cli.command {
        TopCommand::Service(command) => run_service(&client, command).await,
        TopCommand::Node(command) => run_node(&client, command).await,
        TopCommand::Network(command) => run_network(&client, command).await,
        TopCommand::Pack(command) => run_pack(&client, command).await,
        TopCommand::Pod(command) => run_pod(&client, command).await,
    }
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

async fn run_service(client: &ApiClient, command: ServiceCommand) -> Result<()> {
    match command {
        ServiceCommand::Create(args) => {
            let body = json!({
                "id": args.id,
                "packName": args.pack,
                "packVersion": args.version,
                "replicas": args.replicas,
                "visibility": args.visibility,
                "exposed": args.exposed,
                "allowedSources": args.allowed_sources,
                "ingressPort": args.ingress_port,
            });
            let service: Value = client.post("/api/v1/services", &body).await?;
            print_json(&service);
        }
        ServiceCommand::List => {
            let services: Value = client.get("/api/v1/services").await?;
            print_json(&services);
        }
        ServiceCommand::Get { id } => {
            let service: Value = client.get(&format!("/api/v1/services/{id}")).await?;
            print_json(&service);
        }
        ServiceCommand::Scale { id, replicas } => {
            let body = json!({ "replicas": replicas });
            let service: Value = client
                .post(&format!("/api/v1/services/{id}/scale"), &body)
                .await?;
            print_json(&service);
        }
        ServiceCommand::Rollout { id, version } => {
            let body = json!({ "packVersion": version });
            let service: Value = client
                .post(&format!("/api/v1/services/{id}/rollout"), &body)
                .await?;
            print_json(&service);
        }
        ServiceCommand::Delete { id } => {
            let result: Value = client
                .delete(&format!("/api/v1/services/{id}"), None)
                .await?;
            print_json(&result);
        }
    }
    Ok(())
}

async fn run_node(client: &ApiClient, command: NodeCommand) -> Result<()> {
    match command {
        NodeCommand::Register { name } => {
            let body = json!({ "nodeName": name });
            let result: Value = client.post("/api/v1/nodes/enroll", &body).await?;
            print_json(&result);
        }
        NodeCommand::List => {
            let nodes: Value = client.get("/api/v1/nodes").await?;
            print_json(&nodes);
        }
        NodeCommand::Cordon { id } => {
            let node: Value = client
                .post(&format!("/api/v1/nodes/{id}/cordon"), &json!({}))
                .await?;
            print_json(&node);
        }
        NodeCommand::Uncordon { id } => {
            let node: Value = client
                .post(&format!("/api/v1/nodes/{id}/uncordon"), &json!({}))
                .await?;
            print_json(&node);
        }
        NodeCommand::Drain { id } => {
            let result: Value = client
                .post(&format!("/api/v1/nodes/{id}/drain"), &json!({}))
                .await?;
            print_json(&result);
        }
    }
    Ok(())
}

async fn run_network(client: &ApiClient, command: NetworkCommand) -> Result<()> {
    match command {
        NetworkCommand::Allow { source, target } => {
            let body = json!({ "source": source, "target": target });
            let rule: Value = client.post("/api/v1/policies/allow", &body).await?;
            print_json(&rule);
        }
        NetworkCommand::Deny { source, target } => {
            let body = json!({ "source": source, "target": target });
            let rule: Value = client.post("/api/v1/policies/deny", &body).await?;
            print_json(&rule);
        }
        NetworkCommand::Remove { source, target } => {
            let body = json!({ "source": source, "target": target });
            let result: Value = client.delete("/api/v1/policies", Some(&body)).await?;
            print_json(&result);
        }
        NetworkCommand::List => {
            let rules: Value = client.get("/api/v1/policies").await?;
            print_json(&rules);
        }
    }
    Ok(())
}

async fn run_pack(client: &ApiClient, command: PackCommand) -> Result<()> {
    match command {
        PackCommand::Publish {
            name,
            version,
            file,
            runtime,
            ephemeral,
        } => {
            use base64::Engine as _;
            let bytes = std::fs::read(&file)
                .map_err(|e| CliError::User(format!("cannot read {}: {e}", file.display())))?;
            let body = json!({
                "name": name,
                "version": version,
                "runtimeTag": runtime,
                "bundle": base64::engine::general_purpose::STANDARD.encode(bytes),
                "enableEphemeral": ephemeral,
            });
            let pack: Value = client.post("/api/v1/packs", &body).await?;
            print_json(&pack);
        }
        PackCommand::List => {
            let packs: Value = client.get("/api/v1/packs").await?;
            print_json(&packs);
        }
    }
    Ok(())
}

async fn run_pod(client: &ApiClient, command: PodCommand) -> Result<()> {
    match command {
        PodCommand::List => {
            let pods: Value = client.get("/api/v1/pods").await?;
            print_json(&pods);
        }
        PodCommand::Get { id } => {
            let pod: Value = client.get(&format!("/api/v1/pods/{id}")).await?;
            print_json(&pod);
        }
        PodCommand::History { id } => {
            let history: Value = client.get(&format!("/api/v1/pods/{id}/history")).await?;
            print_json(&history);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_network_allow() {
        let cli = Cli::try_parse_from([
            "stark",
            "--token",
            "t",
            "network",
            "allow",
            "api",
            "billing",
        ])
        .unwrap();
        match cli.command {
            TopCommand::Network(NetworkCommand::Allow { source, target }) => {
                assert_eq!(source, "api");
                assert_eq!(target, "billing");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_service_create_with_allows() {
        let cli = Cli::try_parse_from([
            "stark",
            "--token",
            "t",
            "service",
            "create",
            "billing",
            "--pack",
            "billing-api",
            "--replicas",
            "3",
            "--visibility",
            "private",
            "--allow",
            "api",
            "--allow",
            "web",
        ])
        .unwrap();
        match cli.command {
            TopCommand::Service(ServiceCommand::Create(args)) => {
                assert_eq!(args.id, "billing");
                assert_eq!(args.replicas, 3);
                assert_eq!(args.allowed_sources, vec!["api", "web"]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_node_drain() {
        let cli =
            Cli::try_parse_from(["stark", "--token", "t", "node", "drain", "some-node-id"]).unwrap();
        assert!(matches!(
            cli.command,
            TopCommand::Node(NodeCommand::Drain { .. })
        ));
    }
}
