//! Agent configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use stark_core::{Resources, RuntimeType, Taint};

/// Configuration for one node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Orchestrator session endpoint, e.g.
    /// `ws://orchestrator:7443/api/v1/agents/ws`.
    pub orchestrator_url: String,
    /// Node token presented in the auth frame.
    pub node_token: String,
    /// Node name; stable across restarts so the node keeps its identity.
    pub node_name: String,
    /// Runtime class of this host.
    pub runtime_type: RuntimeType,
    /// Capabilities this node can grant to packs.
    pub capabilities: Vec<String>,
    /// Total allocatable resources advertised at registration.
    pub allocatable: Resources,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    pub taints: Vec<Taint>,
    /// Address the peer listener binds; `None` disables inbound peers
    /// (worker-class nodes behind a proxying main thread).
    pub peer_listen_addr: Option<String>,
    /// Address other agents should dial; defaults to `peer_listen_addr`.
    pub peer_advertise_addr: Option<String>,
    /// Command template for server isolates; `{bundle}` is replaced with
    /// the bundle path.
    pub isolate_command: Vec<String>,
    /// Directory pod bundles are materialized under.
    pub work_dir: std::path::PathBuf,
    /// Peer-channel connect timeout.
    pub connect_timeout: Duration,
    /// Default deadline for outbound request envelopes.
    pub request_timeout: Duration,
    /// Default deadline for ephemeral fan-out queries.
    pub query_timeout: Duration,
    /// Session reconnect backoff floor.
    pub reconnect_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "ws://127.0.0.1:7443/api/v1/agents/ws".to_string(),
            node_token: String::new(),
            node_name: "node-1".to_string(),
            runtime_type: RuntimeType::Server,
            capabilities: Vec::new(),
            allocatable: Resources {
                cpu_millis: 4000,
                mem_bytes: 8 << 30,
                storage_bytes: 50 << 30,
                pods: 32,
            },
            labels: BTreeMap::new(),
            taints: Vec::new(),
            peer_listen_addr: Some("0.0.0.0:7700".to_string()),
            peer_advertise_addr: None,
            isolate_command: vec!["node".to_string(), "{bundle}".to_string()],
            work_dir: std::env::temp_dir().join("stark-agent"),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// `STARK_ORCHESTRATOR_URL`, `STARK_NODE_TOKEN`, `STARK_NODE_NAME`,
    /// `STARK_RUNTIME_TYPE` (`server`/`browser`), `STARK_CAPABILITIES`
    /// (comma-separated), `STARK_PEER_LISTEN_ADDR`,
    /// `STARK_PEER_ADVERTISE_ADDR`, `STARK_ISOLATE_COMMAND`
    /// (space-separated), `STARK_WORK_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("STARK_ORCHESTRATOR_URL") {
            config.orchestrator_url = val;
        }
        if let Ok(val) = std::env::var("STARK_NODE_TOKEN") {
            config.node_token = val;
        }
        if let Ok(val) = std::env::var("STARK_NODE_NAME") {
            config.node_name = val;
        }
        if let Ok(val) = std::env::var("STARK_RUNTIME_TYPE") {
            config.runtime_type = match val.to_lowercase().as_str() {
                "browser" => RuntimeType::Browser,
                _ => RuntimeType::Server,
            };
        }
        if let Ok(val) = std::env::var("STARK_CAPABILITIES") {
            config.capabilities = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(val) = std::env::var("STARK_PEER_LISTEN_ADDR") {
            config.peer_listen_addr = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var("STARK_PEER_ADVERTISE_ADDR") {
            config.peer_advertise_addr = Some(val);
        }
        if let Ok(val) = std::env::var("STARK_ISOLATE_COMMAND") {
            config.isolate_command = val.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(val) = std::env::var("STARK_WORK_DIR") {
            config.work_dir = val.into();
        }
        config
    }

    /// The address advertised to peers.
    #[must_use]
    pub fn advertised_peer_addr(&self) -> Option<String> {
        self.peer_advertise_addr
            .clone()
            .or_else(|| self.peer_listen_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.runtime_type, RuntimeType::Server);
    }

    #[test]
    fn advertise_falls_back_to_listen() {
        let mut config = AgentConfig::default();
        config.peer_listen_addr = Some("0.0.0.0:7700".into());
        config.peer_advertise_addr = None;
        assert_eq!(config.advertised_peer_addr().as_deref(), Some("0.0.0.0:7700"));

        config.peer_advertise_addr = Some("198.51.100.7:7700".into());
        assert_eq!(
            config.advertised_peer_addr().as_deref(),
            Some("198.51.100.7:7700")
        );
    }
}
