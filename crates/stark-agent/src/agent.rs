//! The agent root: owns one session's worth of wiring and the reconnect
//! loop.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::netstack::NetworkStack;
use crate::runtime::{AgentRuntime, PodRouter};
use crate::session::{ControlChannel, Session};

/// A node agent process.
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    /// Create an agent from config.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run forever: connect, serve, reconnect with backoff on session
    /// loss. Pods keep running across reconnects; their stack state is
    /// rebuilt when the new session registers.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = self.config.reconnect_backoff;
        loop {
            match self.run_session().await {
                Ok(()) => {
                    tracing::info!("Session ended, reconnecting");
                    backoff = self.config.reconnect_backoff;
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?backoff, "Session failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(std::time::Duration::from_secs(60));
                }
            }
        }
    }

    /// One connected session: wire the stack, pump until the transport
    /// closes.
    async fn run_session(&self) -> Result<()> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

        let session = Session::connect(&self.config, command_tx, signal_tx).await?;
        let channel: Arc<dyn ControlChannel> = Arc::clone(&session) as Arc<dyn ControlChannel>;

        let router = Arc::new(PodRouter::new());
        let netstack = NetworkStack::new(
            session.node_id(),
            Arc::clone(&channel),
            Arc::clone(&self.config),
            Arc::clone(&router) as Arc<dyn crate::netstack::InboundHandler>,
        );

        let mut tasks = Vec::new();

        if let Some(addr) = &self.config.peer_listen_addr {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let peers = Arc::clone(netstack.peers());
            tasks.push(tokio::spawn(peers.run_listener(listener)));
        }

        let runtime = AgentRuntime::new(
            Arc::clone(&self.config),
            Arc::clone(&channel),
            Arc::clone(&netstack),
            Arc::clone(&router),
        );
        tasks.push(tokio::spawn(
            Arc::clone(&runtime).run_commands(command_rx),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&runtime).run_heartbeats(session.heartbeat_interval()),
        ));

        let peers = Arc::clone(netstack.peers());
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                peers.handle_signal(signal).await;
            }
        }));

        session.closed().await;
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}
