//! The node liveness monitor.
//!
//! Scans heartbeat timestamps on a fixed cadence: a node silent past the
//! `NotReady` threshold stops receiving placements; past the `Lost`
//! threshold its pods are failed over and rescheduled.

use chrono::Utc;
use std::sync::Arc;

use stark_core::NodeStatus;
use stark_store::Store;

use crate::lifecycle::LifecycleController;
use crate::registry::NodeRegistry;
use crate::types::ControlConfig;

/// Watches node heartbeats and drives `NotReady`/`Lost` demotions.
pub struct LivenessMonitor<S> {
    nodes: Arc<NodeRegistry<S>>,
    lifecycle: LifecycleController<S>,
    config: ControlConfig,
}

impl<S: Store + 'static> LivenessMonitor<S> {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        nodes: Arc<NodeRegistry<S>>,
        lifecycle: LifecycleController<S>,
        config: ControlConfig,
    ) -> Self {
        Self {
            nodes,
            lifecycle,
            config,
        }
    }

    /// Run one scan. Returns `(not_ready, lost)` demotion counts.
    pub fn check_once(&self) -> (u32, u32) {
        let (not_ready_after, lost_after) = self.config.liveness_thresholds();
        let now = Utc::now();
        let mut not_ready = 0;
        let mut lost = 0;

        let nodes = match self.nodes.list(None) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "Liveness scan failed to list nodes");
                return (0, 0);
            }
        };

        for node in nodes {
            let silent_for = now - node.last_heartbeat;

            if silent_for > lost_after && node.status != NodeStatus::Lost {
                tracing::warn!(
                    node_id = %node.id,
                    silent_secs = silent_for.num_seconds(),
                    "Node lost"
                );
                if let Err(e) = self.nodes.mark_lost(&node.id) {
                    tracing::warn!(node_id = %node.id, error = %e, "Lost demotion failed");
                    continue;
                }
                match self.lifecycle.fail_pods_on_node(&node.id, "NodeLost") {
                    Ok(failed) => {
                        tracing::info!(node_id = %node.id, pods = failed, "Failed over lost node's pods");
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %node.id, error = %e, "Pod failover failed");
                    }
                }
                lost += 1;
            } else if silent_for > not_ready_after && node.status == NodeStatus::Ready {
                tracing::warn!(
                    node_id = %node.id,
                    silent_secs = silent_for.num_seconds(),
                    "Node not ready"
                );
                if let Err(e) = self.nodes.update_status(&node.id, NodeStatus::NotReady) {
                    tracing::warn!(node_id = %node.id, error = %e, "NotReady demotion failed");
                } else {
                    not_ready += 1;
                }
            }
        }

        (not_ready, lost)
    }

    /// Run scans until the task is aborted.
    pub async fn run(&self) {
        let interval = std::time::Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.heartbeat_interval_ms,
            "Liveness monitor started"
        );
        loop {
            tick.tick().await;
            self.check_once();
        }
    }
}
