//! Configuration and request types for control-plane operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use stark_core::state::{Namespace, SchedulingConstraints, Visibility};
use stark_core::{RuntimeTag, ServiceId};
use stark_store::ResourceSpec;

/// Configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Agent heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence before a node goes `NotReady` (defaults to 3×
    /// heartbeat).
    pub not_ready_after_ms: u64,
    /// Heartbeat silence before a node goes `Lost` and its pods are failed
    /// over (defaults to 10× heartbeat).
    pub lost_after_ms: u64,
    /// Timeout for correlated requests to agents, milliseconds.
    pub request_timeout_ms: u64,
    /// Default graceful-stop period handed to agents, milliseconds.
    pub grace_period_ms: u64,
    /// Default TTL agents may cache a resolved target for, milliseconds.
    pub target_ttl_ms: u64,
    /// Default pod-group membership TTL, milliseconds.
    pub group_ttl_ms: u64,
    /// Pod-group reaper interval, milliseconds.
    pub reaper_interval_ms: u64,
    /// Optional cap on members per pod group; `0` means uncapped.
    pub group_member_cap: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            not_ready_after_ms: 45_000,
            lost_after_ms: 150_000,
            request_timeout_ms: 30_000,
            grace_period_ms: 10_000,
            target_ttl_ms: 30_000,
            group_ttl_ms: 60_000,
            reaper_interval_ms: 10_000,
            group_member_cap: 0,
        }
    }
}

impl ControlConfig {
    /// Load configuration from environment variables
    /// (`STARK_HEARTBEAT_MS`, `STARK_REQUEST_TIMEOUT_MS`,
    /// `STARK_GROUP_TTL_MS`, `STARK_REAPER_MS`).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("STARK_HEARTBEAT_MS") {
            if let Ok(n) = val.parse::<u64>() {
                config.heartbeat_interval_ms = n;
                config.not_ready_after_ms = n * 3;
                config.lost_after_ms = n * 10;
            }
        }
        if let Ok(val) = std::env::var("STARK_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                config.request_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("STARK_GROUP_TTL_MS") {
            if let Ok(n) = val.parse() {
                config.group_ttl_ms = n;
            }
        }
        if let Ok(val) = std::env::var("STARK_REAPER_MS") {
            if let Ok(n) = val.parse() {
                config.reaper_interval_ms = n;
            }
        }
        config
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reaper interval as a `Duration`.
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Heartbeat silence thresholds as chrono durations.
    #[must_use]
    pub fn liveness_thresholds(&self) -> (chrono::Duration, chrono::Duration) {
        (
            chrono::Duration::milliseconds(
                i64::try_from(self.not_ready_after_ms).unwrap_or(i64::MAX),
            ),
            chrono::Duration::milliseconds(i64::try_from(self.lost_after_ms).unwrap_or(i64::MAX)),
        )
    }
}

/// Request to publish a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPackRequest {
    /// Pack name.
    pub name: String,
    /// Version string, unique per name.
    pub version: String,
    /// Runtime requirement.
    #[serde(default)]
    pub runtime_tag: RuntimeTag,
    /// Namespace.
    #[serde(default)]
    pub namespace: Namespace,
    /// Bundle bytes, base64-encoded.
    pub bundle: String,
    /// Whether pods of this pack get the ephemeral plane.
    #[serde(default)]
    pub enable_ephemeral: bool,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Capabilities granted to the pack.
    #[serde(default)]
    pub granted_capabilities: Vec<String>,
}

/// Request to create a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    /// Service ID (overlay hostname label).
    pub id: ServiceId,
    /// Namespace.
    #[serde(default)]
    pub namespace: Namespace,
    /// Pack name to run; resolved to the newest version unless
    /// `pack_version` pins one.
    pub pack_name: String,
    /// Explicit pack version; `None` selects the latest and sets
    /// `follow_latest`.
    #[serde(default)]
    pub pack_version: Option<String>,
    /// Desired replicas; `0` designates a DaemonSet.
    pub replicas: u32,
    /// Labels applied to pods.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    #[serde(default)]
    pub scheduling: SchedulingConstraints,
    /// Resource requests and limits.
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: i32,
    /// Overlay visibility.
    #[serde(default)]
    pub visibility: Visibility,
    /// Whether external ingress may reach the service.
    #[serde(default)]
    pub exposed: bool,
    /// Allowlisted caller services.
    #[serde(default)]
    pub allowed_sources: Vec<ServiceId>,
    /// Ingress port, when exposed.
    #[serde(default)]
    pub ingress_port: Option<u16>,
}

/// Request to create a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    /// Deployment name.
    pub name: String,
    /// Namespace.
    #[serde(default)]
    pub namespace: Namespace,
    /// Pack name to run.
    pub pack_name: String,
    /// Explicit pack version; `None` selects the latest.
    #[serde(default)]
    pub pack_version: Option<String>,
    /// Desired replicas; `0` designates a DaemonSet.
    pub replicas: u32,
    /// Labels applied to pods.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Placement constraints.
    #[serde(default)]
    pub scheduling: SchedulingConstraints,
    /// Resource requests and limits.
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: i32,
}

/// Request to roll a service or deployment to a new pack version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutRequest {
    /// Target pack version; `None` rolls to the latest published version.
    #[serde(default)]
    pub pack_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_contract() {
        let config = ControlConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 15_000);
        assert_eq!(config.not_ready_after_ms, 45_000);
        assert_eq!(config.lost_after_ms, 150_000);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.group_ttl_ms, 60_000);
        assert_eq!(config.reaper_interval_ms, 10_000);
    }

    #[test]
    fn liveness_thresholds_scale_with_heartbeat() {
        let config = ControlConfig::default();
        let (not_ready, lost) = config.liveness_thresholds();
        assert_eq!(not_ready, chrono::Duration::seconds(45));
        assert_eq!(lost, chrono::Duration::seconds(150));
    }
}
