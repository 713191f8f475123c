//! The agent runtime: executes deploy/stop commands and routes inbound
//! envelopes to local pods.

pub mod isolate;
pub mod lifecycle;
pub mod logs;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use stark_core::envelope::{RequestEnvelope, ResponseEnvelope};
use stark_core::proto::{Body, Frame, Heartbeat, PodRunState, PodStatusUpdate};
use stark_core::{PodId, PodStatus, Resources, RuntimeType};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::netstack::{InboundHandler, NetworkStack};
use crate::session::{Command, ControlChannel};
use isolate::{Isolate, IsolateBackend};

/// Routes inbound envelopes to the pods this agent hosts.
///
/// Subprocess isolates are reached over their local HTTP port; worker
/// isolates through their installed handler.
pub struct PodRouter {
    isolates: Mutex<HashMap<PodId, Arc<Isolate>>>,
    http: reqwest::Client,
}

impl Default for PodRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PodRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            isolates: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Install an isolate.
    pub fn register(&self, isolate: Arc<Isolate>) {
        self.isolates.lock().insert(isolate.pod_id, isolate);
    }

    /// Remove an isolate, returning it for shutdown.
    pub fn unregister(&self, pod_id: &PodId) -> Option<Arc<Isolate>> {
        self.isolates.lock().remove(pod_id)
    }

    /// The isolate hosting a pod.
    #[must_use]
    pub fn get(&self, pod_id: &PodId) -> Option<Arc<Isolate>> {
        self.isolates.lock().get(pod_id).cloned()
    }

    /// All hosted isolates.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Isolate>> {
        self.isolates.lock().values().cloned().collect()
    }

    /// Forward an envelope into a subprocess isolate's local server.
    async fn forward_http(&self, port: u16, request: RequestEnvelope) -> ResponseEnvelope {
        let envelope_id = request.envelope_id;
        let url = format!("http://127.0.0.1:{port}{}", request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut builder = self.http.request(method, &url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                ResponseEnvelope {
                    envelope_id,
                    status,
                    headers,
                    body,
                }
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "Isolate HTTP forward failed");
                error_envelope(envelope_id, 502, "isolate unreachable")
            }
        }
    }
}

fn error_envelope(envelope_id: stark_core::EnvelopeId, status: u16, message: &str) -> ResponseEnvelope {
    let body = serde_json::json!({ "code": "not_found", "message": message });
    ResponseEnvelope {
        envelope_id,
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: serde_json::to_vec(&body).unwrap_or_default(),
    }
}

#[async_trait]
impl InboundHandler for PodRouter {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let Some(isolate) = self.get(&request.target_pod_id) else {
            return error_envelope(
                request.envelope_id,
                404,
                &format!("pod {} is not hosted here", request.target_pod_id),
            );
        };

        match &isolate.backend {
            IsolateBackend::Subprocess { port, .. } => self.forward_http(*port, request).await,
            IsolateBackend::Worker { host } => host.serve(request).await,
        }
    }
}

/// Executes orchestrator commands against local isolates.
pub struct AgentRuntime {
    config: Arc<AgentConfig>,
    session: Arc<dyn ControlChannel>,
    netstack: Arc<NetworkStack>,
    router: Arc<PodRouter>,
}

impl AgentRuntime {
    /// Wire up the runtime.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        session: Arc<dyn ControlChannel>,
        netstack: Arc<NetworkStack>,
        router: Arc<PodRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            session,
            netstack,
            router,
        })
    }

    /// Drain the command channel until it closes.
    pub async fn run_commands(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Deploy {
                    payload,
                    correlation_id,
                } => {
                    let runtime = Arc::clone(&self);
                    tokio::spawn(async move {
                        runtime.handle_deploy(payload, correlation_id).await;
                    });
                }
                Command::Stop {
                    payload,
                    correlation_id,
                } => {
                    let runtime = Arc::clone(&self);
                    tokio::spawn(async move {
                        runtime.handle_stop(payload, correlation_id).await;
                    });
                }
            }
        }
    }

    async fn handle_deploy(
        &self,
        deploy: stark_core::proto::PodDeploy,
        correlation_id: Option<stark_core::CorrelationId>,
    ) {
        let pod_id = deploy.pod_id;
        tracing::info!(
            pod_id = %pod_id,
            pack = %deploy.pack.name,
            version = %deploy.pack.version,
            "Deploying pod"
        );

        let result = match self.config.runtime_type {
            RuntimeType::Server => Isolate::spawn_subprocess(&self.config, &deploy),
            RuntimeType::Browser => Ok(Isolate::spawn_worker(&deploy)),
        };

        match result {
            Ok(isolate) => {
                let isolate = Arc::new(isolate);
                self.netstack.register_pod(pod_id, deploy.pod_token.clone());
                self.router.register(Arc::clone(&isolate));

                self.reply_ok(correlation_id);
                self.report_status(pod_id, PodStatus::Starting, None);
                isolate.lifecycle.mark_running();
                self.report_status(pod_id, PodStatus::Running, None);
            }
            Err(e) => {
                tracing::warn!(pod_id = %pod_id, error = %e, "Deploy failed");
                self.reply_err(correlation_id, &e);
                self.report_status(pod_id, PodStatus::Failed, Some(e.to_string()));
            }
        }
    }

    async fn handle_stop(
        &self,
        stop: stark_core::proto::PodStop,
        correlation_id: Option<stark_core::CorrelationId>,
    ) {
        let pod_id = stop.pod_id;
        tracing::info!(pod_id = %pod_id, reason = %stop.reason, "Stopping pod");

        if let Some(isolate) = self.router.unregister(&pod_id) {
            isolate.stop(&stop.reason, stop.grace_period_ms).await;
        } else {
            tracing::debug!(pod_id = %pod_id, "Stop for a pod we do not host");
        }
        self.netstack.unregister_pod(&pod_id);

        self.reply_ok(correlation_id);
        self.report_status(pod_id, PodStatus::Stopped, Some(stop.reason));
    }

    /// Send heartbeats at the orchestrator-assigned cadence until the
    /// session closes.
    pub async fn run_heartbeats(self: Arc<Self>, interval: std::time::Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let isolates = self.router.all();
            let mut used = Resources::ZERO;
            let mut pod_statuses = Vec::with_capacity(isolates.len());
            for isolate in &isolates {
                used = used.saturating_add(&isolate.limits);
                pod_statuses.push(PodRunState {
                    pod_id: isolate.pod_id,
                    running: isolate.is_running(),
                    message: None,
                });
            }
            used.pods = u32::try_from(isolates.len()).unwrap_or(u32::MAX);

            if self
                .session
                .send(Body::Heartbeat(Heartbeat {
                    used_resources: used,
                    pod_statuses,
                }))
                .is_err()
            {
                tracing::debug!("Session gone, heartbeat loop ending");
                break;
            }
        }
    }

    fn report_status(&self, pod_id: PodId, status: PodStatus, message: Option<String>) {
        let result = self.session.send(Body::PodStatusUpdate(PodStatusUpdate {
            pod_id,
            status,
            message,
        }));
        if let Err(e) = result {
            tracing::warn!(pod_id = %pod_id, error = %e, "Status report dropped");
        }
    }

    fn reply_ok(&self, correlation_id: Option<stark_core::CorrelationId>) {
        if let Some(corr) = correlation_id {
            if let Ok(frame) = Frame::reply_ok(corr, &serde_json::json!({})) {
                let _ = self.session.send_frame(frame);
            }
        }
    }

    fn reply_err(&self, correlation_id: Option<stark_core::CorrelationId>, err: &AgentError) {
        if let Some(corr) = correlation_id {
            let _ = self
                .session
                .send_frame(Frame::reply_err(corr, &err.to_core()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stark_core::EnvelopeId;

    #[tokio::test]
    async fn unknown_pod_gets_404_envelope() {
        let router = PodRouter::new();
        let response = router
            .handle(RequestEnvelope {
                envelope_id: EnvelopeId::generate_deterministic(1),
                source_pod_id: PodId::generate_deterministic(1),
                target_pod_id: PodId::generate_deterministic(2),
                method: "GET".into(),
                path: "/x".into(),
                headers: Vec::new(),
                body: Vec::new(),
                deadline_ms: u64::MAX,
            })
            .await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn worker_isolate_served_through_router() {
        use stark_core::proto::{PackPayload, PodDeploy};
        use std::collections::BTreeMap;

        let deploy = PodDeploy {
            pod_id: PodId::generate_deterministic(1),
            service_id: None,
            pack: PackPayload {
                pack_id: stark_core::PackId::generate_deterministic(1),
                name: "w".into(),
                version: "1".into(),
                bundle: PackPayload::encode_bundle(b""),
                enable_ephemeral: true,
                metadata: BTreeMap::new(),
            },
            capabilities: Vec::new(),
            pod_token: "t".into(),
            refresh_token: "r".into(),
            limits: Resources::ZERO,
        };

        let router = PodRouter::new();
        router.register(Arc::new(Isolate::spawn_worker(&deploy)));

        let response = router
            .handle(RequestEnvelope {
                envelope_id: EnvelopeId::generate_deterministic(9),
                source_pod_id: PodId::generate_deterministic(5),
                target_pod_id: deploy.pod_id,
                method: "GET".into(),
                path: "/ping".into(),
                headers: Vec::new(),
                body: Vec::new(),
                deadline_ms: u64::MAX,
            })
            .await;
        assert_eq!(response.status, 200);
    }
}
