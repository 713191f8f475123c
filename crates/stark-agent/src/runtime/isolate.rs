//! Pod isolates: one subprocess per server-hosted pod, one in-process
//! worker per browser-hosted pod.
//!
//! Subprocess isolates get the bundle on disk, a local port, and a context
//! blob in the environment; stdin EOF is the graceful-shutdown signal, and
//! the isolate is killed when the grace period lapses. Worker isolates
//! cannot own sockets; they serve envelopes through a handler the host
//! installs, with connect/send/disconnect proxied by the agent's main
//! tasks.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};

use stark_core::envelope::{RequestEnvelope, ResponseEnvelope};
use stark_core::proto::PodDeploy;
use stark_core::{PodId, ServiceId};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::runtime::lifecycle::PodLifecycle;
use crate::runtime::logs::{pipe_logs, LogStream};

/// An envelope server installed by a worker isolate.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Serve one request envelope.
    async fn serve(&self, request: RequestEnvelope) -> ResponseEnvelope;
}

/// Built-in worker behavior: echo the request back with pod identity.
///
/// Real worker packs install their own handler table through the
/// worker-to-main proxy; this default keeps presence and fan-out queries
/// answerable on worker nodes.
pub struct EchoWorker {
    pod_id: PodId,
}

impl EchoWorker {
    /// Create an echo worker for a pod.
    #[must_use]
    pub const fn new(pod_id: PodId) -> Self {
        Self { pod_id }
    }
}

#[async_trait]
impl WorkerHost for EchoWorker {
    async fn serve(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let body = serde_json::json!({
            "pod": self.pod_id.to_string(),
            "path": request.path,
            "echo": serde_json::from_slice::<serde_json::Value>(&request.body)
                .unwrap_or(serde_json::Value::Null),
        });
        ResponseEnvelope {
            envelope_id: request.envelope_id,
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }
}

/// How a pod's isolate executes.
pub enum IsolateBackend {
    /// A subprocess serving HTTP on a local port.
    Subprocess {
        /// The child process; taken on stop.
        child: parking_lot::Mutex<Option<Child>>,
        /// Local port the isolate's server listens on.
        port: u16,
    },
    /// An in-process worker.
    Worker {
        /// The installed envelope server.
        host: Arc<dyn WorkerHost>,
    },
}

/// One running pod on this agent.
pub struct Isolate {
    /// The pod.
    pub pod_id: PodId,
    /// Overlay identity, when service-owned.
    pub service_id: Option<ServiceId>,
    /// Lifecycle shared with pack code.
    pub lifecycle: Arc<PodLifecycle>,
    /// Execution backend.
    pub backend: IsolateBackend,
    /// Resource limits, reported in heartbeats.
    pub limits: stark_core::Resources,
    /// Bundle directory; removed when the isolate drops.
    _bundle_dir: Option<tempfile::TempDir>,
}

impl Isolate {
    /// Spawn a subprocess isolate for a deploy command.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be materialized or the
    /// process fails to spawn.
    pub fn spawn_subprocess(config: &AgentConfig, deploy: &PodDeploy) -> Result<Self> {
        let bundle = deploy
            .pack
            .bundle_bytes()
            .map_err(AgentError::Core)?;

        std::fs::create_dir_all(&config.work_dir)?;
        let dir = tempfile::TempDir::with_prefix_in(
            format!("pod-{}-", deploy.pod_id),
            &config.work_dir,
        )?;
        let bundle_path = dir.path().join("bundle");
        std::fs::write(&bundle_path, bundle)?;

        let port = free_local_port()?;
        let context = serde_json::json!({
            "podId": deploy.pod_id.to_string(),
            "serviceId": deploy.service_id.as_ref().map(ToString::to_string),
            "pack": { "name": deploy.pack.name, "version": deploy.pack.version },
            "capabilities": deploy.capabilities,
            "enableEphemeral": deploy.pack.enable_ephemeral,
            "metadata": deploy.pack.metadata,
        });

        let mut argv = config.isolate_command.iter().map(|part| {
            part.replace("{bundle}", &bundle_path.to_string_lossy())
        });
        let program = argv
            .next()
            .ok_or_else(|| AgentError::Transport("empty isolate command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(argv)
            .env("STARK_POD_ID", deploy.pod_id.to_string())
            .env("PORT", port.to_string())
            .env("STARK_CONTEXT", context.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(service_id) = &deploy.service_id {
            command.env("STARK_SERVICE_ID", service_id.to_string());
        }

        let mut child = command.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_logs(deploy.pod_id, stdout, LogStream::Out));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_logs(deploy.pod_id, stderr, LogStream::Err));
        }

        tracing::info!(
            pod_id = %deploy.pod_id,
            port,
            "Subprocess isolate spawned"
        );

        Ok(Self {
            pod_id: deploy.pod_id,
            service_id: deploy.service_id.clone(),
            lifecycle: Arc::new(PodLifecycle::new()),
            backend: IsolateBackend::Subprocess {
                child: parking_lot::Mutex::new(Some(child)),
                port,
            },
            limits: deploy.limits,
            _bundle_dir: Some(dir),
        })
    }

    /// Create a worker isolate with the default echo host.
    #[must_use]
    pub fn spawn_worker(deploy: &PodDeploy) -> Self {
        tracing::info!(pod_id = %deploy.pod_id, "Worker isolate installed");
        Self {
            pod_id: deploy.pod_id,
            service_id: deploy.service_id.clone(),
            lifecycle: Arc::new(PodLifecycle::new()),
            backend: IsolateBackend::Worker {
                host: Arc::new(EchoWorker::new(deploy.pod_id)),
            },
            limits: deploy.limits,
            _bundle_dir: None,
        }
    }

    /// Whether the isolate is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.backend {
            IsolateBackend::Subprocess { child, .. } => {
                let mut guard = child.lock();
                match guard.as_mut() {
                    Some(child) => matches!(child.try_wait(), Ok(None)),
                    None => false,
                }
            }
            IsolateBackend::Worker { .. } => {
                !matches!(
                    self.lifecycle.phase(),
                    crate::runtime::lifecycle::Phase::Terminated
                )
            }
        }
    }

    /// Stop the isolate: run shutdown handlers, signal the process (stdin
    /// EOF), wait out the grace period, then force-terminate.
    pub async fn stop(&self, reason: &str, grace_period_ms: u64) {
        self.lifecycle.begin_shutdown(reason, grace_period_ms);

        match &self.backend {
            IsolateBackend::Subprocess { child, .. } => {
                let taken = child.lock().take();
                if let Some(mut child) = taken {
                    // Closing stdin is the graceful signal.
                    drop(child.stdin.take());

                    let grace = std::time::Duration::from_millis(grace_period_ms);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::info!(
                                pod_id = %self.pod_id,
                                status = %status,
                                "Isolate exited within grace period"
                            );
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(pod_id = %self.pod_id, error = %e, "Isolate wait failed");
                        }
                        Err(_) => {
                            tracing::warn!(
                                pod_id = %self.pod_id,
                                grace_ms = grace_period_ms,
                                "Grace period elapsed, force-terminating isolate"
                            );
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                    }
                }
            }
            IsolateBackend::Worker { .. } => {}
        }

        self.lifecycle.mark_terminated();
    }
}

/// Ask the OS for a free localhost port.
fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stark_core::proto::PackPayload;
    use stark_core::{EnvelopeId, PackId, Resources};
    use std::collections::BTreeMap;

    fn deploy(seed: u64) -> PodDeploy {
        PodDeploy {
            pod_id: PodId::generate_deterministic(seed),
            service_id: Some("web".parse().unwrap()),
            pack: PackPayload {
                pack_id: PackId::generate_deterministic(1),
                name: "test".into(),
                version: "1.0.0".into(),
                bundle: PackPayload::encode_bundle(b"bundle"),
                enable_ephemeral: false,
                metadata: BTreeMap::new(),
            },
            capabilities: Vec::new(),
            pod_token: "tok".into(),
            refresh_token: "refresh".into(),
            limits: Resources::ZERO,
        }
    }

    #[tokio::test]
    async fn echo_worker_reflects_request() {
        let pod_id = PodId::generate_deterministic(1);
        let worker = EchoWorker::new(pod_id);

        let response = worker
            .serve(RequestEnvelope {
                envelope_id: EnvelopeId::generate_deterministic(1),
                source_pod_id: PodId::generate_deterministic(2),
                target_pod_id: pod_id,
                method: "POST".into(),
                path: "/echo".into(),
                headers: Vec::new(),
                body: serde_json::to_vec(&serde_json::json!({"seq": "7"})).unwrap(),
                deadline_ms: u64::MAX,
            })
            .await;

        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["pod"], pod_id.to_string());
        assert_eq!(body["echo"]["seq"], "7");
    }

    #[tokio::test]
    async fn worker_isolate_lifecycle() {
        let isolate = Isolate::spawn_worker(&deploy(1));
        assert!(isolate.is_running());

        isolate.stop("test", 100).await;
        assert!(!isolate.is_running());
        assert!(isolate.lifecycle.is_shutting_down());
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_local_port().unwrap(), 0);
    }
}
