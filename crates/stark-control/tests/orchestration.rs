//! End-to-end orchestration tests over the in-process control plane.
//!
//! These drive the real orchestrator and scheduler against the in-memory
//! store; the tests play the agent role by feeding wire frames through the
//! router, exactly as the gateway's session transport would.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stark_auth::{AuthConfig, TokenAuthority};
use stark_control::{ControlConfig, CreateServiceRequest, LivenessMonitor, NodeRegistry, Orchestrator, PublishPackRequest, RolloutRequest};
use stark_core::proto::{Body, Frame, Heartbeat, PodStatusUpdate, Register, ResolveTarget, ResolvedTarget, Signal};
use stark_core::state::SchedulingConstraints;
use stark_core::{NodeId, PodStatus, Resources, RuntimeType, ServiceId, Visibility};
use stark_store::{HistoryAction, MemStore, PodOwner, ResourceSpec, Store};
use stark_scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};

struct Cluster {
    orchestrator: Arc<Orchestrator<MemStore>>,
    scheduler: Scheduler<MemStore, stark_control::LifecycleController<MemStore>>,
    store: Arc<MemStore>,
    tokens: Arc<TokenAuthority>,
    /// Outbound receivers of the fake agent sessions; held so the hub can
    /// keep delivering commands.
    session_rxs: std::sync::Mutex<Vec<tokio::sync::mpsc::UnboundedReceiver<Frame>>>,
}

impl Cluster {
    fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let tokens = Arc::new(TokenAuthority::new(AuthConfig::with_secret("e2e-secret")));
        let (orchestrator, _trigger_rx) = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&tokens),
            ControlConfig::default(),
        );
        let orchestrator = Arc::new(orchestrator);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(orchestrator.lifecycle().clone()),
            SchedulerConfig::default(),
        );
        Self {
            orchestrator,
            scheduler,
            store,
            tokens,
            session_rxs: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register an agent node and open its hub session.
    fn join_node(&self, name: &str) -> NodeId {
        let ack = self
            .orchestrator
            .handle_register(&Register {
                node_name: name.to_string(),
                runtime_type: RuntimeType::Server,
                capabilities: Vec::new(),
                allocatable: Resources {
                    cpu_millis: 8000,
                    mem_bytes: 16 << 30,
                    storage_bytes: 100 << 30,
                    pods: 64,
                },
                labels: BTreeMap::new(),
                taints: Vec::new(),
                peer_addr: Some(format!("10.0.0.{}:7700", name.len())),
            })
            .unwrap();
        // Keep the outbound receiver alive so commands are deliverable.
        let rx = self.orchestrator.sessions().register_session(ack.node_id);
        self.session_rxs.lock().unwrap().push(rx);
        self.orchestrator.session_established(&ack.node_id);
        ack.node_id
    }

    fn publish_pack(&self, name: &str, version: &str) {
        use base64::Engine as _;
        self.orchestrator
            .publish_pack(PublishPackRequest {
                name: name.to_string(),
                version: version.to_string(),
                runtime_tag: stark_core::RuntimeTag::Universal,
                namespace: stark_core::state::Namespace::User,
                bundle: base64::engine::general_purpose::STANDARD.encode(b"bundle"),
                enable_ephemeral: true,
                metadata: BTreeMap::new(),
                granted_capabilities: Vec::new(),
            })
            .unwrap();
    }

    fn create_service(&self, id: &str, pack: &str, replicas: u32) {
        self.orchestrator
            .create_service(CreateServiceRequest {
                id: id.parse().unwrap(),
                namespace: stark_core::state::Namespace::User,
                pack_name: pack.to_string(),
                pack_version: None,
                replicas,
                labels: BTreeMap::new(),
                scheduling: SchedulingConstraints::default(),
                // Real requests so the least-loaded term spreads replicas
                // across nodes instead of tying.
                resources: ResourceSpec {
                    requests: Resources::cpu_mem(500, 512 << 20),
                    limits: Resources::cpu_mem(1000, 1 << 30),
                },
                priority: 0,
                visibility: Visibility::Public,
                exposed: false,
                allowed_sources: Vec::new(),
                ingress_port: None,
            })
            .unwrap();
    }

    /// The agent acknowledging its pods: drive every scheduled pod of a
    /// node through starting and running, as its pod:status frames would.
    async fn agent_reports_running(&self, node_id: NodeId) {
        for pod in self.store.list_pods_by_node(&node_id).unwrap() {
            if pod.status == PodStatus::Scheduled {
                for status in [PodStatus::Starting, PodStatus::Running] {
                    self.orchestrator
                        .handle_frame(
                            &node_id,
                            Frame::event(Body::PodStatusUpdate(PodStatusUpdate {
                                pod_id: pod.id,
                                status,
                                message: None,
                            })),
                        )
                        .await;
                }
            }
        }
    }

    async fn converge(&self, cycles: usize, nodes: &[NodeId]) {
        for _ in 0..cycles {
            self.scheduler.reconcile_cycle().await.unwrap();
            for node in nodes {
                self.agent_reports_running(*node).await;
            }
        }
    }

    fn running_pods_of(&self, service: &str) -> Vec<stark_store::Pod> {
        let owner = PodOwner::Service(service.parse().unwrap());
        self.store
            .list_pods_by_owner(&owner)
            .unwrap()
            .into_iter()
            .filter(|p| p.status == PodStatus::Running)
            .collect()
    }
}

#[tokio::test]
async fn service_converges_and_survives_node_loss() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    let n2 = cluster.join_node("n2");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("api", "api", 4);

    cluster.converge(2, &[n1, n2]).await;
    assert_eq!(cluster.running_pods_of("api").len(), 4);

    // Silence n1 past the lost threshold; the monitor fails its pods over.
    let monitor = LivenessMonitor::new(
        Arc::new(NodeRegistry::new(Arc::clone(&cluster.store))),
        cluster.orchestrator.lifecycle().clone(),
        ControlConfig::default(),
    );
    let mut node = cluster.store.get_node(&n1).unwrap().unwrap();
    node.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(200);
    cluster.store.update_node(&node).unwrap();
    let (_, lost) = monitor.check_once();
    assert_eq!(lost, 1);

    let failed: Vec<_> = cluster
        .store
        .list_pods_by_node(&n1)
        .unwrap()
        .into_iter()
        .filter(|p| p.status == PodStatus::Failed)
        .collect();
    assert!(!failed.is_empty(), "lost node's pods transitioned to failed");
    for pod in &failed {
        let last = cluster.store.list_pod_history(&pod.id).unwrap().pop().unwrap();
        assert_eq!(last.reason, "NodeLost");
    }

    // One cycle later the replacements land on the surviving node.
    cluster.converge(1, &[n2]).await;
    let running = cluster.running_pods_of("api");
    assert_eq!(running.len(), 4);
    assert!(running.iter().all(|p| p.node_id == Some(n2)));
}

#[tokio::test]
async fn rolling_update_emits_version_history_and_keeps_capacity() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("api", "api", 3);
    cluster.converge(2, &[n1]).await;
    assert_eq!(cluster.running_pods_of("api").len(), 3);

    cluster.publish_pack("api", "2.0.0");
    cluster
        .orchestrator
        .rollout_service(
            &"api".parse::<ServiceId>().unwrap(),
            &RolloutRequest { pack_version: None },
        )
        .unwrap();

    // Converge while asserting replica floor: with max_unavailable = 1 and
    // the agent acking promptly, at most one pod is down at a time.
    for _ in 0..8 {
        cluster.scheduler.reconcile_cycle().await.unwrap();
        let owner = PodOwner::Service("api".parse().unwrap());
        let alive = cluster
            .store
            .list_pods_by_owner(&owner)
            .unwrap()
            .into_iter()
            .filter(|p| p.status == PodStatus::Running)
            .count();
        assert!(alive >= 2, "never more than max_unavailable below desired");
        // Stopping pods finish their grace period and the new ones come up.
        for pod in cluster.store.list_pods_by_owner(&owner).unwrap() {
            if pod.status == PodStatus::Stopping {
                cluster
                    .orchestrator
                    .handle_frame(
                        &n1,
                        Frame::event(Body::PodStatusUpdate(PodStatusUpdate {
                            pod_id: pod.id,
                            status: PodStatus::Stopped,
                            message: None,
                        })),
                    )
                    .await;
            }
        }
        cluster.agent_reports_running(n1).await;
    }

    let running = cluster.running_pods_of("api");
    assert_eq!(running.len(), 3);
    assert!(running.iter().all(|p| p.pack_version == "2.0.0"));

    // Every replaced pod carries a v1 -> v2 history entry.
    let owner = PodOwner::Service("api".parse().unwrap());
    let replaced: Vec<_> = cluster
        .store
        .list_pods_by_owner(&owner)
        .unwrap()
        .into_iter()
        .filter(|p| p.pack_version == "1.0.0")
        .collect();
    assert_eq!(replaced.len(), 3);
    for pod in replaced {
        let history = cluster.store.list_pod_history(&pod.id).unwrap();
        let change = history
            .iter()
            .find(|h| h.action == HistoryAction::VersionChange)
            .expect("version change recorded");
        assert_eq!(change.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(change.new_version.as_deref(), Some("2.0.0"));
    }
}

#[tokio::test]
async fn resolve_is_sticky_until_target_leaves() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    let n2 = cluster.join_node("n2");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("a", "api", 1);
    cluster.create_service("b", "api", 2);
    cluster.converge(2, &[n1, n2]).await;

    let caller = cluster.running_pods_of("a")[0].clone();
    let caller_node = caller.node_id.unwrap();

    let resolve = |sticky| {
        Frame::request(Body::ResolveTarget(ResolveTarget {
            pod_id: caller.id,
            service_id: "b".parse().unwrap(),
            sticky,
        }))
    };

    let first: ResolvedTarget = {
        let reply = cluster
            .orchestrator
            .handle_frame(&caller_node, resolve(true))
            .await
            .unwrap();
        match reply.body {
            Body::Ok { value } => serde_json::from_value(value).unwrap(),
            other => panic!("expected ok, got {}", other.kind()),
        }
    };

    // Ten further sticky resolutions return the same pod.
    for _ in 0..10 {
        let reply = cluster
            .orchestrator
            .handle_frame(&caller_node, resolve(true))
            .await
            .unwrap();
        let Body::Ok { value } = reply.body else {
            panic!("expected ok");
        };
        let resolved: ResolvedTarget = serde_json::from_value(value).unwrap();
        assert_eq!(resolved.pod_id, first.pod_id);
    }

    // The recorded target stops; the next resolution lands on the survivor.
    let target_node = first.node_id;
    cluster
        .orchestrator
        .handle_frame(
            &target_node,
            Frame::event(Body::PodStatusUpdate(PodStatusUpdate {
                pod_id: first.pod_id,
                status: PodStatus::Failed,
                message: Some("crash".into()),
            })),
        )
        .await;

    let reply = cluster
        .orchestrator
        .handle_frame(&caller_node, resolve(true))
        .await
        .unwrap();
    let Body::Ok { value } = reply.body else {
        panic!("expected ok");
    };
    let rebound: ResolvedTarget = serde_json::from_value(value).unwrap();
    assert_ne!(rebound.pod_id, first.pod_id);
}

#[tokio::test]
async fn private_service_denies_signaling_before_any_relay() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    let n2 = cluster.join_node("n2");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("a", "api", 1);
    cluster.create_service("b", "api", 1);
    cluster.converge(2, &[n1, n2]).await;

    // Make b private with an empty allowlist.
    let mut service = cluster
        .store
        .get_service(&"b".parse().unwrap())
        .unwrap()
        .unwrap();
    service.visibility = Visibility::Private;
    service.allowed_sources = Vec::new();
    cluster.store.update_service(&service).unwrap();

    let caller = cluster.running_pods_of("a")[0].clone();
    let target = cluster
        .store
        .list_pods_by_owner(&PodOwner::Service("b".parse().unwrap()))
        .unwrap()
        .remove(0);

    let token = cluster.tokens.mint_pod_token(&caller.id).unwrap().token;
    let offer = Frame::request(Body::SignalOffer(Signal {
        from_pod_id: caller.id,
        to_pod_id: target.id,
        data: serde_json::json!({"nodeId": caller.node_id.unwrap(), "addrs": ["10.0.0.1:7700"]}),
        signature: token,
    }));

    let reply = cluster
        .orchestrator
        .handle_frame(&caller.node_id.unwrap(), offer)
        .await
        .unwrap();
    match reply.body {
        Body::Error { code, .. } => assert_eq!(code, "policy_denied"),
        other => panic!("expected policy denial, got {}", other.kind()),
    }

    // Resolution is denied too, so no topology leaks.
    let reply = cluster
        .orchestrator
        .handle_frame(
            &caller.node_id.unwrap(),
            Frame::request(Body::ResolveTarget(ResolveTarget {
                pod_id: caller.id,
                service_id: "b".parse().unwrap(),
                sticky: true,
            })),
        )
        .await
        .unwrap();
    assert!(matches!(reply.body, Body::Error { .. }));
}

#[tokio::test]
async fn heartbeat_keeps_node_ready_and_detects_crashes() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("api", "api", 1);
    cluster.converge(2, &[n1]).await;

    let pod = cluster.running_pods_of("api").remove(0);

    // Heartbeat reporting the pod dead triggers the crash transition.
    cluster
        .orchestrator
        .handle_frame(
            &n1,
            Frame::event(Body::Heartbeat(Heartbeat {
                used_resources: Resources::cpu_mem(100, 100),
                pod_statuses: vec![stark_core::proto::PodRunState {
                    pod_id: pod.id,
                    running: false,
                    message: Some("exit 1".into()),
                }],
            })),
        )
        .await;

    let crashed = cluster.store.get_pod(&pod.id).unwrap().unwrap();
    assert_eq!(crashed.status, PodStatus::Failed);
    assert_eq!(crashed.consecutive_failures, 1);

    // The next cycle replaces it.
    cluster.converge(1, &[n1]).await;
    assert_eq!(cluster.running_pods_of("api").len(), 1);
}

#[tokio::test]
async fn daemon_set_covers_every_ready_node() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    let n2 = cluster.join_node("n2");
    let n3 = cluster.join_node("n3");
    cluster.publish_pack("logshipper", "1.0.0");
    cluster.create_service("logshipper", "logshipper", 0);

    cluster.converge(2, &[n1, n2, n3]).await;
    let pods = cluster.running_pods_of("logshipper");
    assert_eq!(pods.len(), 3);
    let nodes: std::collections::HashSet<NodeId> =
        pods.iter().filter_map(|p| p.node_id).collect();
    assert_eq!(nodes.len(), 3);

    // Cordoned nodes fall out of the eligible set; their daemon pod stops.
    cluster.orchestrator.cordon_node(&n3).unwrap();
    cluster.scheduler.reconcile_cycle().await.unwrap();
    let still_running = cluster.running_pods_of("logshipper");
    assert_eq!(still_running.len(), 2);
    assert!(still_running.iter().all(|p| p.node_id != Some(n3)));
}

#[tokio::test]
async fn scheduler_nudges_are_cheap_noops_when_converged() {
    let cluster = Cluster::new();
    let n1 = cluster.join_node("n1");
    cluster.publish_pack("api", "1.0.0");
    cluster.create_service("api", "api", 2);
    cluster.converge(2, &[n1]).await;

    let summary = cluster.scheduler.reconcile_cycle().await.unwrap();
    assert!(summary.is_noop());

    // A handle that outlives its scheduler drops nudges silently.
    let (handle, rx) = SchedulerHandle::channel();
    drop(rx);
    handle.nudge(stark_scheduler::Trigger::Tick);

    tokio::time::sleep(Duration::from_millis(5)).await;
}
