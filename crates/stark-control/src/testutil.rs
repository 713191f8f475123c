//! Shared fixtures for control-plane tests.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stark_auth::{AuthConfig, TokenAuthority};
use stark_core::state::{Namespace, SchedulingConstraints};
use stark_core::{NodeId, PackId, PodId, PodStatus, Resources, RuntimeTag, RuntimeType, Visibility};
use stark_scheduler::SchedulerHandle;
use stark_store::{
    HistoryAction, MemStore, Node, Pack, Pod, PodHistoryEntry, PodOwner, ResourceSpec, Service,
    Store, WorkloadStatus,
};

use crate::lifecycle::LifecycleController;
use crate::registry::ServiceRegistry;
use crate::session::SessionHub;
use crate::types::ControlConfig;

pub(crate) fn test_controller() -> (LifecycleController<MemStore>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let hub = Arc::new(SessionHub::new(Duration::from_millis(200)));
    let tokens = Arc::new(TokenAuthority::new(AuthConfig::with_secret("test-secret")));
    let services = Arc::new(ServiceRegistry::new(Arc::clone(&store)));
    let (handle, _rx) = SchedulerHandle::channel();
    let controller = LifecycleController::new(
        Arc::clone(&store),
        hub,
        tokens,
        services,
        handle,
        ControlConfig::default(),
    );
    (controller, store)
}

pub(crate) fn seed_node(store: &MemStore, seed: u64) -> NodeId {
    let node = Node {
        id: NodeId::generate_deterministic(seed),
        name: format!("node-{seed}"),
        runtime_type: RuntimeType::Server,
        capabilities: Vec::new(),
        allocatable: Resources {
            cpu_millis: 4000,
            mem_bytes: 8 << 30,
            storage_bytes: 100 << 30,
            pods: 32,
        },
        used: Resources::ZERO,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        taints: Vec::new(),
        status: stark_core::NodeStatus::Ready,
        peer_addr: Some(format!("10.0.0.{seed}:7700")),
        last_heartbeat: Utc::now(),
        version: 1,
    };
    store.put_node(&node).unwrap();
    node.id
}

pub(crate) fn seed_pack(store: &MemStore) -> Pack {
    let pack = Pack {
        id: PackId::generate_deterministic(1),
        name: "test-pack".to_string(),
        version: "1.0.0".to_string(),
        runtime_tag: RuntimeTag::Universal,
        namespace: Namespace::User,
        bundle: b"bundle".to_vec(),
        enable_ephemeral: true,
        metadata: BTreeMap::new(),
        granted_capabilities: Vec::new(),
        published_at: Utc::now(),
    };
    store.put_pack(&pack).unwrap();
    pack
}

pub(crate) fn seed_service(store: &MemStore, id: &str, replicas: u32, pack: &Pack) -> Service {
    let now = Utc::now();
    let service = Service {
        id: id.parse().unwrap(),
        namespace: Namespace::User,
        pack_id: pack.id,
        pack_version: pack.version.clone(),
        follow_latest: false,
        replicas,
        status: WorkloadStatus::Active,
        labels: BTreeMap::new(),
        scheduling: SchedulingConstraints::default(),
        resources: ResourceSpec::default(),
        priority: 0,
        visibility: Visibility::Public,
        exposed: false,
        allowed_sources: Vec::new(),
        ingress_port: None,
        ready_replicas: 0,
        available_replicas: 0,
        created_at: now,
        updated_at: now,
        version: 1,
    };
    store.put_service(&service).unwrap();
    service
}

pub(crate) fn seed_pending_pod(store: &MemStore, service: &str, pack: &Pack) -> PodId {
    let now = Utc::now();
    let id = PodId::generate();
    let pod = Pod {
        id,
        owner: PodOwner::Service(service.parse().unwrap()),
        node_id: None,
        pack_id: pack.id,
        pack_version: pack.version.clone(),
        namespace: Namespace::User,
        status: PodStatus::Pending,
        status_message: None,
        resource_requests: Resources::ZERO,
        resource_limits: Resources::ZERO,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        priority: 0,
        consecutive_failures: 0,
        created_at: now,
        updated_at: now,
        version: 1,
    };
    store.put_pod(&pod).unwrap();
    store
        .append_pod_history(&PodHistoryEntry {
            pod_id: id,
            action: HistoryAction::Create,
            previous_status: None,
            new_status: PodStatus::Pending,
            previous_node_id: None,
            new_node_id: None,
            previous_version: None,
            new_version: Some(pack.version.clone()),
            reason: "Seed".to_string(),
            message: String::new(),
            actor: None,
            metadata: BTreeMap::new(),
            timestamp: now,
        })
        .unwrap();
    id
}
