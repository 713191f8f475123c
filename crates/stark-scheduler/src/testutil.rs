//! Shared fixtures for scheduler tests.

use chrono::Utc;
use std::collections::BTreeMap;

use stark_core::state::{Namespace, SchedulingConstraints};
use stark_core::{NodeId, PackId, PodId, PodStatus, Resources, RuntimeTag, RuntimeType};
use stark_store::{
    MemStore, Node, Pack, Pod, PodOwner, ResourceSpec, Service, Store, WorkloadStatus,
};

use crate::types::WorkloadView;

pub(crate) fn test_node(seed: u64) -> Node {
    Node {
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
        peer_addr: None,
        last_heartbeat: Utc::now(),
        version: 1,
    }
}

pub(crate) fn test_workload(service: &str, replicas: u32) -> WorkloadView {
    WorkloadView {
        owner: PodOwner::Service(service.parse().unwrap()),
        namespace: Namespace::User,
        pack_id: PackId::generate_deterministic(1),
        pack_version: "1.0.0".to_string(),
        replicas,
        runtime_tag: RuntimeTag::Universal,
        required_capabilities: Vec::new(),
        scheduling: SchedulingConstraints::default(),
        requests: Resources::ZERO,
        limits: Resources::ZERO,
        labels: BTreeMap::new(),
        priority: 0,
    }
}

pub(crate) fn test_pod(seed: u64, app: &str) -> Pod {
    test_pod_with(seed, app, Resources::ZERO, 0)
}

pub(crate) fn test_pod_with(seed: u64, app: &str, requests: Resources, priority: i32) -> Pod {
    let now = Utc::now();
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.to_string());
    Pod {
        id: PodId::generate_deterministic(seed),
        owner: PodOwner::Service(app.parse().unwrap()),
        node_id: None,
        pack_id: PackId::generate_deterministic(1),
        pack_version: "1.0.0".to_string(),
        namespace: Namespace::User,
        status: PodStatus::Running,
        status_message: None,
        resource_requests: requests,
        resource_limits: Resources::ZERO,
        labels,
        annotations: BTreeMap::new(),
        priority,
        consecutive_failures: 0,
        created_at: now,
        updated_at: now,
        version: 1,
    }
}

pub(crate) fn seed_pack(store: &MemStore) -> Pack {
    let pack = Pack {
        id: PackId::generate_deterministic(1),
        name: "test-pack".to_string(),
        version: "1.0.0".to_string(),
        runtime_tag: RuntimeTag::Universal,
        namespace: Namespace::User,
        bundle: b"bundle".to_vec(),
        enable_ephemeral: false,
        metadata: BTreeMap::new(),
        granted_capabilities: Vec::new(),
        published_at: Utc::now(),
    };
    store.put_pack(&pack).unwrap();
    pack
}

pub(crate) fn seed_service(store: &MemStore, id: &str, replicas: u32, pack: &Pack) -> Service {
    let now = Utc::now();
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), id.to_string());
    let service = Service {
        id: id.parse().unwrap(),
        namespace: Namespace::User,
        pack_id: pack.id,
        pack_version: pack.version.clone(),
        follow_latest: false,
        replicas,
        status: WorkloadStatus::Active,
        labels,
        scheduling: SchedulingConstraints::default(),
        resources: ResourceSpec::default(),
        priority: 0,
        visibility: stark_core::Visibility::Public,
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
