//! Node agent driving the mock runtime collaborators.

use common::{
    Container, Object, ObjectMeta, Pod, PodPhase, PodSpec, ResourceKind, API_VERSION,
};
use minik8s::node::runtime::{MockNetwork, MockRuntime, MockVolumes};
use minik8s::node::{Agent, AgentConfig};
use minik8s::store::{memory::MemoryStore, Options, Store};
use std::sync::Arc;
use std::time::Duration;

fn make_pod(name: &str, node_name: &str) -> Pod {
    Pod {
        api_version: API_VERSION.to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![Container {
                name: "c".to_string(),
                image: "nginx:1.25".to_string(),
                command: Vec::new(),
                args: Vec::new(),
                working_dir: String::new(),
                ports: Vec::new(),
                env: Vec::new(),
                resources: Default::default(),
                volume_mounts: Vec::new(),
                liveness_probe: None,
                readiness_probe: None,
                image_pull_policy: String::new(),
            }],
            node_name: node_name.to_string(),
            ..Default::default()
        },
        status: common::PodStatus {
            phase: PodPhase::Scheduled,
            ..Default::default()
        },
    }
}

fn test_agent(store: Arc<MemoryStore>, runtime: Arc<MockRuntime>) -> Agent {
    Agent::new(
        AgentConfig {
            node_name: "worker-1".to_string(),
            host_ip: "192.168.1.10".to_string(),
            heartbeat_interval: Duration::from_secs(30),
        },
        store,
        runtime,
        Arc::new(MockNetwork),
        Arc::new(MockVolumes),
    )
}

#[tokio::test]
async fn heartbeat_registers_node_with_ready_condition() {
    let store = Arc::new(MemoryStore::new(Options::default()));
    let agent = test_agent(store.clone(), Arc::new(MockRuntime::default()));

    agent.heartbeat_once().await.unwrap();

    let node = store
        .get(ResourceKind::Node, "", "worker-1")
        .await
        .unwrap()
        .into_node()
        .unwrap();
    assert!(node.status.is_ready());
    assert!(node.status.allocatable.contains_key("cpu"));
    assert_eq!(node.status.addresses[0].address, "192.168.1.10");
}

#[tokio::test]
async fn assigned_pod_is_started_and_reported_running() {
    let store = Arc::new(MemoryStore::new(Options::default()));
    let runtime = Arc::new(MockRuntime::default());
    let agent = test_agent(store.clone(), runtime.clone());

    store
        .create(Object::Pod(make_pod("p1", "worker-1")))
        .await
        .unwrap();
    // A pod bound elsewhere is not ours.
    store
        .create(Object::Pod(make_pod("p2", "worker-2")))
        .await
        .unwrap();

    agent.sync_once().await.unwrap();

    let pod = store
        .get(ResourceKind::Pod, "default", "p1")
        .await
        .unwrap()
        .into_pod()
        .unwrap();
    assert_eq!(pod.status.phase, PodPhase::Running);
    assert!(!pod.status.pod_ip.is_empty());
    assert_eq!(pod.status.host_ip, "192.168.1.10");
    assert!(pod.status.start_time.is_some());
    assert_eq!(pod.status.container_statuses.len(), 1);
    assert!(pod.status.container_statuses[0].ready);

    let other = store
        .get(ResourceKind::Pod, "default", "p2")
        .await
        .unwrap()
        .into_pod()
        .unwrap();
    assert_eq!(other.status.phase, PodPhase::Scheduled);

    assert_eq!(runtime.running.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn deleted_pod_is_torn_down() {
    let store = Arc::new(MemoryStore::new(Options::default()));
    let runtime = Arc::new(MockRuntime::default());
    let agent = test_agent(store.clone(), runtime.clone());

    store
        .create(Object::Pod(make_pod("p1", "worker-1")))
        .await
        .unwrap();
    agent.sync_once().await.unwrap();
    assert_eq!(runtime.running.lock().unwrap().len(), 1);

    store
        .delete(ResourceKind::Pod, "default", "p1")
        .await
        .unwrap();
    agent.sync_once().await.unwrap();

    assert!(runtime.running.lock().unwrap().is_empty());
}

#[tokio::test]
async fn repeated_sync_does_not_restart_containers() {
    let store = Arc::new(MemoryStore::new(Options::default()));
    let runtime = Arc::new(MockRuntime::default());
    let agent = test_agent(store.clone(), runtime.clone());

    store
        .create(Object::Pod(make_pod("p1", "worker-1")))
        .await
        .unwrap();
    agent.sync_once().await.unwrap();
    agent.sync_once().await.unwrap();
    agent.sync_once().await.unwrap();

    // One container, started exactly once.
    assert_eq!(runtime.running.lock().unwrap().len(), 1);
}
