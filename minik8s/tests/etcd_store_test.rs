//! Exercises the etcd backend against a live endpoint.
//!
//! These tests are ignored by default; run them with a reachable etcd (or
//! etcd-compatible) server:
//!
//! ```sh
//! MINIK8S_TEST_ETCD_ENDPOINTS=localhost:2379 cargo test -- --ignored
//! ```

use common::{Container, EventType, Object, ObjectMeta, Pod, PodSpec, ResourceKind, API_VERSION};
use minik8s::store::etcd::EtcdStore;
use minik8s::store::{Options, Store, StoreError};
use serial_test::serial;
use std::time::Duration;

fn endpoints() -> Vec<String> {
    std::env::var("MINIK8S_TEST_ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "localhost:2379".to_string())
        .split(',')
        .map(str::to_string)
        .collect()
}

async fn test_store() -> EtcdStore {
    let store = EtcdStore::new(&endpoints(), "/minik8s-test", Options::default())
        .await
        .expect("etcd endpoint reachable");
    // Leftovers from a previous run.
    for obj in store.list(ResourceKind::Pod, "").await.unwrap() {
        let _ = store
            .delete(ResourceKind::Pod, obj.namespace(), obj.name())
            .await;
    }
    store
}

fn make_pod(name: &str) -> Object {
    Object::Pod(Pod {
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
                image: "busybox:latest".to_string(),
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
            ..Default::default()
        },
        status: Default::default(),
    })
}

#[ignore]
#[serial]
#[tokio::test]
async fn crud_round_trip() {
    let store = test_store().await;

    let created = store.create(make_pod("etcd-p1")).await.unwrap();
    assert!(!created.metadata().resource_version.is_empty());

    let err = store.create(make_pod("etcd-p1")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    let fetched = store
        .get(ResourceKind::Pod, "default", "etcd-p1")
        .await
        .unwrap();
    assert_eq!(fetched.name(), "etcd-p1");

    let listed = store.list(ResourceKind::Pod, "default").await.unwrap();
    assert_eq!(listed.len(), 1);

    store
        .delete(ResourceKind::Pod, "default", "etcd-p1")
        .await
        .unwrap();
    assert!(matches!(
        store.get(ResourceKind::Pod, "default", "etcd-p1").await,
        Err(StoreError::NotFound { .. })
    ));

    store.close().await;
}

#[ignore]
#[serial]
#[tokio::test]
async fn conditional_update_conflicts_on_stale_version() {
    let store = test_store().await;

    let created = store.create(make_pod("etcd-p2")).await.unwrap();

    let mut first = created.clone();
    first.metadata_mut().resource_version.clear();
    store.update(first).await.unwrap();

    let err = store.update(created).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    store
        .delete(ResourceKind::Pod, "default", "etcd-p2")
        .await
        .unwrap();
    store.close().await;
}

#[ignore]
#[serial]
#[tokio::test]
async fn watch_sees_snapshot_then_live_events() {
    let store = test_store().await;

    store.create(make_pod("etcd-w1")).await.unwrap();
    let mut watch = store.watch(ResourceKind::Pod, "default").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("snapshot event arrives")
        .unwrap();
    assert_eq!(first.event_type, EventType::Added);
    assert_eq!(first.object.unwrap().name(), "etcd-w1");

    store.create(make_pod("etcd-w2")).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("live event arrives")
        .unwrap();
    assert_eq!(second.event_type, EventType::Added);
    assert_eq!(second.object.unwrap().name(), "etcd-w2");

    store
        .delete(ResourceKind::Pod, "default", "etcd-w2")
        .await
        .unwrap();
    let third = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("delete event arrives")
        .unwrap();
    assert_eq!(third.event_type, EventType::Deleted);
    // Delete events reconstruct identity from the key alone.
    let tombstone = third.object.unwrap();
    assert_eq!(tombstone.name(), "etcd-w2");
    assert_eq!(tombstone.namespace(), "default");

    watch.stop();
    store
        .delete(ResourceKind::Pod, "default", "etcd-w1")
        .await
        .unwrap();
    store.close().await;
}
