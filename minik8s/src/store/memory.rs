//! Embedded in-memory backend: concurrent-safe maps plus a watcher
//! registry, suitable for single-process clusters and tests.

use super::{next_resource_version, Options, Result, Store, StoreError, Watch};
use async_trait::async_trait;
use common::{EventType, Object, ResourceKind, WatchEvent};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

struct Watcher {
    tx: mpsc::Sender<WatchEvent>,
    /// Empty subscribes to every namespace.
    namespace: String,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl Watcher {
    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    fn wants(&self, namespace: &str) -> bool {
        self.namespace.is_empty() || self.namespace == namespace
    }

    /// Best-effort delivery: a full buffer drops the event and bumps the
    /// counter so the consumer can detect the gap and re-list.
    fn deliver(&self, event: WatchEvent) {
        if self.is_stopped() {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("watch buffer full, dropped event ({total} total for this watcher)");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct Inner {
    // Lock order: objects before watchers.
    objects: RwLock<HashMap<ResourceKind, HashMap<String, Object>>>,
    watchers: Mutex<HashMap<ResourceKind, Vec<Watcher>>>,
    options: Options,
}

pub struct MemoryStore {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl MemoryStore {
    pub fn new(options: Options) -> Self {
        let inner = Arc::new(Inner {
            objects: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            options,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(housekeeping_loop(inner.clone(), shutdown.clone()));

        Self { inner, shutdown }
    }

    async fn notify(
        watchers: &mut HashMap<ResourceKind, Vec<Watcher>>,
        kind: ResourceKind,
        namespace: &str,
        event_type: EventType,
        obj: &Object,
    ) {
        if let Some(list) = watchers.get_mut(&kind) {
            list.retain(|w| !w.is_stopped());
            for w in list.iter().filter(|w| w.wants(namespace)) {
                w.deliver(WatchEvent::new(event_type, obj.clone()));
            }
        }
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Prunes stopped watchers so abandoned subscriptions do not accumulate.
async fn housekeeping_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.options.gc_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let mut watchers = inner.watchers.lock().await;
                let before: usize = watchers.values().map(Vec::len).sum();
                for list in watchers.values_mut() {
                    list.retain(|w| !w.is_stopped());
                }
                watchers.retain(|_, list| !list.is_empty());
                let after: usize = watchers.values().map(Vec::len).sum();
                if after < before {
                    debug!("pruned {} stopped watchers", before - after);
                }
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, mut obj: Object) -> Result<Object> {
        let kind = obj.kind();
        if obj.name().is_empty() {
            return Err(StoreError::InvalidArgument(
                "metadata.name must not be empty".to_string(),
            ));
        }
        let key = object_key(obj.namespace(), obj.name());

        let mut objects = self.inner.objects.write().await;
        let by_kind = objects.entry(kind).or_default();
        if by_kind.contains_key(&key) {
            return Err(StoreError::already_exists(kind, obj.namespace(), obj.name()));
        }

        {
            let meta = obj.metadata_mut();
            meta.resource_version = next_resource_version();
            meta.creation_timestamp = Some(chrono::Utc::now());
        }
        by_kind.insert(key, obj.clone());

        let mut watchers = self.inner.watchers.lock().await;
        Self::notify(&mut watchers, kind, obj.namespace(), EventType::Added, &obj).await;
        Ok(obj)
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Object> {
        let objects = self.inner.objects.read().await;
        objects
            .get(&kind)
            .and_then(|m| m.get(&object_key(namespace, name)))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<Object>> {
        let objects = self.inner.objects.read().await;
        let Some(by_kind) = objects.get(&kind) else {
            return Ok(Vec::new());
        };
        Ok(by_kind
            .values()
            .filter(|o| namespace.is_empty() || o.namespace() == namespace)
            .cloned()
            .collect())
    }

    async fn update(&self, mut obj: Object) -> Result<Object> {
        let kind = obj.kind();
        let key = object_key(obj.namespace(), obj.name());

        let mut objects = self.inner.objects.write().await;
        let by_kind = objects
            .get_mut(&kind)
            .ok_or_else(|| StoreError::not_found(kind, obj.namespace(), obj.name()))?;
        let current = by_kind
            .get(&key)
            .ok_or_else(|| StoreError::not_found(kind, obj.namespace(), obj.name()))?;

        let caller_rv = obj.metadata().resource_version.clone();
        if !caller_rv.is_empty() && caller_rv != current.metadata().resource_version {
            return Err(StoreError::conflict(kind, obj.namespace(), obj.name()));
        }

        {
            let (current_uid, current_created) = {
                let m = current.metadata();
                (m.uid.clone(), m.creation_timestamp)
            };
            let meta = obj.metadata_mut();
            // Identity metadata survives whole-object replacement.
            if meta.uid.is_empty() {
                meta.uid = current_uid;
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = current_created;
            }
            meta.resource_version = next_resource_version();
        }
        by_kind.insert(key, obj.clone());

        let mut watchers = self.inner.watchers.lock().await;
        Self::notify(
            &mut watchers,
            kind,
            obj.namespace(),
            EventType::Modified,
            &obj,
        )
        .await;
        Ok(obj)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.inner.objects.write().await;
        let by_kind = objects
            .get_mut(&kind)
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))?;
        let obj = by_kind
            .remove(&object_key(namespace, name))
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))?;
        if by_kind.is_empty() {
            objects.remove(&kind);
        }

        let mut watchers = self.inner.watchers.lock().await;
        Self::notify(&mut watchers, kind, namespace, EventType::Deleted, &obj).await;
        Ok(())
    }

    async fn watch(&self, kind: ResourceKind, namespace: &str) -> Result<Watch> {
        let (tx, rx) = mpsc::channel(self.inner.options.watch_buffer_size);
        let cancel = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));

        let watcher = Watcher {
            tx,
            namespace: namespace.to_string(),
            cancel: cancel.clone(),
            dropped: dropped.clone(),
        };

        // Snapshot and registration happen under the same locks as writers
        // so the snapshot boundary is exact.
        let objects = self.inner.objects.read().await;
        let mut watchers = self.inner.watchers.lock().await;
        if let Some(by_kind) = objects.get(&kind) {
            for obj in by_kind
                .values()
                .filter(|o| namespace.is_empty() || o.namespace() == namespace)
            {
                watcher.deliver(WatchEvent::new(EventType::Added, obj.clone()));
            }
        }
        watchers.entry(kind).or_default().push(watcher);

        Ok(Watch::new(rx, cancel, dropped))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let mut watchers = self.inner.watchers.lock().await;
        for list in watchers.values() {
            for w in list {
                w.cancel.cancel();
            }
        }
        watchers.clear();
        self.inner.objects.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Container, ObjectMeta, Pod, PodSpec, API_VERSION};
    use std::time::Duration;

    fn pod(namespace: &str, name: &str) -> Object {
        Object::Pod(Pod {
            api_version: API_VERSION.to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
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
                ..Default::default()
            },
            status: Default::default(),
        })
    }

    #[tokio::test]
    async fn create_assigns_metadata_and_rejects_duplicates() {
        let store = MemoryStore::new(Options::default());

        let created = store.create(pod("default", "p1")).await.unwrap();
        assert!(!created.metadata().resource_version.is_empty());
        assert!(created.metadata().creation_timestamp.is_some());

        let err = store.create(pod("default", "p1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        // Same name in another namespace is a distinct object.
        store.create(pod("other", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn create_after_delete_succeeds() {
        let store = MemoryStore::new(Options::default());
        store.create(pod("default", "p1")).await.unwrap();
        store
            .delete(ResourceKind::Pod, "default", "p1")
            .await
            .unwrap();
        store.create(pod("default", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn get_and_delete_missing_return_not_found() {
        let store = MemoryStore::new(Options::default());
        assert!(matches!(
            store.get(ResourceKind::Pod, "default", "nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(ResourceKind::Pod, "default", "nope").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_matches_namespace_exactly() {
        let store = MemoryStore::new(Options::default());
        store.create(pod("default", "a")).await.unwrap();
        store.create(pod("default2", "b")).await.unwrap();
        store.create(pod("prod", "c")).await.unwrap();

        let default_only = store.list(ResourceKind::Pod, "default").await.unwrap();
        assert_eq!(default_only.len(), 1);
        assert_eq!(default_only[0].name(), "a");

        let all = store.list(ResourceKind::Pod, "").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn update_bumps_resource_version_monotonically() {
        let store = MemoryStore::new(Options::default());
        let created = store.create(pod("default", "p1")).await.unwrap();
        let rv1: i64 = created.metadata().resource_version.parse().unwrap();

        let mut next = created.clone();
        next.metadata_mut().resource_version.clear();
        let updated = store.update(next).await.unwrap();
        let rv2: i64 = updated.metadata().resource_version.parse().unwrap();
        assert!(rv2 > rv1);
    }

    #[tokio::test]
    async fn conditional_update_conflicts_on_stale_version() {
        let store = MemoryStore::new(Options::default());
        let created = store.create(pod("default", "p1")).await.unwrap();

        let mut first = created.clone();
        first.metadata_mut().resource_version.clear();
        store.update(first).await.unwrap();

        // Still carries the original resource version.
        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_preserves_identity_metadata() {
        let store = MemoryStore::new(Options::default());
        let mut obj = pod("default", "p1");
        obj.metadata_mut().uid = "uid-1".to_string();
        let created = store.create(obj).await.unwrap();

        let mut replacement = pod("default", "p1");
        assert!(replacement.metadata().uid.is_empty());
        let updated = store.update(replacement.clone()).await.unwrap();
        assert_eq!(updated.metadata().uid, "uid-1");
        assert_eq!(
            updated.metadata().creation_timestamp,
            created.metadata().creation_timestamp
        );

        // An explicit uid from the caller wins.
        replacement.metadata_mut().uid = "uid-2".to_string();
        let updated = store.update(replacement).await.unwrap();
        assert_eq!(updated.metadata().uid, "uid-2");
    }

    #[tokio::test]
    async fn watch_delivers_snapshot_then_live_events() {
        let store = MemoryStore::new(Options::default());
        store.create(pod("default", "existing")).await.unwrap();

        let mut watch = store.watch(ResourceKind::Pod, "default").await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Added);
        assert_eq!(first.object.unwrap().name(), "existing");

        store.create(pod("default", "later")).await.unwrap();
        let second = watch.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::Added);
        assert_eq!(second.object.unwrap().name(), "later");

        store
            .delete(ResourceKind::Pod, "default", "later")
            .await
            .unwrap();
        let third = watch.recv().await.unwrap();
        assert_eq!(third.event_type, EventType::Deleted);
        assert_eq!(third.object.unwrap().name(), "later");
    }

    #[tokio::test]
    async fn watch_filters_by_namespace() {
        let store = MemoryStore::new(Options::default());
        let mut watch = store.watch(ResourceKind::Pod, "prod").await.unwrap();

        store.create(pod("default", "a")).await.unwrap();
        store.create(pod("prod", "b")).await.unwrap();

        let ev = watch.recv().await.unwrap();
        assert_eq!(ev.object.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn stopped_watch_no_longer_receives() {
        let store = MemoryStore::new(Options::default());
        let watch = store.watch(ResourceKind::Pod, "").await.unwrap();
        watch.stop();
        drop(watch);

        // Delivery after stop must not panic or block.
        store.create(pod("default", "p1")).await.unwrap();
        store.create(pod("default", "p2")).await.unwrap();
    }

    #[tokio::test]
    async fn slow_watcher_drops_events_and_counts_them() {
        let store = MemoryStore::new(Options {
            watch_buffer_size: 1,
            ..Default::default()
        });
        let mut watch = store.watch(ResourceKind::Pod, "").await.unwrap();

        store.create(pod("default", "p1")).await.unwrap();
        store.create(pod("default", "p2")).await.unwrap();
        store.create(pod("default", "p3")).await.unwrap();

        assert_eq!(watch.dropped_events(), 2);
        let ev = tokio::time::timeout(Duration::from_secs(1), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.object.unwrap().name(), "p1");
    }

    #[tokio::test]
    async fn concurrent_creates_produce_one_winner() {
        let store = Arc::new(MemoryStore::new(Options::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(pod("default", "contended")).await.is_ok()
            }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
