//! Maintains the pod population owned by each ReplicaSet.

use crate::controllers::manager::{
    spawn_reconcile_loop, Controller, DEFAULT_RECONCILE_INTERVAL,
};
use crate::store::{Store, StoreError};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    Object, OwnerReference, Pod, PodPhase, PodStatus, ReplicaSet, ReplicaSetStatus, ResourceKind,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const NAME_GENERATION_ATTEMPTS: usize = 5;

/// Last-observed state per ReplicaSet, keyed by `namespace/name`.
#[derive(Debug, Clone)]
pub struct TrackedReplicaSet {
    pub resource_version: String,
    pub observed_replicas: i32,
    pub synced_at: DateTime<Utc>,
}

pub struct ReplicaSetController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    interval: Duration,
    tracked: RwLock<HashMap<String, TrackedReplicaSet>>,
}

impl ReplicaSetController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_interval(store, DEFAULT_RECONCILE_INTERVAL)
    }

    pub fn with_interval(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                interval,
                tracked: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// A pod belongs to the ReplicaSet when an owner reference names it by
    /// kind, name and UID.
    fn owned_by(pod: &Pod, rs: &ReplicaSet) -> bool {
        pod.metadata.owner_references.iter().any(|owner| {
            owner.kind == ResourceKind::ReplicaSet
                && owner.name == rs.metadata.name
                && owner.uid == rs.metadata.uid
        })
    }
}

impl Inner {
    async fn sync(&self) -> Result<()> {
        let sets = self.store.list(ResourceKind::ReplicaSet, "").await?;
        for obj in sets {
            let Object::ReplicaSet(rs) = obj else { continue };
            if let Err(e) = self.sync_replicaset(&rs).await {
                error!("failed to sync replicaset {}: {e:#}", rs.metadata.key());
            }
        }
        Ok(())
    }

    async fn sync_replicaset(&self, rs: &ReplicaSet) -> Result<()> {
        let pods = self
            .store
            .list(ResourceKind::Pod, &rs.metadata.namespace)
            .await?;
        let owned: Vec<Pod> = pods
            .into_iter()
            .filter_map(Object::into_pod)
            .filter(|p| ReplicaSetController::owned_by(p, rs))
            .collect();

        let current = owned.len() as i32;
        let desired = rs.spec.replicas;
        debug!(
            "replicaset {}: desired={desired} current={current}",
            rs.metadata.key()
        );

        // Pod-level failures keep the pass going; the status below counts
        // only the mutations that actually landed, so it stays truthful.
        let mut created = 0;
        let mut deleted: std::collections::HashSet<&str> = std::collections::HashSet::new();
        if current < desired {
            for _ in 0..(desired - current) {
                match self.create_pod(rs).await {
                    Ok(()) => created += 1,
                    Err(e) => warn!(
                        "failed to create pod for replicaset {}: {e:#}",
                        rs.metadata.key()
                    ),
                }
            }
        } else if current > desired {
            let excess = (current - desired) as usize;
            for pod in owned.iter().take(excess) {
                match self
                    .store
                    .delete(ResourceKind::Pod, &pod.metadata.namespace, &pod.metadata.name)
                    .await
                {
                    Ok(()) => {
                        info!(
                            "replicaset {} deleted pod {}",
                            rs.metadata.name, pod.metadata.name
                        );
                        deleted.insert(pod.metadata.name.as_str());
                    }
                    Err(e) => warn!(
                        "failed to delete pod {} for replicaset {}: {e:#}",
                        pod.metadata.name,
                        rs.metadata.key()
                    ),
                }
            }
        }

        let surviving: Vec<&Pod> = owned
            .iter()
            .filter(|p| !deleted.contains(p.metadata.name.as_str()))
            .collect();
        let replicas = surviving.len() as i32 + created;
        let ready = surviving
            .iter()
            .filter(|p| p.status.phase == PodPhase::Running)
            .count() as i32;
        let status = ReplicaSetStatus {
            replicas,
            fully_labeled_replicas: replicas,
            ready_replicas: ready,
            available_replicas: ready,
        };
        if rs.status != status {
            let mut updated = rs.clone();
            updated.status = status;
            match self.store.update(Object::ReplicaSet(updated)).await {
                Ok(_) => {}
                // Someone else moved the object; the next pass observes it.
                Err(StoreError::Conflict { .. }) => debug!(
                    "replicaset {} status update lost a conflict, retrying next pass",
                    rs.metadata.key()
                ),
                Err(e) => return Err(e.into()),
            }
        }

        self.tracked.write().await.insert(
            rs.metadata.key(),
            TrackedReplicaSet {
                resource_version: rs.metadata.resource_version.clone(),
                observed_replicas: replicas,
                synced_at: Utc::now(),
            },
        );

        Ok(())
    }

    /// Build a pod from the template and persist it under a generated
    /// name. The suffix comes from the wall clock; a collision regenerates.
    async fn create_pod(&self, rs: &ReplicaSet) -> Result<()> {
        let template = &rs.spec.template;

        let mut metadata = template.metadata.clone();
        metadata.namespace = rs.metadata.namespace.clone();
        metadata.uid = uuid::Uuid::new_v4().to_string();
        metadata.resource_version = String::new();
        metadata.creation_timestamp = None;
        for (k, v) in rs.spec.selector.match_labels.iter() {
            metadata.labels.insert(k.clone(), v.clone());
        }
        metadata.owner_references = vec![OwnerReference {
            api_version: rs.api_version.clone(),
            kind: ResourceKind::ReplicaSet,
            name: rs.metadata.name.clone(),
            uid: rs.metadata.uid.clone(),
        }];

        let mut spec = template.spec.clone();
        spec.node_name = String::new();

        for _ in 0..NAME_GENERATION_ATTEMPTS {
            let mut pod = Pod {
                api_version: common::API_VERSION.to_string(),
                kind: ResourceKind::Pod.as_str().to_string(),
                metadata: metadata.clone(),
                spec: spec.clone(),
                status: PodStatus {
                    phase: PodPhase::Pending,
                    ..Default::default()
                },
            };
            pod.metadata.name = format!(
                "{}-{}",
                rs.metadata.name,
                Utc::now().timestamp_nanos_opt().unwrap_or_default()
            );

            match self.store.create(Object::Pod(pod)).await {
                Ok(created) => {
                    info!(
                        "replicaset {} created pod {}",
                        rs.metadata.name,
                        created.name()
                    );
                    return Ok(());
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "could not find a free pod name for replicaset {} after {NAME_GENERATION_ATTEMPTS} attempts",
            rs.metadata.key()
        )
    }
}

#[async_trait]
impl Controller for ReplicaSetController {
    fn name(&self) -> &'static str {
        "replicaset-controller"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        spawn_reconcile_loop("replicaset-controller", self.inner.interval, shutdown, move || {
            let inner = inner.clone();
            async move { inner.sync().await }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.tracked.write().await.clear();
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }
}

impl ReplicaSetController {
    /// Last-synced observation, for introspection and tests.
    pub async fn tracked(&self, namespace: &str, name: &str) -> Option<TrackedReplicaSet> {
        self.inner
            .tracked
            .read()
            .await
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }
}
