//! The per-node agent: watches pods bound to this node, drives the
//! runtime collaborators to bring them up, and reports pod and node
//! status back to the store.

pub mod runtime;

use crate::store::{Store, StoreError};
use anyhow::Result;
use chrono::Utc;
use common::{
    ContainerState, ContainerStateRunning, ContainerStatus, Node, NodeCondition, NodeStatus,
    Object, Pod, PodPhase, ResourceKind, API_VERSION,
};
use log::{debug, error, info, warn};
use runtime::{ContainerRuntime, NetworkManager, VolumeManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const POD_SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub host_ip: String,
    pub heartbeat_interval: Duration,
}

/// Runtime state of a pod this node has brought up.
struct PodState {
    resource_version: String,
    container_ids: Vec<String>,
    pod_ip: String,
}

pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<dyn NetworkManager>,
    volumes: Arc<dyn VolumeManager>,
    pods: RwLock<HashMap<String, PodState>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<dyn NetworkManager>,
        volumes: Arc<dyn VolumeManager>,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                config,
                store,
                runtime,
                network,
                volumes,
                pods: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register the node, then run the pod-sync and heartbeat loops until
    /// cancellation.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.inner.register_node().await?;

        let inner = self.inner.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POD_SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.sync_pods().await {
                            error!("pod sync failed: {e:#}");
                        }
                    }
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.heartbeat().await {
                            error!("node heartbeat failed: {e:#}");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// One pod-sync pass, exposed for tests.
    pub async fn sync_once(&self) -> Result<()> {
        self.inner.sync_pods().await
    }

    pub async fn heartbeat_once(&self) -> Result<()> {
        self.inner.heartbeat().await
    }
}

impl AgentInner {
    /// Create this node's object if absent, with capacity reported by the
    /// runtime and an initial Ready condition.
    async fn register_node(&self) -> Result<()> {
        let name = &self.config.node_name;
        match self.store.get(ResourceKind::Node, "", name).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let capacity = self.runtime.node_capacity();
        let node = Node {
            api_version: API_VERSION.to_string(),
            kind: ResourceKind::Node.as_str().to_string(),
            metadata: common::ObjectMeta {
                name: name.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            },
            spec: Default::default(),
            status: NodeStatus {
                allocatable: capacity.clone(),
                capacity,
                conditions: vec![ready_condition()],
                addresses: vec![common::NodeAddress {
                    address_type: "InternalIP".to_string(),
                    address: self.config.host_ip.clone(),
                }],
                node_info: self.runtime.node_info(),
            },
        };

        match self.store.create(Object::Node(node)).await {
            Ok(_) => {
                info!("registered node {name}");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the Ready heartbeat and resource snapshot on this node's
    /// status.
    async fn heartbeat(&self) -> Result<()> {
        let name = &self.config.node_name;
        let node = match self.store.get(ResourceKind::Node, "", name).await {
            Ok(obj) => obj.into_node(),
            Err(StoreError::NotFound { .. }) => {
                // Someone deleted us; re-register on the next beat.
                warn!("node {name} missing from store, re-registering");
                return self.register_node().await;
            }
            Err(e) => return Err(e.into()),
        };
        let Some(mut node) = node else { return Ok(()) };

        let capacity = self.runtime.node_capacity();
        node.status.allocatable = capacity.clone();
        node.status.capacity = capacity;
        let now = Utc::now();
        match node
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == "Ready")
        {
            Some(cond) => {
                if cond.status != "True" {
                    cond.status = "True".to_string();
                    cond.last_transition_time = Some(now);
                }
                cond.last_heartbeat_time = Some(now);
            }
            None => node.status.conditions.push(ready_condition()),
        }

        match self.store.update(Object::Node(node)).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                debug!("node {name} heartbeat lost a conflict, retrying next beat");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring up newly-bound pods, and tear down local state for pods that
    /// left the store.
    async fn sync_pods(&self) -> Result<()> {
        let pods = self.store.list(ResourceKind::Pod, "").await?;
        let assigned: Vec<Pod> = pods
            .into_iter()
            .filter_map(Object::into_pod)
            .filter(|p| p.spec.node_name == self.config.node_name)
            .collect();

        for pod in &assigned {
            if let Err(e) = self.sync_pod(pod).await {
                error!("failed to sync pod {}: {e:#}", pod.metadata.key());
                self.mark_failed(pod, &format!("{e:#}")).await;
            }
        }

        // Anything tracked locally but gone from the store is torn down.
        let live: std::collections::HashSet<String> =
            assigned.iter().map(|p| p.metadata.key()).collect();
        let stale: Vec<String> = self
            .pods
            .read()
            .await
            .keys()
            .filter(|k| !live.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.teardown_pod(&key).await;
        }

        Ok(())
    }

    async fn sync_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod.metadata.key();
        let known_version = self
            .pods
            .read()
            .await
            .get(&key)
            .map(|s| s.resource_version.clone());

        match known_version {
            None => self.start_pod(pod).await,
            Some(v) if v != pod.metadata.resource_version => {
                // Track the new version; container churn on spec change is
                // the runtime's concern, not re-driven here.
                if let Some(state) = self.pods.write().await.get_mut(&key) {
                    state.resource_version = pod.metadata.resource_version.clone();
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    async fn start_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod.metadata.key();
        info!("starting pod {key}");

        for volume in &pod.spec.volumes {
            self.volumes.mount_volume(pod, volume).await?;
        }

        let mut container_ids = Vec::new();
        let mut container_statuses = Vec::new();
        let started_at = Utc::now();
        for container in &pod.spec.containers {
            self.runtime.pull_image(&container.image).await?;
            let id = self.runtime.create_container(pod, container).await?;
            self.runtime.start_container(&id).await?;
            container_statuses.push(ContainerStatus {
                name: container.name.clone(),
                state: ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(started_at),
                    }),
                    ..Default::default()
                },
                ready: true,
                restart_count: 0,
                image: container.image.clone(),
                image_id: id.clone(),
            });
            container_ids.push(id);
        }

        let pod_ip = self.network.setup_pod_network(pod).await?;

        let mut updated = pod.clone();
        updated.status.phase = PodPhase::Running;
        updated.status.pod_ip = pod_ip.clone();
        updated.status.host_ip = self.config.host_ip.clone();
        updated.status.start_time = Some(started_at);
        updated.status.container_statuses = container_statuses;
        let stored = match self.store.update(Object::Pod(updated)).await {
            Ok(stored) => stored,
            Err(StoreError::Conflict { .. }) => {
                debug!("status write for {key} lost a conflict, retrying next pass");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.pods.write().await.insert(
            key,
            PodState {
                resource_version: stored.metadata().resource_version.clone(),
                container_ids,
                pod_ip,
            },
        );
        Ok(())
    }

    /// Best-effort Failed phase so the failure is visible in the store.
    async fn mark_failed(&self, pod: &Pod, message: &str) {
        let mut updated = pod.clone();
        updated.status.phase = PodPhase::Failed;
        updated.status.message = message.to_string();
        if let Err(e) = self.store.update(Object::Pod(updated)).await {
            warn!(
                "could not record failure for pod {}: {e:#}",
                pod.metadata.key()
            );
        }
    }

    async fn teardown_pod(&self, key: &str) {
        let Some(state) = self.pods.write().await.remove(key) else {
            return;
        };
        info!("tearing down pod {key}");

        for id in &state.container_ids {
            if let Err(e) = self.runtime.stop_container(id).await {
                warn!("failed to stop container {id}: {e:#}");
            }
            if let Err(e) = self.runtime.remove_container(id).await {
                warn!("failed to remove container {id}: {e:#}");
            }
        }
        if let Err(e) = self.network.teardown_pod_network(key).await {
            warn!("failed to tear down network for {key}: {e:#}");
        }
        if let Err(e) = self.volumes.unmount_volume(key, "").await {
            warn!("failed to unmount volumes for {key}: {e:#}");
        }
        debug!("released pod ip {}", state.pod_ip);
    }
}

fn ready_condition() -> NodeCondition {
    let now = Utc::now();
    NodeCondition {
        condition_type: "Ready".to_string(),
        status: "True".to_string(),
        last_heartbeat_time: Some(now),
        last_transition_time: Some(now),
        reason: "AgentReady".to_string(),
        message: String::new(),
    }
}
