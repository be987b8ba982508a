//! Materializes a ReplicaSet from each Deployment's template and keeps
//! replica counts and status aligned.
//!
//! On a template change (detected by the primary container image) a new
//! ReplicaSet is created and the old ones keep their current replica
//! count; staged scale-down is not orchestrated here.

use crate::controllers::manager::{
    spawn_reconcile_loop, Controller, DEFAULT_RECONCILE_INTERVAL,
};
use crate::store::{Store, StoreError};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::{
    Deployment, DeploymentStatus, Object, ObjectMeta, OwnerReference, ReplicaSet, ReplicaSetSpec,
    ReplicaSetStatus, ResourceKind,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct DeploymentController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    interval: Duration,
    /// Resource version seen on the previous pass, keyed `namespace/name`.
    observed: RwLock<HashMap<String, String>>,
}

impl DeploymentController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_interval(store, DEFAULT_RECONCILE_INTERVAL)
    }

    pub fn with_interval(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                interval,
                observed: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn owned_by(rs: &ReplicaSet, deploy: &Deployment) -> bool {
        rs.metadata.owner_references.iter().any(|owner| {
            owner.kind == ResourceKind::Deployment && owner.uid == deploy.metadata.uid
        })
    }

    /// ReplicaSet carries the Deployment's current template when the
    /// primary container image matches.
    fn matches_template(rs: &ReplicaSet, deploy: &Deployment) -> bool {
        rs.spec.template.primary_image() == deploy.spec.template.primary_image()
    }
}

impl Inner {
    async fn sync(&self) -> Result<()> {
        let deployments = self.store.list(ResourceKind::Deployment, "").await?;
        for obj in deployments {
            let Object::Deployment(deploy) = obj else { continue };
            if let Err(e) = self.sync_deployment(&deploy).await {
                error!(
                    "failed to sync deployment {}: {e:#}",
                    deploy.metadata.key()
                );
            }
        }
        Ok(())
    }

    async fn sync_deployment(&self, deploy: &Deployment) -> Result<()> {
        let all = self
            .store
            .list(ResourceKind::ReplicaSet, &deploy.metadata.namespace)
            .await?;
        let owned: Vec<ReplicaSet> = all
            .into_iter()
            .filter_map(Object::into_replicaset)
            .filter(|rs| DeploymentController::owned_by(rs, deploy))
            .collect();

        let current = owned
            .iter()
            .find(|rs| DeploymentController::matches_template(rs, deploy));

        match current {
            None => {
                // First materialization, or the template changed; old
                // ReplicaSets keep their replica count.
                if !owned.is_empty() {
                    info!(
                        "deployment {} template changed, materializing a new replicaset",
                        deploy.metadata.key()
                    );
                }
                self.create_replicaset(deploy).await?;
            }
            Some(rs) if rs.spec.replicas != deploy.spec.replicas => {
                let mut updated = rs.clone();
                updated.spec.replicas = deploy.spec.replicas;
                info!(
                    "deployment {} scaling replicaset {} from {} to {}",
                    deploy.metadata.name,
                    rs.metadata.name,
                    rs.spec.replicas,
                    deploy.spec.replicas
                );
                match self.store.update(Object::ReplicaSet(updated)).await {
                    Ok(_) => {}
                    Err(StoreError::Conflict { .. }) => debug!(
                        "replicaset {} scale lost a conflict, retrying next pass",
                        rs.metadata.key()
                    ),
                    Err(e) => return Err(e.into()),
                }
            }
            Some(_) => {}
        }

        self.update_status(deploy).await?;
        self.observed.write().await.insert(
            deploy.metadata.key(),
            deploy.metadata.resource_version.clone(),
        );
        Ok(())
    }

    async fn create_replicaset(&self, deploy: &Deployment) -> Result<()> {
        let name = format!(
            "{}-{}",
            deploy.metadata.name,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        let mut labels = deploy.spec.template.metadata.labels.clone();
        for (k, v) in deploy.spec.selector.match_labels.iter() {
            labels.insert(k.clone(), v.clone());
        }

        let rs = ReplicaSet {
            api_version: common::API_VERSION.to_string(),
            kind: ResourceKind::ReplicaSet.as_str().to_string(),
            metadata: ObjectMeta {
                name: name.clone(),
                namespace: deploy.metadata.namespace.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                labels,
                owner_references: vec![OwnerReference {
                    api_version: deploy.api_version.clone(),
                    kind: ResourceKind::Deployment,
                    name: deploy.metadata.name.clone(),
                    uid: deploy.metadata.uid.clone(),
                }],
                ..Default::default()
            },
            spec: ReplicaSetSpec {
                replicas: deploy.spec.replicas,
                selector: deploy.spec.selector.clone(),
                template: deploy.spec.template.clone(),
            },
            status: ReplicaSetStatus::default(),
        };

        match self.store.create(Object::ReplicaSet(rs)).await {
            Ok(created) => {
                info!(
                    "deployment {} created replicaset {}",
                    deploy.metadata.name,
                    created.name()
                );
                Ok(())
            }
            // A concurrent pass beat us to it; the next sync adopts it.
            Err(StoreError::AlreadyExists { .. }) => {
                warn!("replicaset {name} already exists, skipping create");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mirror the owned ReplicaSets' counts onto the Deployment status,
    /// writing only when something moved.
    async fn update_status(&self, deploy: &Deployment) -> Result<()> {
        let all = self
            .store
            .list(ResourceKind::ReplicaSet, &deploy.metadata.namespace)
            .await?;
        let owned: Vec<ReplicaSet> = all
            .into_iter()
            .filter_map(Object::into_replicaset)
            .filter(|rs| DeploymentController::owned_by(rs, deploy))
            .collect();

        let mut total = 0;
        let mut available = 0;
        let mut updated_replicas = 0;
        for rs in &owned {
            total += rs.status.replicas;
            available += rs.status.available_replicas;
            if DeploymentController::matches_template(rs, deploy) {
                updated_replicas = rs.status.replicas;
            }
        }

        let status = DeploymentStatus {
            replicas: total,
            updated_replicas,
            available_replicas: available,
            unavailable_replicas: (deploy.spec.replicas - available).max(0),
        };
        if deploy.status == status {
            return Ok(());
        }

        let mut updated = deploy.clone();
        updated.status = status;
        match self.store.update(Object::Deployment(updated)).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                debug!(
                    "deployment {} status update lost a conflict, retrying next pass",
                    deploy.metadata.key()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Controller for DeploymentController {
    fn name(&self) -> &'static str {
        "deployment-controller"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner.clone();
        spawn_reconcile_loop("deployment-controller", self.inner.interval, shutdown, move || {
            let inner = inner.clone();
            async move { inner.sync().await }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.observed.write().await.clear();
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }
}
