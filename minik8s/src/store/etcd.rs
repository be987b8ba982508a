//! Etcd-backed store.
//!
//! Objects serialize as JSON under `{prefix}/{Kind}[/{namespace}]/{name}`.
//! Creates and conditional updates are transactional (`create_revision == 0`
//! guard, `mod_revision` compare-and-swap) so racing writers resolve on the
//! server. The change feed rides etcd's native watch, anchored at the
//! revision of the initial snapshot; entries are written under a renewed
//! lease so a partitioned control plane's state ages out.

use super::{next_resource_version, Options, Result, Store, StoreError, Watch};
use async_trait::async_trait;
use common::{EventType, Object, ResourceKind, WatchEvent};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const LEASE_TTL_SECONDS: i64 = 30;
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EtcdStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
    options: Options,
    lease: Arc<AtomicI64>,
    shutdown: CancellationToken,
}

/// Bound every backend round-trip so a wedged etcd surfaces as
/// `Unavailable` instead of hanging the caller.
async fn deadline<T, E, F>(fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(CALL_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
        Err(_) => Err(StoreError::Unavailable(format!(
            "etcd call exceeded {CALL_TIMEOUT:?}"
        ))),
    }
}

impl EtcdStore {
    pub async fn new(endpoints: &[String], prefix: &str, options: Options) -> Result<Self> {
        let connect_options = ConnectOptions::new().with_connect_timeout(CALL_TIMEOUT);
        let client = deadline(Client::connect(endpoints, Some(connect_options))).await?;
        let client = Arc::new(RwLock::new(client));

        // Connectivity probe: fail fast so the factory can fall back.
        {
            let mut guard = client.write().await;
            deadline(guard.get(prefix, Some(GetOptions::new().with_count_only()))).await?;
        }

        let lease_id = {
            let mut guard = client.write().await;
            deadline(guard.lease_grant(LEASE_TTL_SECONDS, None))
                .await?
                .id()
        };
        let lease = Arc::new(AtomicI64::new(lease_id));

        let shutdown = CancellationToken::new();
        tokio::spawn(keep_lease_alive(
            client.clone(),
            lease.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
            options,
            lease,
            shutdown,
        })
    }

    fn build_key(&self, kind: ResourceKind, namespace: &str, name: &str) -> String {
        if kind.is_namespaced() && !namespace.is_empty() {
            format!("{}/{}/{}/{}", self.prefix, kind, namespace, name)
        } else {
            format!("{}/{}/{}", self.prefix, kind, name)
        }
    }

    /// Prefix covering every object of `kind`, optionally one namespace.
    /// The trailing slash keeps namespace matching exact.
    fn build_prefix(&self, kind: ResourceKind, namespace: &str) -> String {
        if kind.is_namespaced() && !namespace.is_empty() {
            format!("{}/{}/{}/", self.prefix, kind, namespace)
        } else {
            format!("{}/{}/", self.prefix, kind)
        }
    }

    fn put_options(&self) -> PutOptions {
        PutOptions::new().with_lease(self.lease.load(Ordering::Relaxed))
    }
}

/// Recover (namespace, name) from a stored key.
fn parse_key(prefix: &str, kind: ResourceKind, key: &[u8]) -> Option<(String, String)> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(&format!("{prefix}/{kind}/"))?;
    if kind.is_namespaced() {
        let (namespace, name) = rest.split_once('/')?;
        Some((namespace.to_string(), name.to_string()))
    } else {
        Some((String::new(), rest.to_string()))
    }
}

/// Renews the write lease; on expiry a fresh lease is granted and attached
/// to subsequent writes.
async fn keep_lease_alive(
    client: Arc<RwLock<Client>>,
    lease: Arc<AtomicI64>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(LEASE_TTL_SECONDS as u64 / 3));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let id = lease.load(Ordering::Relaxed);
                let renewed = {
                    let mut guard = client.write().await;
                    match guard.lease_keep_alive(id).await {
                        Ok((mut keeper, mut stream)) => {
                            keeper.keep_alive().await.is_ok()
                                && matches!(stream.message().await, Ok(Some(resp)) if resp.ttl() > 0)
                        }
                        Err(e) => {
                            warn!("lease keepalive failed: {e}");
                            false
                        }
                    }
                };
                if !renewed {
                    let mut guard = client.write().await;
                    match guard.lease_grant(LEASE_TTL_SECONDS, None).await {
                        Ok(resp) => {
                            info!("lease expired, granted replacement lease {}", resp.id());
                            lease.store(resp.id(), Ordering::Relaxed);
                        }
                        Err(e) => error!("failed to grant replacement lease: {e}"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn create(&self, mut obj: Object) -> Result<Object> {
        let kind = obj.kind();
        if obj.name().is_empty() {
            return Err(StoreError::InvalidArgument(
                "metadata.name must not be empty".to_string(),
            ));
        }
        let key = self.build_key(kind, obj.namespace(), obj.name());

        {
            let meta = obj.metadata_mut();
            meta.resource_version = next_resource_version();
            meta.creation_timestamp = Some(chrono::Utc::now());
        }
        let data = serde_json::to_vec(&obj).map_err(|e| StoreError::Internal(e.to_string()))?;

        // Only writes when the key has never existed at this revision.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key, data, Some(self.put_options()))]);

        let resp = {
            let mut guard = self.client.write().await;
            deadline(guard.txn(txn)).await?
        };
        if !resp.succeeded() {
            return Err(StoreError::already_exists(kind, obj.namespace(), obj.name()));
        }
        Ok(obj)
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Object> {
        let key = self.build_key(kind, namespace, name);
        let resp = {
            let mut guard = self.client.write().await;
            deadline(guard.get(key, None)).await?
        };
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))?;
        Object::decode(kind, kv.value()).map_err(|e| StoreError::Internal(e.to_string()))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<Object>> {
        let prefix = self.build_prefix(kind, namespace);
        let resp = {
            let mut guard = self.client.write().await;
            deadline(guard.get(prefix, Some(GetOptions::new().with_prefix()))).await?
        };

        let mut objects = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match Object::decode(kind, kv.value()) {
                Ok(obj) => objects.push(obj),
                Err(e) => {
                    // Malformed entries are skipped so one bad write cannot
                    // poison every list.
                    warn!(
                        "skipping malformed {kind} at {}: {e}",
                        String::from_utf8_lossy(kv.key())
                    );
                }
            }
        }
        Ok(objects)
    }

    async fn update(&self, mut obj: Object) -> Result<Object> {
        let kind = obj.kind();
        let key = self.build_key(kind, obj.namespace(), obj.name());

        let resp = {
            let mut guard = self.client.write().await;
            deadline(guard.get(key.clone(), None)).await?
        };
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::not_found(kind, obj.namespace(), obj.name()))?;
        let current =
            Object::decode(kind, kv.value()).map_err(|e| StoreError::Internal(e.to_string()))?;
        let current_mod_revision = kv.mod_revision();

        let caller_rv = obj.metadata().resource_version.clone();
        let conditional = !caller_rv.is_empty();
        if conditional && caller_rv != current.metadata().resource_version {
            return Err(StoreError::conflict(kind, obj.namespace(), obj.name()));
        }

        {
            let (current_uid, current_created) = {
                let m = current.metadata();
                (m.uid.clone(), m.creation_timestamp)
            };
            let meta = obj.metadata_mut();
            if meta.uid.is_empty() {
                meta.uid = current_uid;
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = current_created;
            }
            meta.resource_version = next_resource_version();
        }
        let data = serde_json::to_vec(&obj).map_err(|e| StoreError::Internal(e.to_string()))?;

        if conditional {
            // Compare-and-swap against the revision we read.
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    current_mod_revision,
                )])
                .and_then(vec![TxnOp::put(key, data, Some(self.put_options()))]);
            let resp = {
                let mut guard = self.client.write().await;
                deadline(guard.txn(txn)).await?
            };
            if !resp.succeeded() {
                return Err(StoreError::conflict(kind, obj.namespace(), obj.name()));
            }
        } else {
            // Unconditional replace: last write wins.
            let mut guard = self.client.write().await;
            deadline(guard.put(key, data, Some(self.put_options()))).await?;
        }
        Ok(obj)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let key = self.build_key(kind, namespace, name);
        let resp = {
            let mut guard = self.client.write().await;
            deadline(guard.delete(key, None)).await?
        };
        if resp.deleted() == 0 {
            return Err(StoreError::not_found(kind, namespace, name));
        }
        Ok(())
    }

    async fn watch(&self, kind: ResourceKind, namespace: &str) -> Result<Watch> {
        let (tx, rx) = mpsc::channel(self.options.watch_buffer_size);
        let cancel = self.shutdown.child_token();
        let dropped = Arc::new(AtomicU64::new(0));

        let task = WatchTask {
            client: self.client.clone(),
            prefix: self.prefix.clone(),
            watch_prefix: self.build_prefix(kind, namespace),
            kind,
            tx,
            cancel: cancel.clone(),
            dropped: dropped.clone(),
        };
        tokio::spawn(task.run());

        Ok(Watch::new(rx, cancel, dropped))
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

struct WatchTask {
    client: Arc<RwLock<Client>>,
    prefix: String,
    watch_prefix: String,
    kind: ResourceKind,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl WatchTask {
    /// Drives one subscription: snapshot, then the native change feed from
    /// the snapshot revision, reconnecting with backoff on stream loss.
    async fn run(self) {
        let mut backoff = Duration::from_millis(100);
        loop {
            if self.cancel.is_cancelled() || self.tx.is_closed() {
                return;
            }

            match self.stream_once().await {
                Ok(()) => backoff = Duration::from_millis(100),
                Err(e) => {
                    warn!("{} watch interrupted: {e}, reconnecting", self.kind);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    async fn stream_once(&self) -> Result<()> {
        let snapshot = {
            let mut guard = self.client.write().await;
            deadline(guard.get(
                self.watch_prefix.clone(),
                Some(GetOptions::new().with_prefix()),
            ))
            .await?
        };
        let revision = snapshot.header().map(|h| h.revision()).unwrap_or(0);

        for kv in snapshot.kvs() {
            match Object::decode(self.kind, kv.value()) {
                Ok(obj) => self.deliver(WatchEvent::new(EventType::Added, obj)),
                Err(e) => {
                    warn!("undecodable {} snapshot entry: {e}", self.kind);
                    self.deliver(WatchEvent::error());
                }
            }
        }

        // Resume just past the snapshot so its entries are not re-emitted.
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (_watcher, mut stream) = {
            let mut guard = self.client.write().await;
            deadline(guard.watch(self.watch_prefix.clone(), Some(options))).await?
        };
        debug!("{} watch established at revision {revision}", self.kind);

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                m = stream.message() => m,
            };
            match message {
                Ok(Some(resp)) => {
                    for event in resp.events() {
                        self.translate(event);
                    }
                }
                Ok(None) => {
                    return Err(StoreError::Unavailable(
                        "watch stream closed by server".to_string(),
                    ))
                }
                Err(e) => return Err(StoreError::Unavailable(e.to_string())),
            }
        }
    }

    fn translate(&self, event: &etcd_client::Event) {
        let Some(kv) = event.kv() else { return };
        match event.event_type() {
            etcd_client::EventType::Put => {
                let event_type = if kv.create_revision() == kv.mod_revision() {
                    EventType::Added
                } else {
                    EventType::Modified
                };
                match Object::decode(self.kind, kv.value()) {
                    Ok(obj) => self.deliver(WatchEvent::new(event_type, obj)),
                    Err(e) => {
                        // The watcher survives undecodable payloads.
                        warn!(
                            "undecodable {} watch event at {}: {e}",
                            self.kind,
                            String::from_utf8_lossy(kv.key())
                        );
                        self.deliver(WatchEvent::error());
                    }
                }
            }
            etcd_client::EventType::Delete => {
                // Only the key survives deletion; consumers get an object
                // carrying identity alone.
                let Some((namespace, name)) = parse_key(&self.prefix, self.kind, kv.key()) else {
                    warn!(
                        "unparsable key on {} delete event: {}",
                        self.kind,
                        String::from_utf8_lossy(kv.key())
                    );
                    return;
                };
                self.deliver(WatchEvent::new(
                    EventType::Deleted,
                    Object::tombstone(self.kind, &namespace, &name),
                ));
            }
        }
    }

    fn deliver(&self, event: WatchEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "{} watch buffer full, dropped event ({total} total)",
                    self.kind
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_for_namespaced_kinds() {
        let key = b"/minik8s/Pod/default/nginx-1";
        let (namespace, name) = parse_key("/minik8s", ResourceKind::Pod, key).unwrap();
        assert_eq!(namespace, "default");
        assert_eq!(name, "nginx-1");
    }

    #[test]
    fn keys_round_trip_for_cluster_scoped_kinds() {
        let key = b"/minik8s/Node/worker-1";
        let (namespace, name) = parse_key("/minik8s", ResourceKind::Node, key).unwrap();
        assert_eq!(namespace, "");
        assert_eq!(name, "worker-1");
    }

    #[test]
    fn foreign_keys_are_rejected() {
        assert!(parse_key("/minik8s", ResourceKind::Pod, b"/other/Pod/default/x").is_none());
        assert!(parse_key("/minik8s", ResourceKind::Pod, b"/minik8s/Node/w1").is_none());
    }
}
