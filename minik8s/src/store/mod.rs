//! Typed object persistence with a change feed.
//!
//! Two backends implement the same [`Store`] contract: an embedded
//! in-memory store for single-process deployments and tests, and an
//! etcd-backed store for durable multi-client clusters. Watchers receive a
//! synthetic `Added` snapshot of live objects on subscription, then live
//! events. Delivery is best effort: a full per-watcher buffer drops the
//! event and bumps a counter the consumer can inspect, after which it is
//! expected to re-list.

use async_trait::async_trait;
use common::{Object, ResourceKind, WatchEvent};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod etcd;
pub mod factory;
pub mod memory;

pub use factory::{new_store, StoreConfig, StoreType};

/// Error taxonomy surfaced by every store operation. The API layer maps
/// these onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {namespace}/{name} of kind {kind} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    #[error("object {namespace}/{name} of kind {kind} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict on {namespace}/{name} of kind {kind}: resource version mismatch")]
    Conflict {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        StoreError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Tuning knobs shared by both backends.
#[derive(Debug, Clone)]
pub struct Options {
    /// Capacity of each watcher's event buffer.
    pub watch_buffer_size: usize,
    /// How often stopped watchers are pruned.
    pub gc_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            watch_buffer_size: 100,
            gc_interval: Duration::from_secs(300),
        }
    }
}

/// Handle to an active watch subscription. Dropping or stopping the handle
/// ends the subscription; the backend prunes its side lazily.
pub struct Watch {
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
    dropped: Arc<AtomicU64>,
}

impl Watch {
    pub(crate) fn new(
        events: mpsc::Receiver<WatchEvent>,
        cancel: CancellationToken,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            events,
            cancel,
            _guard: guard,
            dropped,
        }
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Events dropped so far because this watcher's buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Convert into a stream for chunked HTTP responses. The subscription
    /// is stopped when the stream is dropped.
    pub fn into_stream(self) -> WatchStream {
        WatchStream {
            inner: ReceiverStream::new(self.events),
            _guard: self._guard,
        }
    }
}

pub struct WatchStream {
    inner: ReceiverStream<WatchEvent>,
    _guard: DropGuard,
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// The persistence contract shared by both backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new object. The stored copy gains a resource version and
    /// creation timestamp and is returned.
    async fn create(&self, obj: Object) -> Result<Object>;

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Object>;

    /// All objects of `kind`; empty namespace spans every namespace, a
    /// non-empty namespace matches exactly. Order is unspecified.
    async fn list(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<Object>>;

    /// Replace an existing object, assigning a strictly greater resource
    /// version. A non-empty resource version on `obj` makes the write
    /// conditional: it loses with [`StoreError::Conflict`] when the stored
    /// version differs.
    async fn update(&self, obj: Object) -> Result<Object>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    /// Subscribe to changes for `kind`, optionally restricted to one
    /// namespace. Currently-live objects arrive first as `Added` events.
    async fn watch(&self, kind: ResourceKind, namespace: &str) -> Result<Watch>;

    /// Release background resources. Further calls may fail.
    async fn close(&self);
}

static LAST_REVISION: AtomicI64 = AtomicI64::new(0);

/// Next resource-version token: wall-clock nanoseconds, bumped past the
/// previous token so versions stay strictly increasing even when the clock
/// is coarse or steps backwards.
pub(crate) fn next_resource_version() -> String {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX);
    let mut prev = LAST_REVISION.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev.saturating_add(1));
        match LAST_REVISION.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next.to_string(),
            Err(actual) => prev = actual,
        }
    }
}
