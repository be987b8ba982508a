//! REST endpoints under `/api/v1alpha1` plus health probes.
//!
//! Collection endpoints return `{apiVersion, kind: <Kind>List, items}`;
//! watch endpoints hold the connection open and stream newline-delimited
//! `{"type", "object"}` events, starting with a snapshot of live objects.

use crate::api::validation::{self, ValidationError};
use crate::store::{Store, StoreError};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::{EventType, Object, ObjectList, PodPhase, ResourceKind, API_VERSION};
use futures::StreamExt;
use log::{debug, info};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
}

/// Error envelope mapped onto HTTP statuses per the store taxonomy.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

pub fn build_router(store: Arc<dyn Store>) -> Router {
    let state = AppState { store };

    let api = Router::new()
        .merge(namespaced_routes(ResourceKind::Pod, "pods"))
        .merge(namespaced_routes(ResourceKind::ReplicaSet, "replicasets"))
        .merge(namespaced_routes(ResourceKind::Deployment, "deployments"))
        .merge(cluster_routes(ResourceKind::Node, "nodes"));

    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(health))
        .nest("/api/v1alpha1", api)
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    addr: std::net::SocketAddr,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = build_router(store);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn namespaced_routes(kind: ResourceKind, plural: &str) -> Router<AppState> {
    let collection = format!("/namespaces/{{namespace}}/{plural}");
    let item = format!("/namespaces/{{namespace}}/{plural}/{{name}}");
    let item_watch = format!("/namespaces/{{namespace}}/{plural}/{{name}}/watch");
    let all = format!("/{plural}");

    Router::new()
        .route(
            &collection,
            get(move |state: State<AppState>, Path(namespace): Path<String>| async move {
                list_objects(state, kind, namespace).await
            })
            .post(
                move |state: State<AppState>, Path(namespace): Path<String>, body: Bytes| async move {
                    create_object(state, kind, namespace, body).await
                },
            ),
        )
        .route(
            &item,
            get(
                move |state: State<AppState>, Path((namespace, name)): Path<(String, String)>| async move {
                    get_object(state, kind, namespace, name).await
                },
            )
            .put(
                move |state: State<AppState>,
                      Path((namespace, name)): Path<(String, String)>,
                      body: Bytes| async move {
                    update_object(state, kind, namespace, name, body).await
                },
            )
            .delete(
                move |state: State<AppState>, Path((namespace, name)): Path<(String, String)>| async move {
                    delete_object(state, kind, namespace, name).await
                },
            ),
        )
        .route(
            &item_watch,
            get(
                move |state: State<AppState>, Path((namespace, name)): Path<(String, String)>| async move {
                    watch_object(state, kind, namespace, Some(name)).await
                },
            ),
        )
        // Cross-namespace listing, e.g. `GET /api/v1alpha1/pods`.
        .route(
            &all,
            get(move |state: State<AppState>| async move {
                list_objects(state, kind, String::new()).await
            }),
        )
}

fn cluster_routes(kind: ResourceKind, plural: &str) -> Router<AppState> {
    let collection = format!("/{plural}");
    let item = format!("/{plural}/{{name}}");
    let item_watch = format!("/{plural}/{{name}}/watch");

    Router::new()
        .route(
            &collection,
            get(move |state: State<AppState>| async move {
                list_objects(state, kind, String::new()).await
            })
            .post(move |state: State<AppState>, body: Bytes| async move {
                create_object(state, kind, String::new(), body).await
            }),
        )
        .route(
            &item,
            get(move |state: State<AppState>, Path(name): Path<String>| async move {
                get_object(state, kind, String::new(), name).await
            })
            .put(
                move |state: State<AppState>, Path(name): Path<String>, body: Bytes| async move {
                    update_object(state, kind, String::new(), name, body).await
                },
            )
            .delete(move |state: State<AppState>, Path(name): Path<String>| async move {
                delete_object(state, kind, String::new(), name).await
            }),
        )
        .route(
            &item_watch,
            get(move |state: State<AppState>, Path(name): Path<String>| async move {
                watch_object(state, kind, String::new(), Some(name)).await
            }),
        )
}

fn decode_body(kind: ResourceKind, body: &[u8]) -> Result<Object, ApiError> {
    Object::decode(kind, body).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("invalid {kind} body: {e}"),
    })
}

/// Fill the fields clients may omit: identity from the route, a fresh UID,
/// and the initial Pending phase for pods.
fn apply_create_defaults(obj: &mut Object, namespace: &str) {
    {
        let cluster_scoped = !obj.kind().is_namespaced();
        let meta = obj.metadata_mut();
        if cluster_scoped {
            meta.namespace.clear();
        } else if !namespace.is_empty() {
            meta.namespace = namespace.to_string();
        }
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version.clear();
        meta.creation_timestamp = None;
    }
    normalize_type_meta(obj);
    if let Object::Pod(pod) = obj {
        pod.status.phase = PodPhase::Pending;
    }
}

fn normalize_type_meta(obj: &mut Object) {
    let kind = obj.kind().as_str().to_string();
    match obj {
        Object::Pod(p) => {
            p.kind = kind;
            p.api_version = API_VERSION.to_string();
        }
        Object::Node(n) => {
            n.kind = kind;
            n.api_version = API_VERSION.to_string();
        }
        Object::ReplicaSet(r) => {
            r.kind = kind;
            r.api_version = API_VERSION.to_string();
        }
        Object::Deployment(d) => {
            d.kind = kind;
            d.api_version = API_VERSION.to_string();
        }
    }
}

async fn create_object(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
    body: Bytes,
) -> ApiResult {
    let mut obj = decode_body(kind, &body)?;
    validation::validate(&obj)?;
    apply_create_defaults(&mut obj, &namespace);

    let stored = state.store.create(obj).await?;
    debug!("created {kind} {}/{}", stored.namespace(), stored.name());
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

async fn list_objects(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
) -> ApiResult {
    let items = state.store.list(kind, &namespace).await?;
    Ok(Json(ObjectList::new(kind, items)).into_response())
}

async fn get_object(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
    name: String,
) -> ApiResult {
    let obj = state.store.get(kind, &namespace, &name).await?;
    Ok(Json(obj).into_response())
}

async fn update_object(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
    name: String,
    body: Bytes,
) -> ApiResult {
    let mut obj = decode_body(kind, &body)?;
    {
        let meta = obj.metadata_mut();
        meta.namespace = namespace;
        meta.name = name;
    }
    normalize_type_meta(&mut obj);
    validation::validate(&obj)?;

    let stored = state.store.update(obj).await?;
    Ok(Json(stored).into_response())
}

async fn delete_object(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
    name: String,
) -> ApiResult {
    state.store.delete(kind, &namespace, &name).await?;
    Ok(StatusCode::OK.into_response())
}

/// Upgrade to a chunked event stream. Events are filtered to `name` when
/// the route targets a single object; `ERROR` events always pass through.
async fn watch_object(
    State(state): State<AppState>,
    kind: ResourceKind,
    namespace: String,
    name: Option<String>,
) -> ApiResult {
    let watch = state.store.watch(kind, &namespace).await?;

    let lines = watch.into_stream().filter_map(move |event| {
        let keep = match (&event.object, event.event_type) {
            (Some(obj), _) => name.as_deref().is_none_or(|n| obj.name() == n),
            (None, EventType::Error) => true,
            (None, _) => false,
        };
        futures::future::ready(keep.then(|| {
            let mut line = serde_json::to_vec(&event).unwrap_or_default();
            line.push(b'\n');
            Ok::<_, Infallible>(Bytes::from(line))
        }))
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}
