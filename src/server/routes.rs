//! HTTP API
//!
//! Every cluster-facing handler validates its input first, then connects
//! with the caller's header credentials, then does the work. A request
//! cancelled during the connection probe gets a plain message back.
//!
//! Work that mutates the cluster runs on its own task. A caller that goes
//! away mid-update only loses the response; the update still commits or
//! unwinds.

use super::credentials::credentials_from_headers;
use super::error::ApiError;
use super::health::{self, ReadinessState};
use super::metrics::SharedMetrics;
use crate::cancel::CancelSignal;
use crate::cluster::{ClusterApi, ClusterConnection, ClusterCredentials, Connector};
use crate::objects::{create_object, CreatedObject, KubeObject, ObjectKind};
use crate::update::{
    read_deployment_status, rollback, select_updater, DeploymentRef, UpdatePlan, UpdateRequest,
    Updater, UpdaterOptions, INVALID_FORM,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Sent back when the caller cancelled during the connection probe
pub const CANCELLED_MESSAGE: &str = "request cancelled while getting server version";

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<Connector>,
    pub updater_options: UpdaterOptions,
    pub readiness: ReadinessState,
    pub metrics: SharedMetrics,
    pub cancel: CancelSignal,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route(
            "/resources/namespaces/{namespace}/deployments/{deployment}",
            patch(update_deployment),
        )
        .route(
            "/resources/namespaces/{namespace}/deployments/{deployment}/status",
            get(deployment_status),
        )
        .route(
            "/resources/namespaces/{namespace}/deployments/{deployment}/rollback",
            post(rollback_deployment),
        )
        .route("/resources", post(create_manifests))
        .route("/resources/deployments", post(create_deployments))
        .route("/resources/services", post(create_services))
        .with_state(state)
}

/// Serve the API on `port` until the state's cancel signal fires
///
/// Readiness is set once the listener is bound.
pub async fn run_server(port: u16, state: AppState) -> Result<(), std::io::Error> {
    let mut shutdown = state.cancel.clone();
    let readiness = state.readiness.clone();
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - server is actually listening
    info!(port = %port, "API server listening (HTTP)");
    readiness.set_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Connect with the caller's credentials, recording the outcome
///
/// `Ok(None)` means the request was cancelled during the probe, either by
/// shutdown or because the caller went away.
async fn connect(
    state: &AppState,
    credentials: &ClusterCredentials,
    cancel: &CancelSignal,
) -> Result<Option<ClusterConnection>, ApiError> {
    let kind = credentials.kind().as_str();

    match state.connector.connect(credentials, cancel).await {
        Ok(Some(connection)) => {
            state.metrics.record_connection(kind, "success");
            Ok(Some(connection))
        }
        Ok(None) => {
            state.metrics.record_connection(kind, "cancelled");
            Ok(None)
        }
        Err(e) => {
            state.metrics.record_connection(kind, "error");
            Err(e.into())
        }
    }
}

/// Connect, then run `work` against the cluster on a detached task
///
/// Dropping the returned future (the caller disconnected) cancels the
/// connection probe. Once connected, `work` always runs to completion.
async fn with_cluster<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    work: F,
) -> Result<Response, ApiError>
where
    F: FnOnce(Arc<dyn ClusterApi>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
{
    let credentials = credentials_from_headers(headers)?;
    // Trips the probe if this future is dropped before the task connects
    let (_guard, cancel) = state.cancel.child();
    let state = state.clone();

    detached(async move {
        let connection = match connect(&state, &credentials, &cancel).await {
            Ok(Some(connection)) => connection,
            Ok(None) => return Ok(cancelled()),
            Err(e) => return Err(e),
        };
        work(connection.api).await
    })
    .await?
}

async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| {
        warn!(error = %e, "Cluster task did not complete");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cluster task did not complete")
    })
}

fn cancelled() -> Response {
    (StatusCode::OK, Json(json!({ "message": CANCELLED_MESSAGE }))).into_response()
}

async fn update_deployment(
    State(state): State<AppState>,
    Path((namespace, deployment)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Error binding the update form");
        ApiError::bad_request(INVALID_FORM)
    })?;
    let plan = request.into_plan(DeploymentRef::new(namespace, deployment))?;
    let updater = select_updater(plan.strategy, &state.updater_options)?;
    let metrics = state.metrics.clone();

    with_cluster(&state, &headers, move |api| run_update(api, updater, plan, metrics)).await
}

async fn run_update(
    api: Arc<dyn ClusterApi>,
    updater: Box<dyn Updater>,
    plan: UpdatePlan,
    metrics: SharedMetrics,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let result = updater.update(api.as_ref(), &plan).await;
    let duration_secs = started.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            metrics.record_update_success(updater.name(), duration_secs);
            Ok((StatusCode::OK, Json(outcome)).into_response())
        }
        Err(e) => {
            metrics.record_update_error(updater.name(), duration_secs);
            warn!(deployment = %plan.target, strategy = updater.name(), error = %e, "Update failed");
            Err(e.into())
        }
    }
}

async fn deployment_status(
    State(state): State<AppState>,
    Path((namespace, deployment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let target = DeploymentRef::new(namespace, deployment);
    with_cluster(&state, &headers, move |api| async move {
        read_deployment_status(api.as_ref(), &target)
            .await
            .map(|report| Json(report).into_response())
            .map_err(ApiError::from)
    })
    .await
}

async fn rollback_deployment(
    State(state): State<AppState>,
    Path((namespace, deployment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let target = DeploymentRef::new(namespace, deployment);
    with_cluster(&state, &headers, move |api| async move {
        rollback(api.as_ref(), &target)
            .await
            .map(|outcome| Json(outcome).into_response())
            .map_err(ApiError::from)
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    /// Overrides the namespace of every uploaded object
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Per-object results for an array upload
#[derive(Debug, Default, Serialize)]
pub struct CreationReport {
    pub messages: CreationMessages,
    pub created: Vec<CreatedObject>,
}

#[derive(Debug, Default, Serialize)]
pub struct CreationMessages {
    pub success: Vec<String>,
    pub error: Vec<String>,
}

async fn create_deployments(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let batch = body.is_array();
    let objects = KubeObject::decode_body(ObjectKind::Deployment, body)?;
    create_objects(state, query, headers, objects, batch).await
}

async fn create_services(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let batch = body.is_array();
    let objects = KubeObject::decode_body(ObjectKind::Service, body)?;
    create_objects(state, query, headers, objects, batch).await
}

/// Mixed upload; each object's own `kind` picks how it is created
async fn create_manifests(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let batch = body.is_array();
    let objects = KubeObject::decode_manifests(body)?;
    create_objects(state, query, headers, objects, batch).await
}

async fn create_objects(
    state: AppState,
    query: CreateQuery,
    headers: HeaderMap,
    mut objects: Vec<KubeObject>,
    batch: bool,
) -> Result<Response, ApiError> {
    if let Some(namespace) = query.namespace.as_deref().filter(|n| !n.is_empty()) {
        info!(namespace = %namespace, "Setting default namespace");
        for object in &mut objects {
            object.set_namespace(namespace);
        }
    }

    with_cluster(&state, &headers, move |api| async move {
        if batch {
            let (status, report) = create_batch(api, objects).await;
            return Ok((status, Json(report)).into_response());
        }
        let Some(object) = objects.into_iter().next() else {
            return Err(ApiError::bad_request("no object provided"));
        };
        create_object(api.as_ref(), object)
            .await
            .map(|created| (StatusCode::CREATED, Json(created)).into_response())
            .map_err(ApiError::from)
    })
    .await
}

/// Create every object in order, collecting a message per object
async fn create_batch(
    api: Arc<dyn ClusterApi>,
    objects: Vec<KubeObject>,
) -> (StatusCode, CreationReport) {
    let mut report = CreationReport::default();
    let mut statuses = Vec::with_capacity(objects.len());
    for object in objects {
        match create_object(api.as_ref(), object).await {
            Ok(created) => {
                statuses.push(StatusCode::CREATED);
                report.messages.success.push(created.message.clone());
                report.created.push(created);
            }
            Err(e) => {
                let error = ApiError::from(e);
                statuses.push(error.status);
                report.messages.error.push(error.message);
            }
        }
    }

    (most_seen_status(&statuses), report)
}

/// The most frequent status; ties go to the one seen first
pub fn most_seen_status(statuses: &[StatusCode]) -> StatusCode {
    let mut counts: HashMap<StatusCode, usize> = HashMap::new();
    for status in statuses {
        *counts.entry(*status).or_default() += 1;
    }

    let mut best: Option<(StatusCode, usize)> = None;
    for status in statuses {
        let count = counts.get(status).copied().unwrap_or_default();
        if best.is_none_or(|(_, best_count)| count > best_count) {
            best = Some((*status, count));
        }
    }
    best.map(|(status, _)| status)
        .unwrap_or(StatusCode::BAD_REQUEST)
}
