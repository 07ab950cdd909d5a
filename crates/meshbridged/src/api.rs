//! HTTP query and command API, served over axum.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use meshbridge_core::{HexPrefix, NodeTag, PublicKey, TagValue};
use meshbridge_queue::{CommandType, EnqueueOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::supervisor::AppState;

const DEFAULT_LIST_LIMIT: usize = 100;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/:prefix_or_key", get(get_node))
        .route("/messages", get(list_messages))
        .route("/advertisements", get(list_advertisements))
        .route("/telemetry/:node_public_key", get(list_telemetry))
        .route("/trace_paths", get(list_trace_paths))
        .route("/tags/:node_public_key", get(get_tags))
        .route("/tags/:node_public_key/:key", put(put_tag))
        .route("/tags/:node_public_key/:key", delete(delete_tag))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/commands/:command_type", post(post_command))
        .with_state(state)
}

/// A handler-local error type mapping store/validation failures to HTTP statuses.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.bearer_token else { return Ok(()) };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError(StatusCode::UNAUTHORIZED, "missing or invalid bearer token".into()))
    }
}

fn require_write(state: &AppState) -> Result<(), ApiError> {
    if state.enable_write {
        Ok(())
    } else {
        Err(ApiError(StatusCode::FORBIDDEN, "write operations are disabled".into()))
    }
}

#[derive(Deserialize, Default)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_nodes(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.store.list_nodes()?).into_response())
}

async fn get_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(prefix_or_key): Path<String>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let prefix = HexPrefix::new(&prefix_or_key).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let nodes = state.store.find_by_prefix(&prefix)?;
    if nodes.is_empty() {
        return Err(ApiError(StatusCode::NOT_FOUND, "no node matches".into()));
    }
    Ok(Json(nodes).into_response())
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.store.list_messages(params.limit.unwrap_or(DEFAULT_LIST_LIMIT))?).into_response())
}

async fn list_advertisements(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.store.list_advertisements(params.limit.unwrap_or(DEFAULT_LIST_LIMIT))?).into_response())
}

async fn list_trace_paths(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.store.list_trace_paths(params.limit.unwrap_or(DEFAULT_LIST_LIMIT))?).into_response())
}

async fn list_telemetry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(node_public_key): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let key = PublicKey::new(&node_public_key).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state.store.list_telemetry(&key, params.limit.unwrap_or(DEFAULT_LIST_LIMIT))?).into_response())
}

async fn get_tags(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(node_public_key): Path<String>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let key = PublicKey::new(&node_public_key).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state.store.get_tags(&key)?).into_response())
}

async fn put_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node_public_key, tag_key)): Path<(String, String)>,
    Json(value): Json<TagValue>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    require_write(&state)?;
    let key = PublicKey::new(&node_public_key).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let now = (state.now_unix)();
    let tag = NodeTag { node_public_key: key, key: tag_key, value, updated_at: now };
    state.store.upsert_tag(&tag, now)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node_public_key, tag_key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    require_write(&state)?;
    let key = PublicKey::new(&node_public_key).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    state.store.delete_tag(&key, &tag_key)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(json!({
        "queue": state.queue.stats(),
        "device_connected": state.device.is_connected(),
    }))
    .into_response())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn post_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(command_type): Path<String>,
    Json(params): Json<Value>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    require_write(&state)?;
    let command_type = CommandType::from_str(&command_type)
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("unknown command type {command_type}")))?;
    let request_id = params
        .get("request_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid_like());
    let now = (state.now_unix)();

    match state.queue.enqueue(command_type, params, request_id, now) {
        Ok(EnqueueOutcome::Enqueued(info)) => Ok((StatusCode::ACCEPTED, Json(info)).into_response()),
        Ok(EnqueueOutcome::Duplicate { info, waiter: Some(waiter) }) => {
            match tokio::time::timeout(Duration::from_secs_f64(state.queue_timeout_seconds), waiter).await {
                Ok(Ok(result)) => Ok((StatusCode::OK, Json(result)).into_response()),
                Ok(Err(_)) | Err(_) => Ok((StatusCode::ACCEPTED, Json(info)).into_response()),
            }
        }
        Ok(EnqueueOutcome::Duplicate { info, waiter: None }) => Ok((StatusCode::ACCEPTED, Json(info)).into_response()),
        Ok(EnqueueOutcome::DuplicateCompleted(result)) => Ok((StatusCode::OK, Json(result)).into_response()),
        Err(e) => {
            warn!(error = %e, "command rejected");
            Err(ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

fn uuid_like() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}
