//! Internal admin/debug HTTP surface over the instance registry.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use nodepool_common::{Instance, InstanceId, InstanceStatus};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::LauncherConfig;
use crate::instance_registry::InstanceRegistry;

pub struct AppState {
    pub registry: Arc<InstanceRegistry>,
    pub provider_name: String,
    pub launcher: LauncherConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/instances", get(list_instances).post(request_instances))
        .route("/instances/{id}", get(get_instance))
        .with_state(state)
}

async fn root() -> &'static str {
    "Nodepool Orchestrator Online"
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut counts: BTreeMap<&'static str, usize> =
        InstanceStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    // Claimed by a launcher but not yet resolved either way.
    let mut launches_in_progress = 0;
    for instance in state.registry.get_instances(&[]).values() {
        *counts.entry(instance.status.as_str()).or_default() += 1;
        if instance.status != InstanceStatus::Unknown && !instance.status.is_launch_terminal() {
            launches_in_progress += 1;
        }
    }

    Json(json!({
        "provider": state.provider_name,
        "storage_version": state.registry.storage_version(),
        "instances_count": state.registry.len(),
        "instances_by_status": counts,
        "launches_in_progress": launches_in_progress,
        "max_concurrent_requests": state.launcher.max_concurrent_requests(),
        "max_nodes_per_request": state.launcher.max_nodes_per_request(),
    }))
}

#[derive(Deserialize, Debug)]
struct ListInstancesQuery {
    /// Comma-separated status filter, e.g. `status=requested,allocated`.
    status: Option<String>,
}

async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListInstancesQuery>,
) -> Response {
    let mut filter = Vec::new();
    if let Some(raw) = query.status.as_deref() {
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match InstanceStatus::parse(part) {
                Some(status) => filter.push(status),
                None => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "invalid_status", "status": part})),
                    )
                        .into_response()
                }
            }
        }
    }

    let mut instances: Vec<Instance> = state.registry.get_instances(&filter).into_values().collect();
    instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Json(instances).into_response()
}

#[derive(Deserialize, Debug)]
struct RequestInstancesBody {
    instance_type: String,
    count: usize,
}

async fn request_instances(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RequestInstancesBody>,
) -> Response {
    let instance_type = payload.instance_type.trim();
    if instance_type.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "instance_type_required"})),
        )
            .into_response();
    }
    if payload.count == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "count_must_be_positive"})),
        )
            .into_response();
    }

    let created = state.registry.request_instances(instance_type, payload.count);
    info!(instance_type, count = created.len(), "Instances requested via admin API");
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn get_instance(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<InstanceId>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_instance_id"})),
        )
            .into_response();
    };

    match state.registry.get_instance(&id) {
        Some(instance) => Json(instance).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "instance_not_found"})),
        )
            .into_response(),
    }
}
