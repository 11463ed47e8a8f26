//! Handlers for `GET /`, `GET /health`, `GET /ready` and `GET /queues`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::AppState;
use crate::error::MailroomResult;
use crate::service::{check_dependencies, DependencyCheck};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/queues", get(queues))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub component: &'static str,
    pub version: &'static str,
    pub instance: String,
    pub started_on: String,
}

async fn index(State(state): State<AppState>) -> Json<IndexResponse> {
    Json(IndexResponse {
        component: "mailroom",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.rt.config.instance_name.clone(),
        started_on: state.started_on.to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

/// Liveness: the process is up
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub checks: Vec<DependencyCheck>,
}

/// Readiness: every dependency answers
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let checks = check_dependencies(&state.rt).await;
    let healthy = checks.iter().all(|c| c.healthy);
    debug!(healthy, "Readiness probe");

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if healthy { "ready" } else { "not_ready" };
    (code, Json(ReadyResponse { status, checks }))
}

#[derive(Debug, Default, Serialize)]
pub struct QueueStatus {
    pub size: usize,
    pub max_active_per_owner: usize,
    pub owners: BTreeMap<String, OwnerStatus>,
    pub paused: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct OwnerStatus {
    pub queued: usize,
    pub active: usize,
}

async fn queue_status(state: &AppState) -> MailroomResult<BTreeMap<String, QueueStatus>> {
    let mut statuses = BTreeMap::new();
    for queue in state.rt.queues.all() {
        let mut status = QueueStatus {
            size: queue.size().await?,
            max_active_per_owner: queue.max_active_per_owner(),
            ..Default::default()
        };
        for owner_id in queue.owners().await? {
            status.owners.insert(
                owner_id.to_string(),
                OwnerStatus {
                    queued: queue.owner_size(owner_id).await?,
                    active: queue.active(owner_id).await?,
                },
            );
        }
        status.paused = queue
            .paused()
            .await?
            .into_iter()
            .map(|o| o.to_string())
            .collect();
        statuses.insert(queue.name().to_string(), status);
    }
    Ok(statuses)
}

async fn queues(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, QueueStatus>>, (StatusCode, String)> {
    queue_status(&state)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}
