//! Agent-facing endpoints: heartbeat, long-poll, progress.
//!
//! Agents authenticate with the `X-Agent-Host-ID` header plus, when the
//! server is configured with one, a shared bearer token.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::server::ApiState;
use crate::api::types::{ApiError, HeartbeatResponse, PollQuery, ProgressRequest, TaskView};
use crate::model::AgentInfo;

pub const HOST_ID_HEADER: &str = "x-agent-host-id";

/// Pull the host id and check the shared token. Missing header or a bad
/// token rejects with the `unauthenticated` kind.
fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<String, ApiError> {
    let host_id = headers
        .get(HOST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::unauthenticated("X-Agent-Host-ID header required"))?;

    if let Some(expected) = &state.agent_token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.expose_secret()) {
            return Err(ApiError::unauthenticated("invalid agent token"));
        }
    }

    Ok(host_id.to_string())
}

pub async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(info): Json<AgentInfo>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let host_id = authenticate(&state, &headers)?;
    let ack = state.dispatcher.heartbeat(&host_id, &info).await?;
    Ok(Json(HeartbeatResponse {
        assigned_id: ack.assigned_id,
        status: ack.health,
        commands: ack.commands,
    }))
}

/// Long-poll for tasks. Held until a task arrives, the wait elapses or the
/// client goes away (dropping the request future cancels the poll).
pub async fn poll_tasks(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let host_id = authenticate(&state, &headers)?;
    let tasks = state
        .dispatcher
        .poll_tasks(
            &host_id,
            query.max.unwrap_or(1),
            query.wait.map(Duration::from_secs),
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

/// Idempotent task status report.
pub async fn report_progress(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(request): Json<ProgressRequest>,
) -> Result<Json<TaskView>, ApiError> {
    let host_id = authenticate(&state, &headers)?;
    let (status, result, message) = request.into_result();
    let task = state
        .dispatcher
        .report_progress(&host_id, task_id, status, result, message.as_deref())
        .await?;
    Ok(Json(TaskView::from(task)))
}

#[derive(Debug, serde::Serialize)]
pub struct LeaseExtension {
    pub lease_expires_at: DateTime<Utc>,
}

/// Extend the lease on a long-running task.
pub async fn heartbeat_task(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> Result<Json<LeaseExtension>, ApiError> {
    let host_id = authenticate(&state, &headers)?;
    let lease_expires_at = state.dispatcher.heartbeat_task(&host_id, task_id).await?;
    Ok(Json(LeaseExtension { lease_expires_at }))
}
