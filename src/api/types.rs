//! Request/response DTOs and the error-body mapping for the HTTP surface.

use std::collections::HashMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, EngineError, ErrorKind, QueueError, StoreError};
use crate::model::{
    AgentCommand, AgentHealth, ResourceLimits, SignalType, Task, TaskStatus, TaskType,
};

/// JSON error body: `{"error": {"kind": "...", "message": "..."}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

/// Error wrapper every handler returns; maps the error taxonomy onto HTTP.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    fn from_kind(kind: ErrorKind, source: impl std::fmt::Display) -> Self {
        // Internal detail never leaks to external callers.
        if kind == ErrorKind::Internal {
            tracing::error!(error = %source, "Internal error");
            Self::new(kind, "internal error")
        } else {
            Self::new(kind, source.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::NotOwner => StatusCode::CONFLICT,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind.as_str(),
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::from_kind(e.kind(), e)
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self::from_kind(e.kind(), e)
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self::from_kind(e.kind(), e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::from_kind(e.kind(), e)
    }
}

// ==================== Agent surface ====================

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub assigned_id: String,
    pub status: AgentHealth,
    pub commands: Vec<AgentCommand>,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Maximum tasks to lease (default 1).
    pub max: Option<i64>,
    /// Long-poll wait in seconds (default from config).
    pub wait: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: Option<HashMap<String, f64>>,
}

impl ProgressRequest {
    /// Fold reported metrics into the result payload when the agent did not
    /// send an explicit result.
    pub fn into_result(self) -> (TaskStatus, Option<serde_json::Value>, Option<String>) {
        let result = match (self.result, self.metrics) {
            (Some(result), _) => Some(result),
            (None, Some(metrics)) => Some(serde_json::json!({ "metrics": metrics })),
            (None, None) => None,
        };
        (self.status, result, self.message)
    }
}

/// Task as served to agents and the debug API.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    pub host_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub experiment_id: Option<Uuid>,
    pub visible_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            host_id: task.host_id.clone(),
            task_type: task.task_type,
            payload: task.payload.clone(),
            priority: task.priority,
            status: task.display_status(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            experiment_id: task.experiment_id,
            visible_at: task.visible_at,
            lease_expires_at: task.lease_expires_at,
            created_at: task.created_at,
        }
    }
}

// ==================== Client surface ====================

#[derive(Debug, Deserialize)]
pub struct ListExperimentsQuery {
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub reason: String,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[derive(Debug, Deserialize)]
pub struct NewDeploymentRequest {
    pub deployment_name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub pipeline: String,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListDeploymentsQuery {
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub host_id: Option<String>,
    pub experiment_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_expected_status_codes() {
        let cases = [
            (ErrorKind::Validation, StatusCode::BAD_REQUEST),
            (ErrorKind::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::Conflict, StatusCode::CONFLICT),
            (ErrorKind::NotOwner, StatusCode::CONFLICT),
            (ErrorKind::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ErrorKind::PermissionDenied, StatusCode::FORBIDDEN),
            (ErrorKind::Transient, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::Cancelled, StatusCode::REQUEST_TIMEOUT),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            assert_eq!(ApiError::new(kind, "x").status(), status);
        }
    }

    #[test]
    fn internal_detail_is_suppressed() {
        let err: ApiError = StoreError::Statement("secret table names".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn conflict_detail_is_preserved() {
        let err: ApiError = StoreError::conflict("duplicate deployment").into();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("duplicate deployment"));
    }

    #[test]
    fn progress_request_folds_metrics_into_result() {
        let request = ProgressRequest {
            status: TaskStatus::Completed,
            message: None,
            result: None,
            metrics: Some(HashMap::from([("cardinality".to_string(), 42.0)])),
        };
        let (_, result, _) = request.into_result();
        assert_eq!(result.unwrap()["metrics"]["cardinality"], 42.0);
    }

    #[test]
    fn signal_request_parses_with_defaults() {
        let request: SignalRequest =
            serde_json::from_str(r#"{"type":"rollback"}"#).unwrap();
        assert_eq!(request.signal_type, SignalType::Rollback);
        assert!(request.reason.is_empty());
        assert!(request.parameters.is_object());
    }
}
