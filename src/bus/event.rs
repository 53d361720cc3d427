//! Typed events flowing through the in-process bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AgentHealth, ExperimentState, TaskStatus};

/// Event categories, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    TaskProgress,
    ExperimentUpdate,
    MetricFlow,
    Alert,
}

/// Alert severity carried on [`EventPayload::Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Typed event payloads, discriminated by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    AgentStatus {
        host_id: String,
        health: AgentHealth,
        version: String,
    },
    TaskProgress {
        task_id: Uuid,
        host_id: String,
        experiment_id: Option<Uuid>,
        status: TaskStatus,
        message: Option<String>,
    },
    ExperimentUpdate {
        experiment_id: Uuid,
        state: ExperimentState,
        message: Option<String>,
    },
    MetricFlow {
        host_id: Option<String>,
        experiment_id: Option<Uuid>,
        metrics: HashMap<String, f64>,
        cost_per_minute: Option<f64>,
    },
    Alert {
        severity: AlertSeverity,
        message: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AgentStatus { .. } => EventType::AgentStatus,
            Self::TaskProgress { .. } => EventType::TaskProgress,
            Self::ExperimentUpdate { .. } => EventType::ExperimentUpdate,
            Self::MetricFlow { .. } => EventType::MetricFlow,
            Self::Alert { .. } => EventType::Alert,
        }
    }
}

/// A transient event. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    /// Component that published the event (e.g. "queue", "engine").
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    /// Free-form routing metadata (e.g. experiment_id), used by filters.
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: payload.event_type(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
