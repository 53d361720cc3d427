//! Wire protocol between the hub and dashboard clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{AlertSeverity, Event, EventPayload};
use crate::model::{AgentHealth, ExperimentState, TaskStatus};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

/// Messages the hub emits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        connection_id: Uuid,
    },
    AgentStatusUpdate {
        host_id: String,
        health: AgentHealth,
        version: String,
    },
    ExperimentUpdate {
        experiment_id: Uuid,
        state: ExperimentState,
        message: Option<String>,
    },
    MetricFlowUpdate {
        host_id: Option<String>,
        experiment_id: Option<Uuid>,
        metrics: HashMap<String, f64>,
        cost_per_minute: Option<f64>,
    },
    TaskProgressUpdate {
        task_id: Uuid,
        host_id: String,
        experiment_id: Option<Uuid>,
        status: TaskStatus,
        message: Option<String>,
    },
    AlertEvent {
        severity: AlertSeverity,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Alerts survive backpressure drops.
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::AlertEvent { .. })
    }
}

/// Translate a bus event into its topic and client message.
///
/// A `None` topic means the message goes to every connected client
/// regardless of subscriptions (alerts).
pub fn translate(event: &Event) -> Option<(Option<String>, ServerMessage)> {
    match &event.payload {
        EventPayload::AgentStatus {
            host_id,
            health,
            version,
        } => Some((
            Some(format!("agents.{host_id}")),
            ServerMessage::AgentStatusUpdate {
                host_id: host_id.clone(),
                health: *health,
                version: version.clone(),
            },
        )),
        EventPayload::TaskProgress {
            task_id,
            host_id,
            experiment_id,
            status,
            message,
        } => {
            let topic = match experiment_id {
                Some(id) => format!("experiments.{id}"),
                None => format!("agents.{host_id}"),
            };
            Some((
                Some(topic),
                ServerMessage::TaskProgressUpdate {
                    task_id: *task_id,
                    host_id: host_id.clone(),
                    experiment_id: *experiment_id,
                    status: *status,
                    message: message.clone(),
                },
            ))
        }
        EventPayload::ExperimentUpdate {
            experiment_id,
            state,
            message,
        } => Some((
            Some(format!("experiments.{experiment_id}")),
            ServerMessage::ExperimentUpdate {
                experiment_id: *experiment_id,
                state: *state,
                message: message.clone(),
            },
        )),
        EventPayload::MetricFlow {
            host_id,
            experiment_id,
            metrics,
            cost_per_minute,
        } => {
            let topic = match experiment_id {
                Some(id) => format!("experiments.{id}.metrics"),
                None => "fleet.summary".to_string(),
            };
            Some((
                Some(topic),
                ServerMessage::MetricFlowUpdate {
                    host_id: host_id.clone(),
                    experiment_id: *experiment_id,
                    metrics: metrics.clone(),
                    cost_per_minute: *cost_per_minute,
                },
            ))
        }
        EventPayload::Alert { severity, message } => Some((
            None,
            ServerMessage::AlertEvent {
                severity: *severity,
                message: message.clone(),
            },
        )),
    }
}
