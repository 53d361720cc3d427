//! Control signals: the append-only audit log of operator interventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    TrafficSplit,
    Rollback,
    ConfigUpdate,
    Pause,
    Resume,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrafficSplit => "traffic_split",
            Self::Rollback => "rollback",
            Self::ConfigUpdate => "config_update",
            Self::Pause => "pause",
            Self::Resume => "resume",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traffic_split" => Ok(Self::TrafficSplit),
            "rollback" => Ok(Self::Rollback),
            "config_update" => Ok(Self::ConfigUpdate),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            _ => Err(format!("unknown signal type '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Applied,
    Rejected,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("unknown signal status '{s}'")),
        }
    }
}

/// One operator intervention on an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSignal {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub signal_type: SignalType,
    pub parameters: serde_json::Value,
    pub reason: String,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl ControlSignal {
    pub fn new(experiment_id: Uuid, signal_type: SignalType, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            signal_type,
            parameters: serde_json::Value::Object(Default::default()),
            reason: reason.into(),
            status: SignalStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}
