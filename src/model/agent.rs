//! Host agent registry entries and liveness.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Derived liveness of an agent, computed from its last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Offline,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Self-description an agent sends with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
}

/// Commands piggybacked on heartbeat responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    ForceRestart { reason: String },
}

/// An agent row. Created on first heartbeat, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub host_id: String,
    pub hostname: String,
    pub group: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    pub version: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Derived status against the configured liveness windows.
    pub fn health(&self, now: DateTime<Utc>, healthy_window: Duration, offline_threshold: Duration) -> AgentHealth {
        let silence = now - self.last_heartbeat_at;
        if silence <= healthy_window {
            AgentHealth::Healthy
        } else if silence <= offline_threshold {
            AgentHealth::Degraded
        } else {
            AgentHealth::Offline
        }
    }
}
