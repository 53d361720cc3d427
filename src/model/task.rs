//! Durable work items consumed by host agents.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the two competing pipeline configurations a task acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Candidate => write!(f, "candidate"),
        }
    }
}

/// Task categories, stored in the `task_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Deploy,
    Update,
    Stop,
    Collect,
    Loadgen,
    Health,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploy => "deploy",
            Self::Update => "update",
            Self::Stop => "stop",
            Self::Collect => "collect",
            Self::Loadgen => "loadgen",
            Self::Health => "health",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(Self::Deploy),
            "update" => Ok(Self::Update),
            "stop" => Ok(Self::Stop),
            "collect" => Ok(Self::Collect),
            "loadgen" => Ok(Self::Loadgen),
            "health" => Ok(Self::Health),
            _ => Err(format!("unknown task type '{s}'")),
        }
    }
}

/// Task lifecycle status.
///
/// `Expired` is never persisted: a task that burned through its attempts
/// stays `Failed` in the store and is *displayed* as expired via
/// [`Task::display_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown task status '{s}'")),
        }
    }
}

/// Resource caps forwarded to the collector process on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

/// Action-specific task payload. Serialized into the `payload` JSONB column
/// with a `type` discriminator; agents decode off the discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Deploy {
        pipeline_name: String,
        rendered_config: String,
        variant: Variant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_limits: Option<ResourceLimits>,
    },
    Update {
        pipeline_name: String,
        rendered_config: String,
        variant: Variant,
    },
    Stop {
        deployment_id: Uuid,
    },
    Collect {
        metric_names: Vec<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        push_endpoint: String,
    },
    Loadgen {
        profile: String,
        duration_seconds: u64,
        process_count: u32,
    },
    Health {},
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Deploy { .. } => TaskType::Deploy,
            Self::Update { .. } => TaskType::Update,
            Self::Stop { .. } => TaskType::Stop,
            Self::Collect { .. } => TaskType::Collect,
            Self::Loadgen { .. } => TaskType::Loadgen,
            Self::Health {} => TaskType::Health,
        }
    }
}

/// A durable task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub host_id: String,
    pub experiment_id: Option<Uuid>,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub visible_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether this task could still be handed out after a failure.
    pub fn retry_eligible(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts < self.max_attempts
    }

    /// Status for API consumers: `Failed` with exhausted attempts shows as
    /// `Expired`.
    pub fn display_status(&self) -> TaskStatus {
        if self.status == TaskStatus::Failed && self.attempts >= self.max_attempts {
            TaskStatus::Expired
        } else {
            self.status
        }
    }

    /// Whether `host_id` holds a live lease on this task at `now`.
    pub fn holds_lease(&self, host_id: &str, now: DateTime<Utc>) -> bool {
        self.host_id == host_id
            && matches!(self.status, TaskStatus::Assigned | TaskStatus::Running)
            && self.lease_expires_at.is_some_and(|t| t > now)
    }

    /// Decode the typed payload.
    pub fn decode_payload(&self) -> Result<TaskPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Parameters for enqueueing a task. The queue fills in identity, status,
/// attempts and visibility.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub host_id: String,
    pub experiment_id: Option<Uuid>,
    pub payload: TaskPayload,
    pub priority: i32,
    pub max_attempts: Option<i32>,
}

impl NewTask {
    pub fn new(host_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            host_id: host_id.into(),
            experiment_id: None,
            payload,
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn for_experiment(mut self, experiment_id: Uuid) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Exponential retry backoff with jitter, applied to `visible_at` when a
/// failed task is re-queued.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryBackoff {
    /// Delay before attempt `attempt` (1-based) becomes visible again.
    ///
    /// `min(base * 2^(attempt-1), cap)` with uniform jitter in [-20%, +20%].
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped_ms = exp_ms.min(self.cap.as_millis() as u64);

        let jitter_range = capped_ms / 5; // 20%
        let jitter = if jitter_range > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_range.saturating_mul(2));
            offset as i64 - jitter_range as i64
        } else {
            0
        };
        Duration::from_millis((capped_ms as i64 + jitter).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_discriminator_round_trip() {
        let payload = TaskPayload::Deploy {
            pipeline_name: "process-topk-v1".to_string(),
            rendered_config: "receivers: {}".to_string(),
            variant: Variant::Candidate,
            resource_limits: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "deploy");
        assert_eq!(json["variant"], "candidate");

        let decoded: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.task_type(), TaskType::Deploy);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn display_status_masks_exhausted_failures() {
        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4(),
            host_id: "h1".to_string(),
            experiment_id: None,
            task_type: TaskType::Deploy,
            payload: serde_json::json!({}),
            priority: 0,
            status: TaskStatus::Failed,
            attempts: 3,
            max_attempts: 3,
            visible_at: now,
            lease_expires_at: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert_eq!(task.display_status(), TaskStatus::Expired);
        assert!(!task.retry_eligible());

        task.attempts = 1;
        assert_eq!(task.display_status(), TaskStatus::Failed);
        assert!(task.retry_eligible());
    }

    #[test]
    fn lease_ownership_requires_live_lease() {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            host_id: "h1".to_string(),
            experiment_id: None,
            task_type: TaskType::Collect,
            payload: serde_json::json!({}),
            priority: 0,
            status: TaskStatus::Assigned,
            attempts: 1,
            max_attempts: 3,
            visible_at: now,
            lease_expires_at: Some(now + chrono::Duration::seconds(60)),
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert!(task.holds_lease("h1", now));
        assert!(!task.holds_lease("h2", now));
        assert!(!task.holds_lease("h1", now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn backoff_grows_and_stays_within_jitter_bounds() {
        let backoff = RetryBackoff::default();
        for attempt in 1..=6u32 {
            let nominal_ms =
                (10_000u64 * 2u64.saturating_pow(attempt - 1)).min(300_000) as f64;
            for _ in 0..16 {
                let d = backoff.delay(attempt).as_millis() as f64;
                assert!(
                    d >= nominal_ms * 0.8 - 1.0 && d <= nominal_ms * 1.2 + 1.0,
                    "attempt {attempt}: {d}ms outside [{}, {}]",
                    nominal_ms * 0.8,
                    nominal_ms * 1.2
                );
            }
        }
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        let backoff = RetryBackoff::default();
        let d = backoff.delay(30);
        assert!(d <= Duration::from_millis(360_000));
    }
}
