//! Durable persistence for experiments, deployments, tasks, agents and
//! control signals.
//!
//! Components depend on the trait seams below; two backends implement them:
//! [`postgres::PgStore`] (production) and [`memory::MemoryStore`]
//! (development and tests). All task mutations that the queue's correctness
//! depends on are single atomic operations here, so backends can realize
//! them with transactions (Postgres) or a mutex (memory).

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    AgentInfo, AgentRecord, ControlSignal, Experiment, ExperimentConfig, ExperimentResults,
    ExperimentState, PipelineDeployment, DeploymentStatus, RetryBackoff, SignalStatus, Task,
    TaskStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of an atomic task status report.
///
/// Ownership and transition failures are data, not errors, so the queue can
/// map them to its own error taxonomy without a read-then-write race.
#[derive(Debug, Clone)]
pub enum ReportOutcome {
    /// The transition was applied.
    Applied(Task),
    /// Duplicate report of the current status; nothing changed.
    AlreadyApplied(Task),
    /// The task failed with attempts remaining and went back to `Pending`
    /// with backoff applied to `visible_at`.
    Requeued(Task),
    /// The reporting host does not hold the lease.
    NotOwner,
    /// The requested status is not reachable from the current one.
    IllegalTransition { from: TaskStatus },
    /// No such task.
    NotFound,
}

/// Filter for task listings (debug/ops API).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub host_id: Option<String>,
    pub experiment_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub limit: i64,
}

/// Experiment persistence.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn create_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError>;

    async fn list_experiments(
        &self,
        state: Option<ExperimentState>,
    ) -> Result<Vec<Experiment>, StoreError>;

    /// Compare-and-set state transition.
    ///
    /// Fails with `Conflict` when the row is no longer in `from`, so a
    /// transition outside the state graph can never persist. Maintains
    /// `started_at` (first departure from `Pending`) and `completed_at`
    /// (entry into a terminal state).
    async fn transition_experiment(
        &self,
        id: Uuid,
        from: ExperimentState,
        to: ExperimentState,
        message: Option<&str>,
    ) -> Result<Experiment, StoreError>;

    async fn update_experiment_config(
        &self,
        id: Uuid,
        config: &ExperimentConfig,
    ) -> Result<(), StoreError>;

    async fn set_experiment_results(
        &self,
        id: Uuid,
        results: &ExperimentResults,
    ) -> Result<(), StoreError>;

    async fn set_experiment_promoted(
        &self,
        id: Uuid,
        promoted_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Task persistence and the atomic queue primitives.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Atomically claim up to `max` pending, visible tasks for `host_id`.
    ///
    /// Selected rows move to `Assigned` with `attempts + 1` and a lease of
    /// `lease_duration`, ordered by `(priority DESC, created_at ASC)`.
    /// Concurrent leases for the same host never return the same row.
    async fn lease_tasks(
        &self,
        host_id: &str,
        max: i64,
        lease_duration: Duration,
    ) -> Result<Vec<Task>, StoreError>;

    /// Extend the lease if `host_id` currently holds it. Returns the new
    /// expiry, or `None` when the caller is not the leaseholder.
    async fn extend_lease(
        &self,
        id: Uuid,
        host_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Atomic, idempotent status report. `status` must be `Running`,
    /// `Completed` or `Failed`; failures with attempts remaining are
    /// re-queued with `backoff` applied to `visible_at`.
    async fn report_task(
        &self,
        id: Uuid,
        host_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<&str>,
        backoff: &RetryBackoff,
    ) -> Result<ReportOutcome, StoreError>;

    /// Sweep leases that expired before `now`, treating each as a failed
    /// attempt (same rules as a `Failed` report). Returns the tasks after
    /// the sweep.
    async fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
    ) -> Result<Vec<Task>, StoreError>;
}

/// Agent registry persistence.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert or refresh the agent row and stamp `last_heartbeat_at`.
    async fn upsert_agent(&self, host_id: &str, info: &AgentInfo)
        -> Result<AgentRecord, StoreError>;

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
}

/// Pipeline deployment persistence.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Fails with `Conflict` when a live row with the same
    /// `(deployment_name, namespace)` exists.
    async fn create_deployment(&self, deployment: &PipelineDeployment) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: Uuid) -> Result<Option<PipelineDeployment>, StoreError>;

    async fn list_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<PipelineDeployment>, StoreError>;

    async fn list_deployments_for_experiment(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<PipelineDeployment>, StoreError>;

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        phase: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Soft delete: sets `deleted_at`, status becomes `Deleting`.
    async fn soft_delete_deployment(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Control signal persistence (append-only audit log).
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(&self, signal: &ControlSignal) -> Result<(), StoreError>;

    async fn list_signals(&self, experiment_id: Uuid) -> Result<Vec<ControlSignal>, StoreError>;

    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        applied_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

/// The unified store surface the rest of the control plane depends on.
#[async_trait]
pub trait Store:
    ExperimentStore + TaskStore + AgentStore + DeploymentStore + SignalStore
{
    /// Apply pending schema migrations (no-op for the memory backend).
    async fn run_migrations(&self) -> Result<(), StoreError>;
}

// Shared task-report decision logic. Both backends load the row under their
// respective lock, mutate it through these helpers, then persist, so the
// observable semantics cannot drift between them.

pub(crate) fn apply_report(
    task: &mut Task,
    host_id: &str,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error_message: Option<&str>,
    backoff: &RetryBackoff,
) -> ReportOutcome {
    let now = Utc::now();

    // Duplicate of the current status from the owning host is a no-op success.
    if task.status == status && task.host_id == host_id {
        return ReportOutcome::AlreadyApplied(task.clone());
    }

    match task.status {
        TaskStatus::Pending | TaskStatus::Expired => return ReportOutcome::NotOwner,
        TaskStatus::Completed | TaskStatus::Failed => {
            return ReportOutcome::IllegalTransition { from: task.status };
        }
        TaskStatus::Assigned | TaskStatus::Running => {
            if task.host_id != host_id {
                return ReportOutcome::NotOwner;
            }
        }
    }

    match status {
        TaskStatus::Running => {
            task.status = TaskStatus::Running;
            task.updated_at = now;
            ReportOutcome::Applied(task.clone())
        }
        TaskStatus::Completed => {
            task.status = TaskStatus::Completed;
            task.result = result;
            task.lease_expires_at = None;
            task.completed_at = Some(now);
            task.updated_at = now;
            ReportOutcome::Applied(task.clone())
        }
        TaskStatus::Failed => {
            let requeued = fail_attempt(task, error_message.unwrap_or("task failed"), backoff);
            if requeued {
                ReportOutcome::Requeued(task.clone())
            } else {
                ReportOutcome::Applied(task.clone())
            }
        }
        _ => ReportOutcome::IllegalTransition { from: task.status },
    }
}

/// Record a failed attempt: re-queue with backoff while attempts remain,
/// otherwise park the task in terminal `Failed`. Returns true when re-queued.
pub(crate) fn fail_attempt(task: &mut Task, reason: &str, backoff: &RetryBackoff) -> bool {
    let now = Utc::now();
    task.error_message = Some(reason.to_string());
    task.lease_expires_at = None;
    task.updated_at = now;
    if task.attempts < task.max_attempts {
        task.status = TaskStatus::Pending;
        task.visible_at = now
            + chrono::Duration::from_std(backoff.delay(task.attempts as u32))
                .unwrap_or_else(|_| chrono::Duration::zero());
        true
    } else {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        false
    }
}
