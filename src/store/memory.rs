//! Ephemeral in-memory store backend.
//!
//! Implements the same observable semantics as the PostgreSQL backend with
//! a single mutex standing in for row locks. Selected with
//! `PHOENIX_STORE=memory`; also the backend the unit tests run against.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    AgentInfo, AgentRecord, ControlSignal, DeploymentStatus, Experiment, ExperimentConfig,
    ExperimentResults, ExperimentState, PipelineDeployment, RetryBackoff, SignalStatus, Task,
    TaskStatus,
};
use crate::store::{
    AgentStore, DeploymentStore, ExperimentStore, ReportOutcome, SignalStore, Store, TaskFilter,
    TaskStore, apply_report, fail_attempt,
};

#[derive(Default)]
struct Inner {
    experiments: HashMap<Uuid, Experiment>,
    tasks: HashMap<Uuid, Task>,
    agents: HashMap<String, AgentRecord>,
    deployments: HashMap<Uuid, PipelineDeployment>,
    signals: HashMap<Uuid, ControlSignal>,
}

/// In-memory store. Cheap to clone state out of, safe for concurrent use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn create_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.experiments.contains_key(&experiment.id) {
            return Err(StoreError::conflict(format!(
                "experiment {} already exists",
                experiment.id
            )));
        }
        inner.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        Ok(self.lock().experiments.get(&id).cloned())
    }

    async fn list_experiments(
        &self,
        state: Option<ExperimentState>,
    ) -> Result<Vec<Experiment>, StoreError> {
        let inner = self.lock();
        let mut experiments: Vec<Experiment> = inner
            .experiments
            .values()
            .filter(|e| state.is_none_or(|s| e.state == s))
            .cloned()
            .collect();
        experiments.sort_by_key(|e| e.created_at);
        Ok(experiments)
    }

    async fn transition_experiment(
        &self,
        id: Uuid,
        from: ExperimentState,
        to: ExperimentState,
        message: Option<&str>,
    ) -> Result<Experiment, StoreError> {
        let mut inner = self.lock();
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        if experiment.state != from {
            return Err(StoreError::conflict(format!(
                "experiment {id} is {}, expected {from}",
                experiment.state
            )));
        }
        let now = Utc::now();
        experiment.state = to;
        experiment.state_message = message.map(str::to_string);
        experiment.updated_at = now;
        if from == ExperimentState::Pending && experiment.started_at.is_none() {
            experiment.started_at = Some(now);
        }
        if to.is_terminal() && experiment.completed_at.is_none() {
            experiment.completed_at = Some(now);
        }
        Ok(experiment.clone())
    }

    async fn update_experiment_config(
        &self,
        id: Uuid,
        config: &ExperimentConfig,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        experiment.config = config.clone();
        experiment.updated_at = Utc::now();
        Ok(())
    }

    async fn set_experiment_results(
        &self,
        id: Uuid,
        results: &ExperimentResults,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        experiment.results = Some(results.clone());
        experiment.updated_at = Utc::now();
        Ok(())
    }

    async fn set_experiment_promoted(
        &self,
        id: Uuid,
        promoted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let experiment = inner
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            })?;
        experiment.promoted_at = Some(promoted_at);
        experiment.updated_at = promoted_at;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::conflict(format!("task {} already exists", task.id)));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.host_id.as_deref().is_none_or(|h| t.host_id == h))
            .filter(|t| filter.experiment_id.is_none_or(|e| t.experiment_id == Some(e)))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        if filter.limit > 0 {
            tasks.truncate(filter.limit as usize);
        }
        Ok(tasks)
    }

    async fn lease_tasks(
        &self,
        host_id: &str,
        max: i64,
        lease_duration: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        if max <= 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut inner = self.lock();

        let mut eligible: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                t.host_id == host_id && t.status == TaskStatus::Pending && t.visible_at <= now
            })
            .map(|t| t.id)
            .collect();
        eligible.sort_by(|a, b| {
            let ta = &inner.tasks[a];
            let tb = &inner.tasks[b];
            tb.priority
                .cmp(&ta.priority)
                .then(ta.created_at.cmp(&tb.created_at))
        });
        eligible.truncate(max as usize);

        let expires = now
            + chrono::Duration::from_std(lease_duration).unwrap_or_else(|_| chrono::Duration::zero());
        let mut leased = Vec::with_capacity(eligible.len());
        for id in eligible {
            let task = inner.tasks.get_mut(&id).expect("selected above");
            task.status = TaskStatus::Assigned;
            task.attempts += 1;
            task.lease_expires_at = Some(expires);
            task.updated_at = now;
            leased.push(task.clone());
        }
        Ok(leased)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        host_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if !task.holds_lease(host_id, now) {
            return Ok(None);
        }
        let expires = now
            + chrono::Duration::from_std(lease_duration).unwrap_or_else(|_| chrono::Duration::zero());
        task.lease_expires_at = Some(expires);
        task.updated_at = now;
        Ok(Some(expires))
    }

    async fn report_task(
        &self,
        id: Uuid,
        host_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error_message: Option<&str>,
        backoff: &RetryBackoff,
    ) -> Result<ReportOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(ReportOutcome::NotFound);
        };
        Ok(apply_report(task, host_id, status, result, error_message, backoff))
    }

    async fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
    ) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                    && t.lease_expires_at.is_some_and(|e| e < now)
            })
            .map(|t| t.id)
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for id in expired {
            let task = inner.tasks.get_mut(&id).expect("selected above");
            fail_attempt(task, "lease expired", backoff);
            swept.push(task.clone());
        }
        Ok(swept)
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn upsert_agent(
        &self,
        host_id: &str,
        info: &AgentInfo,
    ) -> Result<AgentRecord, StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let record = inner
            .agents
            .entry(host_id.to_string())
            .and_modify(|a| {
                a.hostname = info.hostname.clone();
                a.group = info.group.clone();
                a.tags = info.tags.clone();
                a.capabilities = info.capabilities.clone();
                a.version = info.version.clone();
                a.last_heartbeat_at = now;
                a.updated_at = now;
            })
            .or_insert_with(|| AgentRecord {
                host_id: host_id.to_string(),
                hostname: info.hostname.clone(),
                group: info.group.clone(),
                tags: info.tags.clone(),
                capabilities: info.capabilities.clone(),
                version: info.version.clone(),
                last_heartbeat_at: now,
                created_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.lock().agents.get(host_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let inner = self.lock();
        let mut agents: Vec<AgentRecord> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        Ok(agents)
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create_deployment(&self, deployment: &PipelineDeployment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let duplicate = inner.deployments.values().any(|d| {
            d.deleted_at.is_none()
                && d.deployment_name == deployment.deployment_name
                && d.namespace == deployment.namespace
        });
        if duplicate {
            return Err(StoreError::conflict(format!(
                "deployment {}/{} already exists",
                deployment.namespace, deployment.deployment_name
            )));
        }
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<PipelineDeployment>, StoreError> {
        Ok(self
            .lock()
            .deployments
            .get(&id)
            .filter(|d| d.deleted_at.is_none())
            .cloned())
    }

    async fn list_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<PipelineDeployment>, StoreError> {
        let inner = self.lock();
        let mut deployments: Vec<PipelineDeployment> = inner
            .deployments
            .values()
            .filter(|d| d.deleted_at.is_none())
            .filter(|d| namespace.is_none_or(|ns| d.namespace == ns))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn list_deployments_for_experiment(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<PipelineDeployment>, StoreError> {
        let inner = self.lock();
        let mut deployments: Vec<PipelineDeployment> = inner
            .deployments
            .values()
            .filter(|d| d.deleted_at.is_none() && d.experiment_id == Some(experiment_id))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        phase: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let deployment = inner
            .deployments
            .get_mut(&id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound {
                entity: "deployment",
                id: id.to_string(),
            })?;
        deployment.status = status;
        if let Some(phase) = phase {
            deployment.phase = phase.to_string();
        }
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_deployment(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let deployment = inner
            .deployments
            .get_mut(&id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound {
                entity: "deployment",
                id: id.to_string(),
            })?;
        let now = Utc::now();
        deployment.deleted_at = Some(now);
        deployment.status = DeploymentStatus::Deleting;
        deployment.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn insert_signal(&self, signal: &ControlSignal) -> Result<(), StoreError> {
        self.lock().signals.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn list_signals(&self, experiment_id: Uuid) -> Result<Vec<ControlSignal>, StoreError> {
        let inner = self.lock();
        let mut signals: Vec<ControlSignal> = inner
            .signals
            .values()
            .filter(|s| s.experiment_id == experiment_id)
            .cloned()
            .collect();
        signals.sort_by_key(|s| s.created_at);
        Ok(signals)
    }

    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        applied_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let signal = inner.signals.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "control_signal",
            id: id.to_string(),
        })?;
        signal.status = status;
        signal.applied_at = applied_at;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
