//! PostgreSQL store backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{
    AgentInfo, AgentRecord, ControlSignal, DeploymentStatus, Experiment, ExperimentConfig,
    ExperimentResults, ExperimentState, PipelineDeployment, RetryBackoff, SignalStatus, Task,
    TaskStatus, Variant,
};
use crate::store::{
    AgentStore, DeploymentStore, ExperimentStore, ReportOutcome, SignalStore, Store, TaskFilter,
    TaskStore, apply_report, fail_attempt,
};

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build the connection pool and verify the database answers.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut limits = deadpool_postgres::PoolConfig::default();
        limits.max_size = config.pool_size;

        let mut pool_config = Config::new();
        pool_config.pool = Some(limits);
        pool_config.options = Some(format!(
            "-c statement_timeout={}s",
            config.statement_timeout.as_secs()
        ));
        pool_config.url = Some(config.url().to_string());

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.ping().await?;
        Ok(store)
    }

    /// Round-trip a trivial statement so a bad URL fails at startup, not on
    /// the first lease.
    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool.get().await.map_err(StoreError::from)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        refinery::embed_migrations!("migrations");

        let mut client = self.conn().await?;
        let report = migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(migration = %migration, "Applied schema migration");
        }
        Ok(())
    }
}

// ==================== Experiments ====================

const EXPERIMENT_COLUMNS: &str = "id, name, description, baseline_pipeline, candidate_pipeline, \
     target_hosts, config, state, state_message, results, created_at, updated_at, \
     started_at, completed_at, promoted_at";

#[async_trait]
impl ExperimentStore for PgStore {
    async fn create_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let config = serde_json::to_value(&experiment.config)
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO experiments (
                id, name, description, baseline_pipeline, candidate_pipeline,
                target_hosts, config, state, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            &[
                &experiment.id,
                &experiment.name,
                &experiment.description,
                &experiment.baseline_pipeline,
                &experiment.candidate_pipeline,
                &experiment.target_hosts,
                &config,
                &experiment.state.to_string(),
                &experiment.created_at,
                &experiment.updated_at,
            ],
        )
        .await
        .map_err(map_unique_violation)?;

        Ok(())
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.map(|r| experiment_from_row(&r)).transpose()
    }

    async fn list_experiments(
        &self,
        state: Option<ExperimentState>,
    ) -> Result<Vec<Experiment>, StoreError> {
        let conn = self.conn().await?;
        let rows = match state {
            Some(state) => {
                conn.query(
                    &format!(
                        "SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE state = $1 \
                         ORDER BY created_at"
                    ),
                    &[&state.to_string()],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments ORDER BY created_at"),
                    &[],
                )
                .await?
            }
        };
        rows.iter().map(experiment_from_row).collect()
    }

    async fn transition_experiment(
        &self,
        id: Uuid,
        from: ExperimentState,
        to: ExperimentState,
        message: Option<&str>,
    ) -> Result<Experiment, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    UPDATE experiments SET
                        state = $3,
                        state_message = $4,
                        updated_at = NOW(),
                        started_at = CASE
                            WHEN started_at IS NULL AND state = 'pending' THEN NOW()
                            ELSE started_at
                        END,
                        completed_at = CASE
                            WHEN completed_at IS NULL
                                 AND $3 IN ('completed', 'failed', 'cancelled') THEN NOW()
                            ELSE completed_at
                        END
                    WHERE id = $1 AND state = $2
                    RETURNING {EXPERIMENT_COLUMNS}
                    "#
                ),
                &[&id, &from.to_string(), &to.to_string(), &message],
            )
            .await?;

        match row {
            Some(row) => experiment_from_row(&row),
            None => {
                // Distinguish a missing row from a lost compare-and-set.
                let current = conn
                    .query_opt("SELECT state FROM experiments WHERE id = $1", &[&id])
                    .await?;
                match current {
                    Some(row) => {
                        let state: String = row.get("state");
                        Err(StoreError::conflict(format!(
                            "experiment {id} is {state}, expected {from}"
                        )))
                    }
                    None => Err(StoreError::NotFound {
                        entity: "experiment",
                        id: id.to_string(),
                    }),
                }
            }
        }
    }

    async fn update_experiment_config(
        &self,
        id: Uuid,
        config: &ExperimentConfig,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let config = serde_json::to_value(config)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let updated = conn
            .execute(
                "UPDATE experiments SET config = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &config],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_experiment_results(
        &self,
        id: Uuid,
        results: &ExperimentResults,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let results = serde_json::to_value(results)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let updated = conn
            .execute(
                "UPDATE experiments SET results = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &results],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_experiment_promoted(
        &self,
        id: Uuid,
        promoted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE experiments SET promoted_at = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &promoted_at],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "experiment",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ==================== Tasks ====================

const TASK_COLUMNS: &str = "id, host_id, experiment_id, task_type, payload, priority, status, \
     attempts, max_attempts, visible_at, lease_expires_at, result, error_message, \
     created_at, updated_at, completed_at";

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, host_id, experiment_id, task_type, payload, priority, status,
                attempts, max_attempts, visible_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
            &[
                &task.id,
                &task.host_id,
                &task.experiment_id,
                &task.task_type.to_string(),
                &task.payload,
                &task.priority,
                &task.status.to_string(),
                &task.attempts,
                &task.max_attempts,
                &task.visible_at,
                &task.created_at,
                &task.updated_at,
            ],
        )
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND deleted_at IS NULL"),
                &[&id],
            )
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn().await?;
        let status = filter.status.map(|s| s.to_string());
        let limit = if filter.limit > 0 { filter.limit } else { 500 };

        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE deleted_at IS NULL
                      AND ($1::text IS NULL OR host_id = $1)
                      AND ($2::uuid IS NULL OR experiment_id = $2)
                      AND ($3::text IS NULL OR status = $3)
                    ORDER BY created_at
                    LIMIT $4
                    "#
                ),
                &[&filter.host_id, &filter.experiment_id, &status, &limit],
            )
            .await?;
        rows.iter().map(task_from_row).collect()
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
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // Skip-locked select keeps concurrent leasers from blocking on each
        // other or double-claiming a row.
        let rows = tx
            .query(
                r#"
                SELECT id FROM tasks
                WHERE host_id = $1
                  AND status = 'pending'
                  AND visible_at <= NOW()
                  AND deleted_at IS NULL
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                "#,
                &[&host_id, &max],
            )
            .await?;
        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let lease_secs = lease_duration.as_secs_f64();
        let rows = tx
            .query(
                &format!(
                    r#"
                    UPDATE tasks SET
                        status = 'assigned',
                        attempts = attempts + 1,
                        lease_expires_at = NOW() + make_interval(secs => $2),
                        updated_at = NOW()
                    WHERE id = ANY($1)
                    RETURNING {TASK_COLUMNS}
                    "#
                ),
                &[&ids, &lease_secs],
            )
            .await?;
        tx.commit().await?;

        let mut tasks: Vec<Task> = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<_, _>>()?;
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        host_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn().await?;
        let lease_secs = lease_duration.as_secs_f64();
        let row = conn
            .query_opt(
                r#"
                UPDATE tasks SET
                    lease_expires_at = NOW() + make_interval(secs => $3),
                    updated_at = NOW()
                WHERE id = $1
                  AND host_id = $2
                  AND status IN ('assigned', 'running')
                  AND lease_expires_at > NOW()
                  AND deleted_at IS NULL
                RETURNING lease_expires_at
                "#,
                &[&id, &host_id, &lease_secs],
            )
            .await?;
        Ok(row.map(|r| r.get("lease_expires_at")))
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
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
                ),
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(ReportOutcome::NotFound);
        };
        let mut task = task_from_row(&row)?;

        let outcome = apply_report(&mut task, host_id, status, result, error_message, backoff);
        if matches!(
            outcome,
            ReportOutcome::Applied(_) | ReportOutcome::Requeued(_)
        ) {
            persist_task_update(&tx, &task).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
    ) -> Result<Vec<Task>, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let rows = tx
            .query(
                &format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE status IN ('assigned', 'running')
                      AND lease_expires_at < $1
                      AND deleted_at IS NULL
                    FOR UPDATE SKIP LOCKED
                    "#
                ),
                &[&now],
            )
            .await?;

        let mut swept = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = task_from_row(row)?;
            fail_attempt(&mut task, "lease expired", backoff);
            persist_task_update(&tx, &task).await?;
            swept.push(task);
        }
        tx.commit().await?;
        Ok(swept)
    }
}

/// Write back every field the report helpers may touch.
async fn persist_task_update(
    tx: &tokio_postgres::Transaction<'_>,
    task: &Task,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        UPDATE tasks SET
            status = $2,
            result = $3,
            error_message = $4,
            visible_at = $5,
            lease_expires_at = $6,
            completed_at = $7,
            updated_at = $8
        WHERE id = $1
        "#,
        &[
            &task.id,
            &task.status.to_string(),
            &task.result,
            &task.error_message,
            &task.visible_at,
            &task.lease_expires_at,
            &task.completed_at,
            &task.updated_at,
        ],
    )
    .await?;
    Ok(())
}

// ==================== Agents ====================

#[async_trait]
impl AgentStore for PgStore {
    async fn upsert_agent(
        &self,
        host_id: &str,
        info: &AgentInfo,
    ) -> Result<AgentRecord, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO agents (
                    host_id, hostname, agent_group, tags, capabilities, version,
                    last_heartbeat_at
                ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (host_id) DO UPDATE SET
                    hostname = EXCLUDED.hostname,
                    agent_group = EXCLUDED.agent_group,
                    tags = EXCLUDED.tags,
                    capabilities = EXCLUDED.capabilities,
                    version = EXCLUDED.version,
                    last_heartbeat_at = NOW(),
                    updated_at = NOW()
                RETURNING host_id, hostname, agent_group, tags, capabilities, version,
                          last_heartbeat_at, created_at, updated_at
                "#,
                &[
                    &host_id,
                    &info.hostname,
                    &info.group,
                    &info.tags,
                    &info.capabilities,
                    &info.version,
                ],
            )
            .await?;
        Ok(agent_from_row(&row))
    }

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT host_id, hostname, agent_group, tags, capabilities, version,
                       last_heartbeat_at, created_at, updated_at
                FROM agents WHERE host_id = $1
                "#,
                &[&host_id],
            )
            .await?;
        Ok(row.map(|r| agent_from_row(&r)))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT host_id, hostname, agent_group, tags, capabilities, version,
                       last_heartbeat_at, created_at, updated_at
                FROM agents ORDER BY host_id
                "#,
                &[],
            )
            .await?;
        Ok(rows.iter().map(agent_from_row).collect())
    }
}

// ==================== Deployments ====================

const DEPLOYMENT_COLUMNS: &str = "id, deployment_name, namespace, pipeline, experiment_id, \
     variant, node_selector, parameters, resource_limits, status, phase, instances, \
     metrics_snapshot, created_at, updated_at, deleted_at";

#[async_trait]
impl DeploymentStore for PgStore {
    async fn create_deployment(&self, deployment: &PipelineDeployment) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let node_selector = serde_json::to_value(&deployment.node_selector)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let resource_limits = deployment
            .resource_limits
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO pipeline_deployments (
                id, deployment_name, namespace, pipeline, experiment_id, variant,
                node_selector, parameters, resource_limits, status, phase, instances,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            &[
                &deployment.id,
                &deployment.deployment_name,
                &deployment.namespace,
                &deployment.pipeline,
                &deployment.experiment_id,
                &deployment.variant.map(|v| v.to_string()),
                &node_selector,
                &deployment.parameters,
                &resource_limits,
                &deployment.status.to_string(),
                &deployment.phase,
                &deployment.instances,
                &deployment.created_at,
                &deployment.updated_at,
            ],
        )
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<PipelineDeployment>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM pipeline_deployments \
                     WHERE id = $1 AND deleted_at IS NULL"
                ),
                &[&id],
            )
            .await?;
        row.map(|r| deployment_from_row(&r)).transpose()
    }

    async fn list_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<PipelineDeployment>, StoreError> {
        let conn = self.conn().await?;
        let rows = match namespace {
            Some(namespace) => {
                conn.query(
                    &format!(
                        "SELECT {DEPLOYMENT_COLUMNS} FROM pipeline_deployments \
                         WHERE namespace = $1 AND deleted_at IS NULL ORDER BY created_at"
                    ),
                    &[&namespace],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT {DEPLOYMENT_COLUMNS} FROM pipeline_deployments \
                         WHERE deleted_at IS NULL ORDER BY created_at"
                    ),
                    &[],
                )
                .await?
            }
        };
        rows.iter().map(deployment_from_row).collect()
    }

    async fn list_deployments_for_experiment(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<PipelineDeployment>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM pipeline_deployments \
                     WHERE experiment_id = $1 AND deleted_at IS NULL ORDER BY created_at"
                ),
                &[&experiment_id],
            )
            .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        phase: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE pipeline_deployments SET
                    status = $2,
                    phase = COALESCE($3, phase),
                    updated_at = NOW()
                WHERE id = $1 AND deleted_at IS NULL
                "#,
                &[&id, &status.to_string(), &phase],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn soft_delete_deployment(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE pipeline_deployments SET
                    deleted_at = NOW(),
                    status = 'deleting',
                    updated_at = NOW()
                WHERE id = $1 AND deleted_at IS NULL
                "#,
                &[&id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ==================== Control signals ====================

#[async_trait]
impl SignalStore for PgStore {
    async fn insert_signal(&self, signal: &ControlSignal) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO control_signals (
                id, experiment_id, signal_type, parameters, reason, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &signal.id,
                &signal.experiment_id,
                &signal.signal_type.to_string(),
                &signal.parameters,
                &signal.reason,
                &signal.status.to_string(),
                &signal.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_signals(&self, experiment_id: Uuid) -> Result<Vec<ControlSignal>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, experiment_id, signal_type, parameters, reason, status,
                       created_at, applied_at
                FROM control_signals
                WHERE experiment_id = $1
                ORDER BY created_at
                "#,
                &[&experiment_id],
            )
            .await?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        applied_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE control_signals SET status = $2, applied_at = $3 WHERE id = $1",
                &[&id, &status.to_string(), &applied_at],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "control_signal",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ==================== Row mapping ====================

fn parse_column<T>(row: &Row, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let value: String = row.get(column);
    value.parse().map_err(StoreError::Codec)
}

fn experiment_from_row(row: &Row) -> Result<Experiment, StoreError> {
    let config: serde_json::Value = row.get("config");
    let config: ExperimentConfig =
        serde_json::from_value(config).map_err(|e| StoreError::Codec(e.to_string()))?;
    let results: Option<serde_json::Value> = row.get("results");
    let results: Option<ExperimentResults> = results
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Codec(e.to_string()))?;

    Ok(Experiment {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        baseline_pipeline: row.get("baseline_pipeline"),
        candidate_pipeline: row.get("candidate_pipeline"),
        target_hosts: row.get("target_hosts"),
        config,
        state: parse_column(row, "state")?,
        state_message: row.get("state_message"),
        results,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        promoted_at: row.get("promoted_at"),
    })
}

fn task_from_row(row: &Row) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.get("id"),
        host_id: row.get("host_id"),
        experiment_id: row.get("experiment_id"),
        task_type: parse_column(row, "task_type")?,
        payload: row.get("payload"),
        priority: row.get("priority"),
        status: parse_column(row, "status")?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        visible_at: row.get("visible_at"),
        lease_expires_at: row.get("lease_expires_at"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn agent_from_row(row: &Row) -> AgentRecord {
    AgentRecord {
        host_id: row.get("host_id"),
        hostname: row.get("hostname"),
        group: row.get("agent_group"),
        tags: row.get("tags"),
        capabilities: row.get("capabilities"),
        version: row.get("version"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn deployment_from_row(row: &Row) -> Result<PipelineDeployment, StoreError> {
    let variant: Option<String> = row.get("variant");
    let variant = match variant.as_deref() {
        Some("baseline") => Some(Variant::Baseline),
        Some("candidate") => Some(Variant::Candidate),
        Some(other) => {
            return Err(StoreError::Codec(format!(
                "unknown variant '{other}'"
            )));
        }
        None => None,
    };
    let node_selector: serde_json::Value = row.get("node_selector");
    let node_selector: HashMap<String, String> = serde_json::from_value(node_selector)
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    let resource_limits: Option<serde_json::Value> = row.get("resource_limits");
    let resource_limits = resource_limits
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Codec(e.to_string()))?;

    Ok(PipelineDeployment {
        id: row.get("id"),
        deployment_name: row.get("deployment_name"),
        namespace: row.get("namespace"),
        pipeline: row.get("pipeline"),
        experiment_id: row.get("experiment_id"),
        variant,
        node_selector,
        parameters: row.get("parameters"),
        resource_limits,
        status: parse_column(row, "status")?,
        phase: row.get("phase"),
        instances: row.get("instances"),
        metrics_snapshot: row.get("metrics_snapshot"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn signal_from_row(row: &Row) -> Result<ControlSignal, StoreError> {
    Ok(ControlSignal {
        id: row.get("id"),
        experiment_id: row.get("experiment_id"),
        signal_type: parse_column(row, "signal_type")?,
        parameters: row.get("parameters"),
        reason: row.get("reason"),
        status: parse_column(row, "status")?,
        created_at: row.get("created_at"),
        applied_at: row.get("applied_at"),
    })
}

/// Map a unique-constraint violation to `Conflict`; everything else passes
/// through as a database error.
fn map_unique_violation(err: tokio_postgres::Error) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StoreError::conflict(
            err.as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string()),
        )
    } else {
        StoreError::Postgres(err)
    }
}
