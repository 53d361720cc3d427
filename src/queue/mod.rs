//! Durable task queue: enqueue, lease, heartbeat, report, reap.
//!
//! Built on the store's atomic task primitives. FIFO within priority per
//! host, visibility-timeout leases, exponential retry backoff and
//! dead-lettering after `max_attempts` failures.

mod reaper;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::{Event, EventBus, EventPayload};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::model::{NewTask, RetryBackoff, Task, TaskStatus};
use crate::store::{ReportOutcome, Store, TaskStore};

pub use reaper::spawn_reaper;
pub use signals::HostSignals;

/// The task queue.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    signals: Arc<HostSignals>,
    backoff: RetryBackoff,
    lease_duration: Duration,
    max_attempts: i32,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        signals: Arc<HostSignals>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            bus,
            signals,
            backoff: RetryBackoff {
                base: config.backoff_base,
                cap: config.backoff_cap,
            },
            lease_duration: config.lease_duration,
            max_attempts: config.max_attempts,
        }
    }

    /// Insert a task as `Pending`, immediately visible, and wake any poller
    /// parked on its host.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task, QueueError> {
        if new.host_id.trim().is_empty() {
            return Err(QueueError::Invalid {
                reason: "host_id must not be empty".to_string(),
            });
        }
        let payload = serde_json::to_value(&new.payload).map_err(|e| QueueError::Invalid {
            reason: format!("payload does not serialize: {e}"),
        })?;

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            host_id: new.host_id,
            experiment_id: new.experiment_id,
            task_type: new.payload.task_type(),
            payload,
            priority: new.priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(self.max_attempts),
            visible_at: now,
            lease_expires_at: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_task(&task).await?;

        tracing::debug!(
            task_id = %task.id,
            host_id = %task.host_id,
            task_type = %task.task_type,
            "Task enqueued"
        );
        self.publish_progress(&task, None);
        self.signals.notify(&task.host_id);
        Ok(task)
    }

    /// Lease up to `max` tasks for a host with the default lease duration.
    pub async fn lease(&self, host_id: &str, max: i64) -> Result<Vec<Task>, QueueError> {
        Ok(self
            .store
            .lease_tasks(host_id, max, self.lease_duration)
            .await?)
    }

    /// Extend the caller's lease; fails with `not-owner` when the caller no
    /// longer holds it.
    pub async fn heartbeat(
        &self,
        task_id: Uuid,
        host_id: &str,
    ) -> Result<DateTime<Utc>, QueueError> {
        self.store
            .extend_lease(task_id, host_id, self.lease_duration)
            .await?
            .ok_or_else(|| QueueError::NotOwner {
                task_id,
                host_id: host_id.to_string(),
            })
    }

    /// Idempotent status report from an agent.
    pub async fn report(
        &self,
        task_id: Uuid,
        host_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        message: Option<&str>,
    ) -> Result<Task, QueueError> {
        if !matches!(
            status,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed
        ) {
            return Err(QueueError::Invalid {
                reason: format!("agents may only report running, completed or failed, not {status}"),
            });
        }

        let outcome = self
            .store
            .report_task(task_id, host_id, status, result, message, &self.backoff)
            .await?;

        match outcome {
            ReportOutcome::Applied(task) | ReportOutcome::Requeued(task) => {
                self.publish_progress(&task, message.map(str::to_string));
                Ok(task)
            }
            ReportOutcome::AlreadyApplied(task) => Ok(task),
            ReportOutcome::NotOwner => Err(QueueError::NotOwner {
                task_id,
                host_id: host_id.to_string(),
            }),
            ReportOutcome::IllegalTransition { from } => Err(QueueError::IllegalTransition {
                id: task_id,
                from,
                to: status,
            }),
            ReportOutcome::NotFound => Err(QueueError::TaskNotFound { id: task_id }),
        }
    }

    /// One reaper sweep. Returns the number of tasks affected.
    pub async fn reap_expired(&self) -> Result<usize, QueueError> {
        let swept = self
            .store
            .reap_expired_leases(Utc::now(), &self.backoff)
            .await?;
        for task in &swept {
            self.publish_progress(task, Some("lease expired".to_string()));
        }
        Ok(swept.len())
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn publish_progress(&self, task: &Task, message: Option<String>) {
        let mut event = Event::new(
            "queue",
            EventPayload::TaskProgress {
                task_id: task.id,
                host_id: task.host_id.clone(),
                experiment_id: task.experiment_id,
                status: task.display_status(),
                message,
            },
        )
        .with_metadata("host_id", &task.host_id);
        if let Some(experiment_id) = task.experiment_id {
            event = event.with_metadata("experiment_id", experiment_id.to_string());
        }
        if let Err(e) = self.bus.publish(event) {
            tracing::warn!(error = %e, "Failed to publish task progress event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::model::TaskPayload;
    use crate::store::MemoryStore;
    use tokio_stream::StreamExt;

    fn queue_with(config: QueueConfig) -> TaskQueue {
        TaskQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::default()),
            Arc::new(HostSignals::new()),
            &config,
        )
    }

    fn default_config() -> QueueConfig {
        QueueConfig {
            lease_duration: Duration::from_secs(300),
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
        }
    }

    fn health_task(host: &str) -> NewTask {
        NewTask::new(host, TaskPayload::Health {})
    }

    #[tokio::test]
    async fn enqueue_lease_report_flow() {
        let queue = queue_with(default_config());
        let task = queue.enqueue(health_task("h1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let leased = queue.lease("h1", 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, task.id);
        assert_eq!(leased[0].status, TaskStatus::Assigned);

        let running = queue
            .report(task.id, "h1", TaskStatus::Running, None, None)
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let done = queue
            .report(
                task.id,
                "h1",
                TaskStatus::Completed,
                Some(serde_json::json!({"ok": true})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn lease_zero_returns_empty_immediately() {
        let queue = queue_with(default_config());
        queue.enqueue(health_task("h1")).await.unwrap();
        assert!(queue.lease("h1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_from_stranger_is_not_owner() {
        let queue = queue_with(default_config());
        let task = queue.enqueue(health_task("h1")).await.unwrap();
        queue.lease("h1", 1).await.unwrap();

        let err = queue
            .report(task.id, "h2", TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn agents_cannot_report_pending() {
        let queue = queue_with(default_config());
        let task = queue.enqueue(health_task("h1")).await.unwrap();
        let err = queue
            .report(task.id, "h1", TaskStatus::Pending, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Invalid { .. }));
    }

    #[tokio::test]
    async fn heartbeat_requires_the_lease() {
        let queue = queue_with(default_config());
        let task = queue.enqueue(health_task("h1")).await.unwrap();

        // Not leased yet.
        assert!(matches!(
            queue.heartbeat(task.id, "h1").await.unwrap_err(),
            QueueError::NotOwner { .. }
        ));

        queue.lease("h1", 1).await.unwrap();
        let extended = queue.heartbeat(task.id, "h1").await.unwrap();
        assert!(extended > Utc::now());
        assert!(matches!(
            queue.heartbeat(task.id, "h2").await.unwrap_err(),
            QueueError::NotOwner { .. }
        ));
    }

    #[tokio::test]
    async fn reaper_requeues_expired_leases() {
        let mut config = default_config();
        config.lease_duration = Duration::from_millis(20);
        let queue = queue_with(config);

        let task = queue.enqueue(health_task("h1")).await.unwrap();
        queue.lease("h1", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let swept = queue.reap_expired().await.unwrap();
        assert_eq!(swept, 1);

        let after = queue.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.attempts, 1);
        assert!(after.visible_at > Utc::now(), "backoff must hide the task");
    }

    #[tokio::test]
    async fn progress_events_reach_bus_subscribers() {
        let bus = Arc::new(EventBus::default());
        let queue = TaskQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&bus),
            Arc::new(HostSignals::new()),
            &default_config(),
        );
        let (mut stream, _) = bus.subscribe(EventFilter::all().with_metadata("host_id", "h1")).unwrap();

        let task = queue.enqueue(health_task("h1")).await.unwrap();
        queue.lease("h1", 1).await.unwrap();
        queue
            .report(task.id, "h1", TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let enqueued = stream.next().await.unwrap();
        let EventPayload::TaskProgress { status, .. } = enqueued.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(status, TaskStatus::Pending);

        let completed = stream.next().await.unwrap();
        let EventPayload::TaskProgress { status, .. } = completed.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn enqueue_signals_the_target_host() {
        let signals = Arc::new(HostSignals::new());
        let queue = TaskQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::default()),
            Arc::clone(&signals),
            &default_config(),
        );

        let notify = signals.for_host("h7");
        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;

        queue.enqueue(health_task("h7")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("enqueue must wake the poller")
            .unwrap();
    }
}
