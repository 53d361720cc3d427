//! The experiment state machine.
//!
//! One monitor task per live experiment drives it through
//! deployment, collection, analysis and the terminal states. All state
//! mutations go through the store's compare-and-set transition under a
//! per-experiment lock, so concurrent signals cannot race the monitor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::analysis::{Analyzer, MetricSamples};
use crate::bus::{Event, EventBus, EventFilter, EventPayload, EventType};
use crate::config::{AnalyzerConfig, EngineConfig};
use crate::error::{EngineError, StoreError};
use crate::experiment::metrics::MetricSource;
use crate::experiment::render::ConfigRenderer;
use crate::model::{
    ControlSignal, Experiment, ExperimentResults, ExperimentState, NewExperiment, NewTask,
    PipelineDeployment, DeploymentStatus, Recommendation, SignalStatus, SignalType, TaskPayload,
    TaskStatus, TaskType, TrafficSplit, Variant,
};
use crate::queue::TaskQueue;
use crate::store::{
    DeploymentStore, ExperimentStore, SignalStore, Store, TaskFilter, TaskStore,
};

/// Namespace the engine's own deployment rows live in.
const EXPERIMENT_NAMESPACE: &str = "experiments";

/// How often a waiting monitor re-checks experiment state.
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Deploy tasks outrank collect/loadgen in the per-host queue.
const DEPLOY_PRIORITY: i32 = 10;

/// The experiment lifecycle engine.
pub struct ExperimentEngine {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    renderer: Arc<dyn ConfigRenderer>,
    metrics: Arc<dyn MetricSource>,
    analyzer: Analyzer,
    config: EngineConfig,
    push_endpoint: String,
    /// Per-experiment advisory locks serializing state transitions.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExperimentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        renderer: Arc<dyn ConfigRenderer>,
        metrics: Arc<dyn MetricSource>,
        config: EngineConfig,
        analyzer_config: &AnalyzerConfig,
        push_endpoint: String,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            renderer,
            metrics,
            analyzer: Analyzer::new(analyzer_config.min_sample),
            config,
            push_endpoint,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and persist a new experiment in `Pending`.
    pub async fn create(&self, spec: NewExperiment) -> Result<Experiment, EngineError> {
        let errors = spec.validate(self.config.max_experiment_duration.as_secs());
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let experiment = Experiment::from_new(spec);
        self.store.create_experiment(&experiment).await?;
        tracing::info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            hosts = experiment.target_hosts.len(),
            "Experiment created"
        );
        Ok(experiment)
    }

    pub async fn get(&self, id: Uuid) -> Result<Experiment, EngineError> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or(EngineError::NotFound { id })
    }

    pub async fn list(
        &self,
        state: Option<ExperimentState>,
    ) -> Result<Vec<Experiment>, EngineError> {
        Ok(self.store.list_experiments(state).await?)
    }

    /// Start a pending experiment: render both configs, create the tagged
    /// deployment rows, enqueue one deploy task per (host, variant) and
    /// attach the monitor.
    pub async fn start(self: &Arc<Self>, id: Uuid) -> Result<Experiment, EngineError> {
        let _guard = self.lock_experiment(id).await;
        let experiment = self.get(id).await?;
        if experiment.state != ExperimentState::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: experiment.state,
                to: ExperimentState::Initializing,
            });
        }

        let baseline = self
            .renderer
            .render(&experiment.baseline_pipeline, &experiment.config.template_variables)?;
        let candidate = self
            .renderer
            .render(&experiment.candidate_pipeline, &experiment.config.template_variables)?;

        let experiment = self
            .store
            .transition_experiment(
                id,
                ExperimentState::Pending,
                ExperimentState::Initializing,
                None,
            )
            .await?;

        for (variant, pipeline) in [
            (Variant::Baseline, &experiment.baseline_pipeline),
            (Variant::Candidate, &experiment.candidate_pipeline),
        ] {
            let deployment = PipelineDeployment::new(
                format!("{}-{variant}", experiment.name),
                EXPERIMENT_NAMESPACE,
                pipeline.clone(),
            )
            .for_experiment(id, variant);
            self.store.create_deployment(&deployment).await?;
        }

        // Subscribe before the deploy tasks exist so no completion can slip
        // past the monitor.
        let (stream, subscription) = self.subscribe_progress(id)?;

        for host in &experiment.target_hosts {
            for (variant, pipeline, rendered) in [
                (Variant::Baseline, &experiment.baseline_pipeline, &baseline),
                (Variant::Candidate, &experiment.candidate_pipeline, &candidate),
            ] {
                let task = NewTask::new(
                    host.clone(),
                    TaskPayload::Deploy {
                        pipeline_name: pipeline.clone(),
                        rendered_config: rendered.yaml.clone(),
                        variant,
                        resource_limits: None,
                    },
                )
                .for_experiment(id)
                .with_priority(DEPLOY_PRIORITY);
                self.queue.enqueue(task).await?;
            }
        }

        self.broadcast(&experiment);
        self.spawn_monitor(id, stream, subscription);
        tracing::info!(experiment_id = %id, "Experiment started");
        Ok(experiment)
    }

    /// Re-attach monitors to experiments left in a non-terminal state by a
    /// previous process.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for experiment in self.store.list_experiments(None).await? {
            if experiment.state.is_terminal() || experiment.state == ExperimentState::Pending {
                continue;
            }
            let (stream, subscription) = self.subscribe_progress(experiment.id)?;
            self.spawn_monitor(experiment.id, stream, subscription);
            recovered += 1;
            tracing::info!(
                experiment_id = %experiment.id,
                state = %experiment.state,
                "Re-attached experiment monitor"
            );
        }
        Ok(recovered)
    }

    /// Pause collection; in-flight tasks drain naturally.
    pub async fn pause(&self, id: Uuid) -> Result<Experiment, EngineError> {
        let _guard = self.lock_experiment(id).await;
        self.transition_checked(id, ExperimentState::Paused, None).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Experiment, EngineError> {
        let _guard = self.lock_experiment(id).await;
        self.transition_checked(id, ExperimentState::Running, None).await
    }

    /// Cancel from any non-terminal state and enqueue best-effort stop
    /// tasks for both variants' deployments.
    pub async fn stop(&self, id: Uuid, reason: &str) -> Result<Experiment, EngineError> {
        let _guard = self.lock_experiment(id).await;
        let experiment = self
            .transition_checked(id, ExperimentState::Cancelled, Some(reason))
            .await?;

        let deployments = self.store.list_deployments_for_experiment(id).await?;
        for deployment in &deployments {
            if let Err(e) = self
                .store
                .update_deployment_status(deployment.id, DeploymentStatus::Terminating, None)
                .await
            {
                tracing::warn!(deployment_id = %deployment.id, error = %e, "Failed to mark deployment terminating");
            }
            for host in &experiment.target_hosts {
                let stop = NewTask::new(
                    host.clone(),
                    TaskPayload::Stop {
                        deployment_id: deployment.id,
                    },
                )
                .for_experiment(id)
                .with_priority(DEPLOY_PRIORITY);
                if let Err(e) = self.queue.enqueue(stop).await {
                    tracing::warn!(host, error = %e, "Failed to enqueue stop task");
                }
            }
        }
        Ok(experiment)
    }

    /// Persist a control signal and apply its state transition.
    pub async fn apply_signal(
        &self,
        experiment_id: Uuid,
        signal_type: SignalType,
        parameters: serde_json::Value,
        reason: String,
    ) -> Result<ControlSignal, EngineError> {
        let signal = ControlSignal::new(experiment_id, signal_type, reason)
            .with_parameters(parameters.clone());
        self.store.insert_signal(&signal).await?;

        let outcome = match signal_type {
            SignalType::Pause => self.pause(experiment_id).await.map(|_| ()),
            SignalType::Resume => self.resume(experiment_id).await.map(|_| ()),
            SignalType::Rollback => self
                .stop(experiment_id, "rollback signal")
                .await
                .map(|_| ()),
            SignalType::TrafficSplit => self.apply_traffic_split(experiment_id, &parameters).await,
            SignalType::ConfigUpdate => self.apply_config_update(experiment_id, &parameters).await,
        };

        match outcome {
            Ok(()) => {
                self.store
                    .update_signal_status(signal.id, SignalStatus::Applied, Some(Utc::now()))
                    .await?;
                Ok(ControlSignal {
                    status: SignalStatus::Applied,
                    applied_at: Some(Utc::now()),
                    ..signal
                })
            }
            Err(e) => {
                self.store
                    .update_signal_status(signal.id, SignalStatus::Rejected, None)
                    .await?;
                Err(e)
            }
        }
    }

    /// Adopt the candidate as the new baseline on the original hosts.
    ///
    /// Legal only from `Completed` with a `Promote` recommendation; the
    /// baseline deployment record is kept.
    pub async fn promote(&self, id: Uuid) -> Result<Experiment, EngineError> {
        let _guard = self.lock_experiment(id).await;
        let experiment = self.get(id).await?;
        if experiment.state != ExperimentState::Completed {
            return Err(EngineError::NotCompleted { id });
        }
        if experiment.promoted_at.is_some() {
            return Err(EngineError::NotPromotable {
                id,
                recommendation: "already promoted".to_string(),
            });
        }
        let recommendation = experiment
            .results
            .as_ref()
            .map(|r| r.summary.recommendation);
        if recommendation != Some(Recommendation::Promote) {
            return Err(EngineError::NotPromotable {
                id,
                recommendation: recommendation
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "no analysis".to_string()),
            });
        }

        let rendered = self
            .renderer
            .render(&experiment.candidate_pipeline, &experiment.config.template_variables)?;
        for host in &experiment.target_hosts {
            let task = NewTask::new(
                host.clone(),
                TaskPayload::Deploy {
                    pipeline_name: experiment.candidate_pipeline.clone(),
                    rendered_config: rendered.yaml.clone(),
                    // The candidate config becomes the host's new baseline.
                    variant: Variant::Baseline,
                    resource_limits: None,
                },
            )
            .for_experiment(id)
            .with_priority(DEPLOY_PRIORITY);
            self.queue.enqueue(task).await?;
        }

        let promoted_at = Utc::now();
        self.store.set_experiment_promoted(id, promoted_at).await?;
        tracing::info!(experiment_id = %id, "Experiment promoted");
        self.get(id).await
    }

    // ==================== Monitor ====================

    fn spawn_monitor(
        self: &Arc<Self>,
        id: Uuid,
        stream: ReceiverStream<Event>,
        subscription: Uuid,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine.run_monitor(id, stream).await;
            engine.bus.unsubscribe(subscription);
            if let Err(e) = result {
                tracing::error!(experiment_id = %id, error = %e, "Experiment monitor failed");
            }
        });
    }

    async fn run_monitor(
        &self,
        id: Uuid,
        mut stream: ReceiverStream<Event>,
    ) -> Result<(), EngineError> {
        loop {
            // Transient store trouble must not kill a long-lived monitor.
            let experiment = match self.get(id).await {
                Ok(experiment) => experiment,
                Err(e) if e.kind() == crate::error::ErrorKind::Transient => {
                    tracing::warn!(experiment_id = %id, error = %e, "Store unavailable, monitor retrying");
                    tokio::time::sleep(STATE_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match experiment.state {
                ExperimentState::Initializing => {
                    self.await_deployments(id, &mut stream).await?;
                }
                ExperimentState::Running | ExperimentState::Paused => {
                    self.run_collection_window(id).await?;
                }
                ExperimentState::Analyzing => {
                    self.run_analysis(id).await?;
                }
                ExperimentState::Pending
                | ExperimentState::Completed
                | ExperimentState::Failed
                | ExperimentState::Cancelled => return Ok(()),
            }
        }
    }

    /// Initializing: wait for every deploy task to finish, then move to
    /// `Running` (or `Failed` when a deploy exhausted its retries).
    async fn await_deployments(
        &self,
        id: Uuid,
        stream: &mut ReceiverStream<Event>,
    ) -> Result<(), EngineError> {
        let deploys = self.deploy_tasks(id).await?;
        let mut pending: HashSet<Uuid> = deploys
            .iter()
            .filter(|t| t.display_status() != TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        if deploys
            .iter()
            .any(|t| t.display_status() == TaskStatus::Expired)
        {
            return self.fail_deployment(id).await;
        }

        let mut ticker = tokio::time::interval(STATE_POLL_INTERVAL);
        ticker.tick().await; // immediate first tick

        while !pending.is_empty() {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else { return Ok(()) };
                    let EventPayload::TaskProgress { task_id, status, .. } = event.payload else {
                        continue;
                    };
                    if !pending.contains(&task_id) {
                        continue;
                    }
                    match status {
                        TaskStatus::Completed => {
                            pending.remove(&task_id);
                        }
                        TaskStatus::Expired => return self.fail_deployment(id).await,
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    let experiment = self.get(id).await?;
                    if experiment.state != ExperimentState::Initializing {
                        return Ok(());
                    }
                }
            }
        }

        let _guard = self.lock_experiment(id).await;
        match self
            .store
            .transition_experiment(id, ExperimentState::Initializing, ExperimentState::Running, None)
            .await
        {
            Ok(experiment) => {
                for deployment in self.store.list_deployments_for_experiment(id).await? {
                    self.store
                        .update_deployment_status(deployment.id, DeploymentStatus::Running, None)
                        .await?;
                }
                self.broadcast(&experiment);
                self.enqueue_loadgen(&experiment).await;
                Ok(())
            }
            // Cancelled while we were waiting; the outer loop exits.
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_deployment(&self, id: Uuid) -> Result<(), EngineError> {
        let _guard = self.lock_experiment(id).await;
        match self
            .store
            .transition_experiment(
                id,
                ExperimentState::Initializing,
                ExperimentState::Failed,
                Some("deploy task exhausted retries"),
            )
            .await
        {
            Ok(experiment) => {
                self.broadcast(&experiment);
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Running/Paused: enqueue periodic collect tasks until the configured
    /// duration elapses, then move to `Analyzing`.
    async fn run_collection_window(&self, id: Uuid) -> Result<(), EngineError> {
        let experiment = self.get(id).await?;
        let duration = Duration::from_secs(experiment.config.duration_secs)
            .min(self.config.max_experiment_duration);
        let collect_every = if experiment.config.collect_interval_secs > 0 {
            Duration::from_secs(experiment.config.collect_interval_secs)
        } else {
            self.config.collect_interval
        };

        let window_end = tokio::time::Instant::now() + duration;
        let mut ticker = tokio::time::interval(collect_every);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(window_end) => break,
                _ = ticker.tick() => {
                    let experiment = self.get(id).await?;
                    match experiment.state {
                        ExperimentState::Running => self.enqueue_collect(&experiment).await,
                        ExperimentState::Paused => {}
                        _ => return Ok(()),
                    }
                }
            }
        }

        // The window is over; wait out a pause before analyzing.
        loop {
            let experiment = self.get(id).await?;
            match experiment.state {
                ExperimentState::Running => break,
                ExperimentState::Paused => tokio::time::sleep(STATE_POLL_INTERVAL).await,
                _ => return Ok(()),
            }
        }

        let _guard = self.lock_experiment(id).await;
        match self
            .store
            .transition_experiment(id, ExperimentState::Running, ExperimentState::Analyzing, None)
            .await
        {
            Ok(experiment) => {
                self.broadcast(&experiment);
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Analyzing: fetch samples, compute the verdict, persist it and either
    /// complete the experiment or send it back for another window.
    async fn run_analysis(&self, id: Uuid) -> Result<(), EngineError> {
        let results = self.analyze(id).await?;
        let verdict = results.summary.recommendation;

        let _guard = self.lock_experiment(id).await;
        let (to, message) = match verdict {
            Recommendation::Continue => (
                ExperimentState::Running,
                "insufficient data, collection continues".to_string(),
            ),
            verdict => (ExperimentState::Completed, format!("verdict: {verdict}")),
        };
        match self
            .store
            .transition_experiment(id, ExperimentState::Analyzing, to, Some(&message))
            .await
        {
            Ok(experiment) => {
                self.broadcast(&experiment);
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch per-metric sample pairs and synthesize the verdict. A metric
    /// store failure degrades to an empty sample set, which the analyzer
    /// reports as insufficient data.
    pub async fn analyze(&self, id: Uuid) -> Result<ExperimentResults, EngineError> {
        let experiment = self.get(id).await?;
        let now = Utc::now();
        let window_start = experiment.started_at.unwrap_or_else(|| {
            now - chrono::Duration::seconds(experiment.config.duration_secs as i64)
        });
        let window = (window_start, now);

        let mut samples = std::collections::BTreeMap::new();
        for metric in &experiment.config.metrics {
            let baseline = self
                .fetch_or_empty(id, metric, Variant::Baseline, window)
                .await;
            let candidate = self
                .fetch_or_empty(id, metric, Variant::Candidate, window)
                .await;
            samples.insert(metric.clone(), MetricSamples { baseline, candidate });
        }

        let results = self
            .analyzer
            .analyze_experiment(&samples, &experiment.config.success_criteria);
        self.store.set_experiment_results(id, &results).await?;
        tracing::info!(
            experiment_id = %id,
            recommendation = %results.summary.recommendation,
            confidence = results.summary.confidence,
            "Experiment analyzed"
        );
        Ok(results)
    }

    async fn fetch_or_empty(
        &self,
        id: Uuid,
        metric: &str,
        variant: Variant,
        window: (chrono::DateTime<Utc>, chrono::DateTime<Utc>),
    ) -> Vec<f64> {
        match self.metrics.fetch_samples(id, metric, variant, window).await {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(
                    experiment_id = %id,
                    metric,
                    %variant,
                    error = %e,
                    "Metric fetch failed, treating as missing data"
                );
                Vec::new()
            }
        }
    }

    async fn enqueue_collect(&self, experiment: &Experiment) {
        let now = Utc::now();
        let interval = chrono::Duration::seconds(experiment.config.collect_interval_secs as i64);
        for host in &experiment.target_hosts {
            let task = NewTask::new(
                host.clone(),
                TaskPayload::Collect {
                    metric_names: experiment.config.metrics.clone(),
                    window_start: now - interval,
                    window_end: now,
                    push_endpoint: self.push_endpoint.clone(),
                },
            )
            .for_experiment(experiment.id);
            if let Err(e) = self.queue.enqueue(task).await {
                tracing::warn!(host, error = %e, "Failed to enqueue collect task");
            }
        }
    }

    async fn enqueue_loadgen(&self, experiment: &Experiment) {
        let Some(profile) = &experiment.config.load_profile else {
            return;
        };
        for host in &experiment.target_hosts {
            let task = NewTask::new(
                host.clone(),
                TaskPayload::Loadgen {
                    profile: profile.profile.clone(),
                    duration_seconds: profile.duration_seconds,
                    process_count: profile.process_count,
                },
            )
            .for_experiment(experiment.id);
            if let Err(e) = self.queue.enqueue(task).await {
                tracing::warn!(host, error = %e, "Failed to enqueue loadgen task");
            }
        }
    }

    // ==================== Helpers ====================

    async fn deploy_tasks(&self, id: Uuid) -> Result<Vec<crate::model::Task>, EngineError> {
        let tasks = self
            .store
            .list_tasks(&TaskFilter {
                experiment_id: Some(id),
                ..Default::default()
            })
            .await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.task_type == TaskType::Deploy)
            .collect())
    }

    async fn apply_traffic_split(
        &self,
        id: Uuid,
        parameters: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let split: TrafficSplit =
            serde_json::from_value(parameters.clone()).map_err(|e| EngineError::Validation(vec![
                crate::model::ValidationError {
                    field: "parameters".to_string(),
                    message: format!("expected a traffic split: {e}"),
                },
            ]))?;
        if u32::from(split.baseline_pct) + u32::from(split.candidate_pct) != 100 {
            return Err(EngineError::Validation(vec![crate::model::ValidationError {
                field: "parameters".to_string(),
                message: "baseline and candidate percentages must sum to 100".to_string(),
            }]));
        }
        let _guard = self.lock_experiment(id).await;
        let mut config = self.get(id).await?.config;
        config.traffic_split = split;
        Ok(self.store.update_experiment_config(id, &config).await?)
    }

    async fn apply_config_update(
        &self,
        id: Uuid,
        parameters: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let variables: HashMap<String, String> = serde_json::from_value(
            parameters
                .get("template_variables")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
        )
        .map_err(|e| {
            EngineError::Validation(vec![crate::model::ValidationError {
                field: "parameters.template_variables".to_string(),
                message: e.to_string(),
            }])
        })?;

        let _guard = self.lock_experiment(id).await;
        let mut config = self.get(id).await?.config;
        config.template_variables.extend(variables);
        Ok(self.store.update_experiment_config(id, &config).await?)
    }

    /// Graph-checked transition; maps a lost compare-and-set to `conflict`.
    async fn transition_checked(
        &self,
        id: Uuid,
        to: ExperimentState,
        message: Option<&str>,
    ) -> Result<Experiment, EngineError> {
        let experiment = self.get(id).await?;
        if !experiment.state.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: experiment.state,
                to,
            });
        }
        let experiment = self
            .store
            .transition_experiment(id, experiment.state, to, message)
            .await?;
        self.broadcast(&experiment);
        Ok(experiment)
    }

    fn subscribe_progress(
        &self,
        id: Uuid,
    ) -> Result<(ReceiverStream<Event>, Uuid), EngineError> {
        Ok(self.bus.subscribe(
            EventFilter::all()
                .with_types([EventType::TaskProgress])
                .with_metadata("experiment_id", id.to_string()),
        )?)
    }

    fn broadcast(&self, experiment: &Experiment) {
        let event = Event::new(
            "engine",
            EventPayload::ExperimentUpdate {
                experiment_id: experiment.id,
                state: experiment.state,
                message: experiment.state_message.clone(),
            },
        )
        .with_metadata("experiment_id", experiment.id.to_string());
        if let Err(e) = self.bus.publish(event) {
            tracing::warn!(error = %e, "Failed to publish experiment update");
        }
    }

    async fn lock_experiment(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(
                locks
                    .entry(id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}
