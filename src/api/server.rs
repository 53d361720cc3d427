//! Router assembly and the HTTP server entry point.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{agent_api, deployments_api, experiments_api, ws};
use crate::dispatch::AgentDispatcher;
use crate::experiment::{ExperimentEngine, MetricSource};
use crate::hub::RealtimeHub;
use crate::queue::TaskQueue;
use crate::store::Store;

/// Shared state for all API handlers.
pub struct ApiState {
    pub engine: Arc<ExperimentEngine>,
    pub dispatcher: Arc<AgentDispatcher>,
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<RealtimeHub>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<dyn MetricSource>,
    /// Shared bearer token agents must present; `None` disables the check.
    pub agent_token: Option<SecretString>,
}

/// Build the combined agent + client + realtime router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Agent surface
        .route("/agent/heartbeat", post(agent_api::heartbeat))
        .route("/agent/tasks", get(agent_api::poll_tasks))
        .route("/agent/tasks/{id}/progress", post(agent_api::report_progress))
        .route("/agent/tasks/{id}/heartbeat", post(agent_api::heartbeat_task))
        // Experiments
        .route(
            "/api/v1/experiments",
            post(experiments_api::create_experiment).get(experiments_api::list_experiments),
        )
        .route("/api/v1/experiments/{id}", get(experiments_api::get_experiment))
        .route("/api/v1/experiments/{id}/start", post(experiments_api::start_experiment))
        .route("/api/v1/experiments/{id}/stop", post(experiments_api::stop_experiment))
        .route("/api/v1/experiments/{id}/pause", post(experiments_api::pause_experiment))
        .route("/api/v1/experiments/{id}/resume", post(experiments_api::resume_experiment))
        .route("/api/v1/experiments/{id}/promote", post(experiments_api::promote_experiment))
        .route("/api/v1/experiments/{id}/results", get(experiments_api::experiment_results))
        .route(
            "/api/v1/experiments/{id}/signals",
            post(experiments_api::post_signal).get(experiments_api::list_signals),
        )
        // Deployments and operational views
        .route(
            "/api/v1/pipeline-deployments",
            post(deployments_api::create_deployment).get(deployments_api::list_deployments),
        )
        .route(
            "/api/v1/pipeline-deployments/{id}",
            get(deployments_api::get_deployment).delete(deployments_api::delete_deployment),
        )
        .route("/api/v1/cost-flow", get(deployments_api::cost_flow))
        .route("/api/v1/fleet", get(deployments_api::list_fleet))
        .route("/api/v1/fleet/summary", get(deployments_api::fleet_summary))
        .route("/api/v1/tasks", get(deployments_api::list_tasks))
        // Realtime + health
        .route("/ws", get(ws::ws_handler))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bind and serve until `shutdown` resolves.
pub async fn start(
    addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Phoenix API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
