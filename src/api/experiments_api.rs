//! Client-facing experiment endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::api::server::ApiState;
use crate::api::types::{ApiError, ListExperimentsQuery, SignalRequest};
use crate::error::ErrorKind;
use crate::model::{ControlSignal, Experiment, ExperimentResults, ExperimentState, NewExperiment};
use crate::store::SignalStore;

pub async fn create_experiment(
    State(state): State<Arc<ApiState>>,
    Json(spec): Json<NewExperiment>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = state.engine.create(spec).await?;
    Ok((StatusCode::CREATED, Json(experiment)))
}

pub async fn list_experiments(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListExperimentsQuery>,
) -> Result<Json<Vec<Experiment>>, ApiError> {
    let filter = query
        .state
        .map(|s| {
            s.parse::<ExperimentState>()
                .map_err(|e| ApiError::new(ErrorKind::Validation, e))
        })
        .transpose()?;
    Ok(Json(state.engine.list(filter).await?))
}

pub async fn get_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.get(id).await?))
}

pub async fn start_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.start(id).await?))
}

pub async fn stop_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.stop(id, "stopped by operator").await?))
}

pub async fn pause_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.pause(id).await?))
}

pub async fn resume_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.resume(id).await?))
}

pub async fn promote_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.engine.promote(id).await?))
}

pub async fn experiment_results(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExperimentResults>, ApiError> {
    let experiment = state.engine.get(id).await?;
    experiment
        .results
        .map(Json)
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("experiment {id} has no results yet")))
}

pub async fn post_signal(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SignalRequest>,
) -> Result<(StatusCode, Json<ControlSignal>), ApiError> {
    let signal = state
        .engine
        .apply_signal(id, request.signal_type, request.parameters, request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(signal)))
}

pub async fn list_signals(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ControlSignal>>, ApiError> {
    // 404 for unknown experiments rather than an empty audit log.
    state.engine.get(id).await?;
    Ok(Json(state.store.list_signals(id).await?))
}
