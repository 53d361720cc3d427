//! Direct pipeline-deployment endpoints and operational views.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::api::server::ApiState;
use crate::api::types::{
    ApiError, ListDeploymentsQuery, ListTasksQuery, NewDeploymentRequest, TaskView,
};
use crate::dispatch::{FleetAgent, FleetSummary};
use crate::error::ErrorKind;
use crate::experiment::CostFlowSnapshot;
use crate::model::PipelineDeployment;
use crate::store::{DeploymentStore, TaskFilter, TaskStore};

pub async fn create_deployment(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<NewDeploymentRequest>,
) -> Result<(StatusCode, Json<PipelineDeployment>), ApiError> {
    if request.deployment_name.trim().is_empty() {
        return Err(ApiError::new(
            ErrorKind::Validation,
            "deployment_name: must not be empty",
        ));
    }
    if request.pipeline.trim().is_empty() {
        return Err(ApiError::new(ErrorKind::Validation, "pipeline: must not be empty"));
    }

    let mut deployment = PipelineDeployment::new(
        request.deployment_name,
        request.namespace,
        request.pipeline,
    );
    deployment.node_selector = request.node_selector;
    deployment.parameters = request.parameters;
    deployment.resource_limits = request.resource_limits;

    state.store.create_deployment(&deployment).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn list_deployments(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<PipelineDeployment>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_deployments(query.namespace.as_deref())
            .await?,
    ))
}

pub async fn get_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    state
        .store
        .get_deployment(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("deployment {id} not found")))
}

pub async fn delete_deployment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.soft_delete_deployment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cost_flow(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<CostFlowSnapshot>, ApiError> {
    state
        .metrics
        .cost_flow()
        .await
        .map(Json)
        .map_err(ApiError::from)
}

pub async fn list_fleet(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<FleetAgent>>, ApiError> {
    Ok(Json(state.dispatcher.list_fleet().await?))
}

pub async fn fleet_summary(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<FleetSummary>, ApiError> {
    Ok(Json(state.dispatcher.fleet_summary().await?))
}

/// Debug listing over the task table.
pub async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let status = query
        .status
        .map(|s| {
            s.parse()
                .map_err(|e: String| ApiError::new(ErrorKind::Validation, e))
        })
        .transpose()?;
    let tasks = state
        .store
        .list_tasks(&TaskFilter {
            host_id: query.host_id,
            experiment_id: query.experiment_id,
            status,
            limit: query.limit.unwrap_or(200),
        })
        .await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}
