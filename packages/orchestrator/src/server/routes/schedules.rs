//! Schedule CRUD and control endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::db_id;
use crate::kernel::model::{ExecutionMode, Schedule};
use crate::kernel::schedule::ScheduleSpec;
use crate::kernel::store::Store;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub cron_expr: String,
    pub payload: serde_json::Value,
    pub workflow_id: Option<Uuid>,
    pub timezone: Option<String>,
    pub priority: Option<i16>,
    pub environment: Option<String>,
    pub required_capabilities: Option<Vec<String>>,
    pub execution_mode: Option<ExecutionMode>,
}

/// POST /schedules
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let spec = ScheduleSpec::builder()
        .workflow_id(request.workflow_id.unwrap_or_else(db_id))
        .name(request.name)
        .cron_expr(request.cron_expr)
        .timezone(request.timezone.unwrap_or_else(|| "UTC".to_string()))
        .payload(request.payload)
        .priority(request.priority.unwrap_or(10))
        .environment(request.environment.unwrap_or_else(|| "default".to_string()))
        .required_capabilities(request.required_capabilities.unwrap_or_default())
        .execution_mode(request.execution_mode.unwrap_or_default())
        .build();
    let schedule = state.orchestrator.schedule_engine.create(spec).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /schedules
pub async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(state.orchestrator.store.list_schedules().await?))
}

/// GET /schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.orchestrator.store.get_schedule(schedule_id).await?))
}

/// PUT /schedules/{id}/enable
pub async fn enable_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(
        state.orchestrator.schedule_engine.enable(schedule_id).await?,
    ))
}

/// PUT /schedules/{id}/disable
pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(
        state
            .orchestrator
            .schedule_engine
            .disable(schedule_id)
            .await?,
    ))
}

/// PUT /schedules/{id}/trigger: fire now, cron position untouched
pub async fn trigger_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = state
        .orchestrator
        .schedule_engine
        .trigger(schedule_id)
        .await?;
    Ok(Json(serde_json::json!({"job_id": job_id})))
}

/// DELETE /schedules/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.schedule_engine.delete(schedule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
