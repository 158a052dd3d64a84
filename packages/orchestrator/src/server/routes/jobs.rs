//! Job submission and lifecycle endpoints.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::{db_id, CoreError};
use crate::kernel::model::{Job, JobState, TriggerContext};
use crate::kernel::queue::{SubmitOptions, SubmitOutcome};
use crate::kernel::store::{JobFilter, Store};
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::AuthUser;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub workflow_payload: serde_json::Value,
    pub workflow_id: Option<Uuid>,
    pub priority: Option<i16>,
    pub environment: Option<String>,
    pub required_capabilities: Option<Vec<String>>,
    pub target_robot_id: Option<Uuid>,
    pub max_retries: Option<i32>,
    pub timeout_seconds: Option<i64>,
    pub deduplication_key: Option<String>,
}

/// POST /jobs
pub async fn submit_job(
    State(state): State<AppState>,
    auth: Option<Extension<AuthUser>>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let defaults = state.orchestrator.config();
    let mut options = SubmitOptions::builder()
        .priority(request.priority.unwrap_or(10))
        .environment(request.environment.unwrap_or_else(|| "default".to_string()))
        .required_capabilities(request.required_capabilities.unwrap_or_default())
        .max_retries(request.max_retries.unwrap_or(3))
        .timeout_seconds(
            request
                .timeout_seconds
                .unwrap_or(defaults.job_timeout_default.as_secs() as i64),
        )
        .trigger_context(TriggerContext {
            source: "api".to_string(),
            actor: auth.map(|Extension(user)| user.subject),
            schedule_id: None,
        })
        .build();
    options.target_robot_id = request.target_robot_id;
    options.dedup_key = request.deduplication_key;

    let workflow_id = request.workflow_id.unwrap_or_else(db_id);
    let outcome = state
        .orchestrator
        .queue
        .submit(workflow_id, request.workflow_payload, options)
        .await?;

    let status = match &outcome {
        SubmitOutcome::Created(_) => StatusCode::CREATED,
        SubmitOutcome::Duplicate(_) => StatusCode::OK,
    };
    Ok((status, Json(serde_json::json!({"job_id": outcome.job_id()}))))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = state.orchestrator.store.get_job(job_id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let state_filter = query
        .state
        .as_deref()
        .map(|s| {
            s.parse::<JobState>()
                .map_err(|e| ApiError(CoreError::invalid(e)))
        })
        .transpose()?;
    let jobs = state
        .orchestrator
        .store
        .list_jobs(JobFilter {
            state: state_filter,
            workflow_id: query.workflow_id,
            limit: query.limit.unwrap_or(100).clamp(1, 1000),
        })
        .await?;
    Ok(Json(jobs))
}

/// DELETE /jobs/{id}: cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let resulting = state.orchestrator.queue.cancel(job_id).await?;
    Ok(Json(
        serde_json::json!({"job_id": job_id, "state": resulting.as_str()}),
    ))
}

/// POST /jobs/{id}/replay: resubmit a dead-lettered job
pub async fn replay_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.queue.replay(job_id).await?;
    Ok(Json(serde_json::json!({"job_id": job_id, "state": "pending"})))
}

/// GET /dlq: dead-letter listing
pub async fn list_dead_letter(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let jobs = state
        .orchestrator
        .store
        .list_jobs(JobFilter {
            state: Some(JobState::DeadLetter),
            workflow_id: query.workflow_id,
            limit: query.limit.unwrap_or(100).clamp(1, 1000),
        })
        .await?;
    Ok(Json(jobs))
}
