//! Robot fleet endpoints: listing and maintenance controls.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::kernel::model::Robot;
use crate::kernel::store::Store;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

/// GET /robots
pub async fn list_robots(State(state): State<AppState>) -> ApiResult<Json<Vec<Robot>>> {
    Ok(Json(state.orchestrator.store.list_robots().await?))
}

/// GET /robots/{id}
pub async fn get_robot(
    State(state): State<AppState>,
    Path(robot_id): Path<Uuid>,
) -> ApiResult<Json<Robot>> {
    Ok(Json(state.orchestrator.store.get_robot(robot_id).await?))
}

/// PUT /robots/{id}/drain
pub async fn drain_robot(
    State(state): State<AppState>,
    Path(robot_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.registry.set_draining(robot_id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /robots/{id}/undrain
pub async fn undrain_robot(
    State(state): State<AppState>,
    Path(robot_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .registry
        .set_draining(robot_id, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /robots/{id}: decommission (soft delete)
pub async fn decommission_robot(
    State(state): State<AppState>,
    Path(robot_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.registry.decommission(robot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
