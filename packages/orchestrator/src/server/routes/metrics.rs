//! Read-only metrics endpoints over the persisted state.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::kernel::model::RobotStatus;
use crate::kernel::store::{QueueCounts, Store};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Serialize)]
pub struct FleetMetrics {
    pub robots_total: usize,
    pub robots_online: usize,
    pub robots_idle: usize,
    pub robots_busy: usize,
    pub robots_draining: usize,
    pub robots_offline: usize,
    pub capacity_total: i64,
    pub capacity_used: i64,
}

/// GET /metrics/fleet
pub async fn fleet_metrics(State(state): State<AppState>) -> ApiResult<Json<FleetMetrics>> {
    let robots = state.orchestrator.store.list_robots().await?;
    let mut metrics = FleetMetrics {
        robots_total: robots.len(),
        robots_online: 0,
        robots_idle: 0,
        robots_busy: 0,
        robots_draining: 0,
        robots_offline: 0,
        capacity_total: 0,
        capacity_used: 0,
    };
    for robot in &robots {
        match robot.status {
            RobotStatus::Idle => metrics.robots_idle += 1,
            RobotStatus::Busy => metrics.robots_busy += 1,
            RobotStatus::Draining => metrics.robots_draining += 1,
            RobotStatus::Offline => metrics.robots_offline += 1,
        }
        if robot.status.is_online() {
            metrics.robots_online += 1;
            metrics.capacity_total += robot.max_concurrent_jobs as i64;
            metrics.capacity_used += robot.current_load() as i64;
        }
    }
    Ok(Json(metrics))
}

/// GET /metrics/jobs
pub async fn job_metrics(State(state): State<AppState>) -> ApiResult<Json<QueueCounts>> {
    Ok(Json(state.orchestrator.store.count_jobs().await?))
}

#[derive(Debug, Serialize)]
pub struct RobotMetrics {
    pub robot_id: Uuid,
    pub name: String,
    pub status: RobotStatus,
    pub current_jobs: usize,
    pub max_concurrent_jobs: i32,
    pub load_ratio: f64,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// GET /metrics/robots
pub async fn robot_metrics(State(state): State<AppState>) -> ApiResult<Json<Vec<RobotMetrics>>> {
    let robots = state.orchestrator.store.list_robots().await?;
    Ok(Json(
        robots
            .into_iter()
            .map(|robot| RobotMetrics {
                robot_id: robot.id,
                name: robot.name.clone(),
                status: robot.status,
                current_jobs: robot.current_load(),
                max_concurrent_jobs: robot.max_concurrent_jobs,
                load_ratio: robot.load_ratio(),
                last_heartbeat_at: robot.last_heartbeat_at,
            })
            .collect(),
    ))
}
