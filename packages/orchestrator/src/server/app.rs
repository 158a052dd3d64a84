//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::Orchestrator;
use crate::server::middleware::jwt_auth_middleware;
use crate::server::routes::{
    activity, health_handler, jobs, metrics, robot_ws, robots, schedules, stream,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum application router
pub fn build_app(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState {
        orchestrator: orchestrator.clone(),
    };

    // CORS: explicit origins from config, or permissive for development.
    let cors_origins = &orchestrator.config().cors_origins;
    let cors = if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
    };

    let jwt_service = orchestrator.jwt.clone();

    Router::new()
        // Submitter API
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/:id/replay", post(jobs::replay_job))
        .route("/dlq", get(jobs::list_dead_letter))
        // Schedules
        .route(
            "/schedules",
            post(schedules::create_schedule).get(schedules::list_schedules),
        )
        .route(
            "/schedules/:id",
            get(schedules::get_schedule).delete(schedules::delete_schedule),
        )
        .route("/schedules/:id/enable", put(schedules::enable_schedule))
        .route("/schedules/:id/disable", put(schedules::disable_schedule))
        .route("/schedules/:id/trigger", put(schedules::trigger_schedule))
        // Fleet
        .route("/robots", get(robots::list_robots))
        .route(
            "/robots/:id",
            get(robots::get_robot).delete(robots::decommission_robot),
        )
        .route("/robots/:id/drain", put(robots::drain_robot))
        .route("/robots/:id/undrain", put(robots::undrain_robot))
        // Metrics and activity
        .route("/metrics/fleet", get(metrics::fleet_metrics))
        .route("/metrics/jobs", get(metrics::job_metrics))
        .route("/metrics/robots", get(metrics::robot_metrics))
        .route("/activity", get(activity::activity_feed))
        // Observer streams
        .route("/ws/live-jobs", get(stream::live_jobs))
        .route("/ws/robot-status", get(stream::robot_status))
        .route("/ws/queue-metrics", get(stream::queue_metrics))
        .route("/ws/activity", get(stream::activity))
        // Worker sessions
        .route("/ws/robot", get(robot_ws::robot_ws))
        // Health check
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(move |req, next| {
            jwt_auth_middleware(jwt_service.clone(), req, next)
        }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryStore;
    use crate::kernel::testing::test_config;

    #[tokio::test]
    async fn app_builds_with_memory_store() {
        let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), test_config());
        let _app = build_app(orchestrator);
    }
}
