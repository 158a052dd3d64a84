//! Health check endpoint.

use axum::Json;

/// GET /health
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "casare-orchestrator",
    }))
}
