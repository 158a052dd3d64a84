//! Activity feed: pages over the audit log, newest first.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::kernel::model::AuditEntry;
use crate::kernel::store::Store;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
    /// Return entries strictly older than this timestamp (pagination
    /// cursor).
    pub before: Option<DateTime<Utc>>,
}

/// GET /activity
pub async fn activity_feed(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = state
        .orchestrator
        .store
        .list_audit(query.limit.unwrap_or(100).clamp(1, 1000), query.before)
        .await?;
    Ok(Json(entries))
}
