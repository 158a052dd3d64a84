//! Audit log rows: an immutable record of every state transition, used for
//! reconciliation and the user-visible activity feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    JobSubmitted,
    JobAssigned,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobRequeued,
    JobCancelled,
    JobTimedOut,
    JobDeadLettered,
    JobReplayed,
    RobotRegistered,
    RobotOffline,
    RobotDraining,
    RobotReconciled,
    ScheduleFired,
    ScheduleMisfired,
    ScheduleSkipped,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub job_id: Option<Uuid>,
    pub robot_id: Option<Uuid>,
    pub schedule_id: Option<Uuid>,
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            id: db_id(),
            at: Utc::now(),
            action,
            job_id: None,
            robot_id: None,
            schedule_id: None,
            detail: None,
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn robot(mut self, robot_id: Uuid) -> Self {
        self.robot_id = Some(robot_id);
        self
    }

    pub fn schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
