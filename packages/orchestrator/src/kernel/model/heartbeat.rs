//! Heartbeat rows: append-only worker liveness signals with optional
//! telemetry, pruned by the retention sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::robot::RobotStatus;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub robot_id: Uuid,
    pub at: DateTime<Utc>,
    pub status: RobotStatus,
    pub current_job_count: i32,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

impl Heartbeat {
    pub fn new(robot_id: Uuid, status: RobotStatus, current_job_count: i32) -> Self {
        Self {
            robot_id,
            at: Utc::now(),
            status,
            current_job_count,
            cpu_percent: None,
            memory_mb: None,
        }
    }

    pub fn with_telemetry(mut self, cpu_percent: f64, memory_mb: f64) -> Self {
        self.cpu_percent = Some(cpu_percent);
        self.memory_mb = Some(memory_mb);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_is_optional() {
        let hb = Heartbeat::new(Uuid::new_v4(), RobotStatus::Idle, 0);
        assert!(hb.cpu_percent.is_none());

        let hb = hb.with_telemetry(12.5, 256.0);
        assert_eq!(hb.cpu_percent, Some(12.5));
        assert_eq!(hb.memory_mb, Some(256.0));
    }
}
