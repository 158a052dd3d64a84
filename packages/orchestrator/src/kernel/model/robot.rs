//! Robot model: a worker agent and the eligibility predicate the
//! dispatcher filters on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::Job;
use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "robot_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    #[default]
    Offline,
    Idle,
    Busy,
    /// Finishing current jobs, not accepting new ones.
    Draining,
}

impl RobotStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, RobotStatus::Offline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RobotStatus::Offline => "offline",
            RobotStatus::Idle => "idle",
            RobotStatus::Busy => "busy",
            RobotStatus::Draining => "draining",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Robot {
    #[builder(default = db_id())]
    pub id: Uuid,
    pub name: String,

    #[builder(default)]
    pub capabilities: Vec<String>,
    #[builder(default = "default".to_string())]
    pub environment: String,
    #[builder(default = 1)]
    pub max_concurrent_jobs: i32,

    #[builder(default)]
    pub status: RobotStatus,
    #[builder(default)]
    pub current_job_ids: Vec<Uuid>,

    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Tie-breaker for least-loaded selection: oldest wins.
    #[builder(default, setter(strip_option))]
    pub last_assignment_at: Option<DateTime<Utc>>,

    /// SHA-256 of the session token presented at registration.
    #[builder(default, setter(strip_option))]
    pub token_fingerprint: Option<String>,

    #[builder(default = false)]
    pub decommissioned: bool,

    #[builder(default = Utc::now())]
    pub registered_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Robot {
    pub fn current_load(&self) -> usize {
        self.current_job_ids.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load() < self.max_concurrent_jobs.max(0) as usize
    }

    /// Load as a fraction of capacity, for least-loaded ranking.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent_jobs <= 0 {
            return 1.0;
        }
        self.current_load() as f64 / self.max_concurrent_jobs as f64
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// The full eligibility predicate: online, spare capacity, capability
    /// superset, environment match, target pin match, not draining or
    /// decommissioned.
    pub fn is_eligible_for(&self, job: &Job) -> bool {
        matches!(self.status, RobotStatus::Idle | RobotStatus::Busy)
            && !self.decommissioned
            && self.has_capacity()
            && self.has_capabilities(&job.required_capabilities)
            && self.environment == job.environment
            && job.pin_allows(self.id)
    }

    /// Whether the last heartbeat is older than `timeout` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        match self.last_heartbeat_at {
            Some(at) => now - at > timeout,
            None => true,
        }
    }
}

/// Per-robot symmetric token record. Issuance is external; only the
/// SHA-256 fingerprint of the token is ever stored.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RobotApiKey {
    pub robot_id: Uuid,
    pub name: String,
    pub token_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RobotApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser_robot() -> Robot {
        Robot::builder()
            .name("r1")
            .capabilities(vec!["browser".to_string()])
            .status(RobotStatus::Idle)
            .max_concurrent_jobs(2)
            .build()
    }

    fn browser_job() -> Job {
        Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({}))
            .required_capabilities(vec!["browser".to_string()])
            .build()
    }

    #[test]
    fn idle_robot_with_matching_capabilities_is_eligible() {
        assert!(browser_robot().is_eligible_for(&browser_job()));
    }

    #[test]
    fn offline_robot_is_not_eligible() {
        let mut robot = browser_robot();
        robot.status = RobotStatus::Offline;
        assert!(!robot.is_eligible_for(&browser_job()));
    }

    #[test]
    fn draining_robot_is_not_eligible() {
        let mut robot = browser_robot();
        robot.status = RobotStatus::Draining;
        assert!(!robot.is_eligible_for(&browser_job()));
    }

    #[test]
    fn missing_capability_is_not_eligible() {
        let robot = browser_robot();
        let mut job = browser_job();
        job.required_capabilities.push("desktop".to_string());
        assert!(!robot.is_eligible_for(&job));
    }

    #[test]
    fn environment_mismatch_is_not_eligible() {
        let robot = browser_robot();
        let mut job = browser_job();
        job.environment = "staging".to_string();
        assert!(!robot.is_eligible_for(&job));
    }

    #[test]
    fn full_robot_is_not_eligible() {
        let mut robot = browser_robot();
        robot.current_job_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert!(!robot.has_capacity());
        assert!(!robot.is_eligible_for(&browser_job()));
    }

    #[test]
    fn pin_to_another_robot_is_not_eligible() {
        let robot = browser_robot();
        let mut job = browser_job();
        job.target_robot_id = Some(Uuid::new_v4());
        assert!(!robot.is_eligible_for(&job));

        job.target_robot_id = Some(robot.id);
        assert!(robot.is_eligible_for(&job));
    }

    #[test]
    fn decommissioned_robot_is_not_eligible() {
        let mut robot = browser_robot();
        robot.decommissioned = true;
        assert!(!robot.is_eligible_for(&browser_job()));
    }

    #[test]
    fn load_ratio_scales_with_assignments() {
        let mut robot = browser_robot();
        assert_eq!(robot.load_ratio(), 0.0);
        robot.current_job_ids.push(Uuid::new_v4());
        assert_eq!(robot.load_ratio(), 0.5);
    }

    #[test]
    fn staleness_uses_the_heartbeat_timestamp() {
        let now = Utc::now();
        let mut robot = browser_robot();
        assert!(robot.is_stale(now, chrono::Duration::seconds(90)));

        robot.last_heartbeat_at = Some(now - chrono::Duration::seconds(30));
        assert!(!robot.is_stale(now, chrono::Duration::seconds(90)));

        robot.last_heartbeat_at = Some(now - chrono::Duration::seconds(120));
        assert!(robot.is_stale(now, chrono::Duration::seconds(90)));
    }
}
