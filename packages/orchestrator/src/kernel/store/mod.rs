//! Durable store contract.
//!
//! The store is the single source of truth and the only cross-instance
//! serialization mechanism: the atomic claim, the conditional state update
//! and the schedule CAS all live behind this trait. `PgStore` is the
//! production implementation; `MemoryStore` mirrors the exact same
//! semantics for the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::common::{JobError, Result};
use crate::kernel::model::{
    AuditEntry, Heartbeat, Job, JobState, Robot, RobotApiKey, RobotStatus, Schedule,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Field set applied by a conditional job-state update. Constructed with
/// the chain methods; unset fields are left untouched by the store.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub to_state: JobState,
    pub assigned_robot_id: Option<Option<Uuid>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub retry_count: Option<i32>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub dead_letter_reason: Option<String>,
    pub bump_replay_count: bool,
}

impl JobUpdate {
    pub fn to(state: JobState) -> Self {
        Self {
            to_state: state,
            ..Default::default()
        }
    }

    pub fn assigned_to(mut self, robot_id: Uuid) -> Self {
        self.assigned_robot_id = Some(Some(robot_id));
        self
    }

    pub fn clear_assignment(mut self) -> Self {
        self.assigned_robot_id = Some(None);
        self
    }

    pub fn claimed_now(mut self) -> Self {
        self.claimed_at = Some(Utc::now());
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn retry_count(mut self, count: i32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn dead_lettered(mut self, reason: impl Into<String>) -> Self {
        self.dead_letter_reason = Some(reason.into());
        self
    }

    pub fn replayed(mut self) -> Self {
        self.bump_replay_count = true;
        self
    }
}

/// Listing filter for jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub workflow_id: Option<Uuid>,
    pub limit: i64,
}

impl JobFilter {
    pub fn with_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            workflow_id: None,
            limit: 100,
        }
    }

    /// The most recent completed run of a workflow (affinity lookups).
    pub fn completed_for_workflow(workflow_id: Uuid) -> Self {
        Self {
            state: Some(JobState::Completed),
            workflow_id: Some(workflow_id),
            limit: 1,
        }
    }
}

/// Outcome of `requeue_jobs_of_robot`: which jobs went back to pending and
/// which landed in `Failed(WorkerLost)` with retries exhausted. The queue
/// manager dead-letters the exhausted set.
#[derive(Debug, Clone, Default)]
pub struct RequeueSummary {
    pub requeued: Vec<Uuid>,
    pub exhausted: Vec<Uuid>,
}

impl RequeueSummary {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}

/// Per-state job counts for the metrics surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub assigned: i64,
    pub running: i64,
    pub cancelling: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub timed_out: i64,
    pub dead_letter: i64,
}

impl QueueCounts {
    pub fn set(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Pending => self.pending = count,
            JobState::Assigned => self.assigned = count,
            JobState::Running => self.running = count,
            JobState::Cancelling => self.cancelling = count,
            JobState::Completed => self.completed = count,
            JobState::Failed => self.failed = count,
            JobState::Cancelled => self.cancelled = count,
            JobState::TimedOut => self.timed_out = count,
            JobState::DeadLetter => self.dead_letter = count,
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.assigned + self.running + self.cancelling
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert a new job row. Fails `Duplicate` when the id exists.
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job>;

    /// The non-terminal job holding `key`, if any (dedup lookup).
    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Job>>;

    /// Atomically claim one pending job for `robot_id`: eligible by
    /// capabilities/environment/pin, backoff elapsed, lowest priority value
    /// first then oldest. Transitions it to `Assigned`, sets
    /// `assigned_robot_id` and `claimed_at`. Concurrent claimers never
    /// receive the same job.
    async fn claim_one_pending(
        &self,
        robot_id: Uuid,
        capabilities: &[String],
        environment: &str,
    ) -> Result<Option<Job>>;

    /// Advisory look at the head of the pending queue (may race; the claim
    /// is the serialization point).
    async fn peek_pending(&self) -> Result<Option<Job>>;

    /// Conditional update: applies `update` only while the job is still in
    /// `from`. Fails `StaleTransition` otherwise and `Invalid` when the
    /// edge is not in the state machine.
    async fn update_job_state(&self, job_id: Uuid, from: JobState, update: JobUpdate)
        -> Result<Job>;

    /// One transaction: every in-flight job assigned to `robot_id` goes
    /// back to `Pending` with the assignment cleared and `retry_count`
    /// bumped, or to `Failed` with error kind `WorkerLost` when retries
    /// are exhausted.
    async fn requeue_jobs_of_robot(&self, robot_id: Uuid) -> Result<RequeueSummary>;

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Running jobs whose `started_at + timeout_seconds` has passed.
    async fn running_jobs_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Cancelling jobs that have been waiting for a worker ack since
    /// before `cutoff`.
    async fn cancelling_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn count_jobs(&self) -> Result<QueueCounts>;

    /// Non-terminal jobs that were fired by `schedule_id` (overlap check
    /// for `ExecutionMode::Skip`).
    async fn count_active_for_schedule(&self, schedule_id: Uuid) -> Result<i64>;

    // ------------------------------------------------------------------
    // Robots
    // ------------------------------------------------------------------

    /// Insert or refresh a robot row keyed by id.
    async fn upsert_robot(&self, robot: &Robot) -> Result<Robot>;

    async fn get_robot(&self, robot_id: Uuid) -> Result<Robot>;

    async fn list_robots(&self) -> Result<Vec<Robot>>;

    async fn update_robot_status(&self, robot_id: Uuid, status: RobotStatus) -> Result<()>;

    /// Replace a robot's assignment set (and optionally stamp
    /// `last_assignment_at`). Status flips between Idle/Busy accordingly
    /// unless the robot is draining or offline.
    async fn update_robot_assignments(
        &self,
        robot_id: Uuid,
        current_job_ids: &[Uuid],
        stamp_assignment: bool,
    ) -> Result<()>;

    /// Append the heartbeat row and refresh `robots.last_heartbeat_at`.
    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;

    /// Transition every online robot whose last heartbeat predates
    /// `threshold` to Offline; returns the transitioned ids.
    async fn mark_stale_robots(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn set_robot_decommissioned(&self, robot_id: Uuid, decommissioned: bool) -> Result<()>;

    /// Drop heartbeat rows older than `older_than`; returns rows removed.
    async fn prune_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Robot API keys
    // ------------------------------------------------------------------

    async fn find_robot_key(&self, fingerprint: &str) -> Result<Option<RobotApiKey>>;

    async fn insert_robot_key(&self, key: &RobotApiKey) -> Result<()>;

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<()>;

    async fn set_schedule_enabled(
        &self,
        schedule_id: Uuid,
        enabled: bool,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule>;

    /// Enabled schedules with `next_fire_at <= now`.
    async fn schedule_lookup_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Compare-and-swap advance: moves `next_fire_at` from
    /// `observed_next_fire_at` to `next_fire_at`, stamping `last_fire_at`
    /// and bumping `run_count`. Returns false when another instance won
    /// the race. This is the single serialization point for schedule
    /// firing.
    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        observed_next_fire_at: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn record_schedule_failure(&self, schedule_id: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Newest first, entries strictly older than `before` when given.
    async fn list_audit(
        &self,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_update_chain_sets_fields() {
        let robot_id = Uuid::new_v4();
        let update = JobUpdate::to(JobState::Assigned)
            .assigned_to(robot_id)
            .claimed_now();

        assert_eq!(update.to_state, JobState::Assigned);
        assert_eq!(update.assigned_robot_id, Some(Some(robot_id)));
        assert!(update.claimed_at.is_some());
        assert!(update.started_at.is_none());
    }

    #[test]
    fn clear_assignment_is_distinct_from_untouched() {
        let update = JobUpdate::to(JobState::Pending).clear_assignment();
        assert_eq!(update.assigned_robot_id, Some(None));

        let update = JobUpdate::to(JobState::Pending);
        assert_eq!(update.assigned_robot_id, None);
    }

    #[test]
    fn queue_counts_in_flight_sums_held_states() {
        let mut counts = QueueCounts::default();
        counts.set(JobState::Assigned, 2);
        counts.set(JobState::Running, 3);
        counts.set(JobState::Cancelling, 1);
        counts.set(JobState::Pending, 10);
        assert_eq!(counts.in_flight(), 6);
    }
}
