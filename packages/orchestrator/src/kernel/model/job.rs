//! Job model: one request to execute one workflow on some robot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, ErrorKind, JobError};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Assigned,
    Running,
    /// Cancel sent to the worker, ack outstanding.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    DeadLetter,
}

impl JobState {
    /// Terminal states are never left except through the retry or replay
    /// pipelines, which are explicit edges below.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::TimedOut
                | JobState::DeadLetter
        )
    }

    /// Whether a robot currently holds this job.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobState::Assigned | JobState::Running | JobState::Cancelling
        )
    }

    /// Legal state-machine edges. Conditional updates in the store enforce
    /// the `from` side; this encodes the `to` side.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Pending)
                | (Assigned, Cancelling)
                | (Assigned, Cancelled)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Running, TimedOut)
                | (Running, Pending)
                | (Cancelling, Cancelled)
                | (Cancelling, Completed)
                | (Cancelling, Failed)
                | (Failed, Pending)
                | (Failed, DeadLetter)
                | (TimedOut, Pending)
                | (TimedOut, DeadLetter)
                | (DeadLetter, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
            JobState::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "assigned" => Ok(JobState::Assigned),
            "running" => Ok(JobState::Running),
            "cancelling" => Ok(JobState::Cancelling),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "timed_out" => Ok(JobState::TimedOut),
            "dead_letter" => Ok(JobState::DeadLetter),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Who or what put this job on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// "api", "schedule", "replay", ...
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
}

// ============================================================================
// Job Model
// ============================================================================

/// Priority range: 0 is the most urgent, 20 the least.
pub const PRIORITY_MIN: i16 = 0;
pub const PRIORITY_MAX: i16 = 20;
pub const PRIORITY_DEFAULT: i16 = 10;

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 3600;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Core identity
    pub workflow_id: Uuid,
    pub payload: serde_json::Value,

    // Routing
    #[builder(default = PRIORITY_DEFAULT)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub environment: String,
    #[builder(default)]
    pub required_capabilities: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub target_robot_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub trigger_context: Option<serde_json::Value>,

    // State
    #[builder(default)]
    pub state: JobState,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default = DEFAULT_TIMEOUT_SECONDS)]
    pub timeout_seconds: i64,
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,
    /// Retry backoff gate: the claim query skips jobs whose next attempt
    /// time has not arrived yet.
    #[builder(default, setter(strip_option))]
    pub next_attempt_at: Option<DateTime<Utc>>,

    // Assignment
    #[builder(default, setter(strip_option))]
    pub assigned_robot_id: Option<Uuid>,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_stack: Option<String>,

    // Dead letter bookkeeping
    #[builder(default, setter(strip_option))]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub dead_letter_reason: Option<String>,
    #[builder(default = 0)]
    pub replay_count: i32,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The reported failure, when the job has one.
    pub fn error(&self) -> Option<JobError> {
        let kind = self.error_kind?;
        Some(JobError {
            kind,
            message: self.error_message.clone().unwrap_or_default(),
            stack: self.error_stack.clone(),
        })
    }

    /// Whether another retry attempt is available.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether this pending job may be claimed at `now` (backoff elapsed).
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Whether `robot_id` satisfies this job's target pin.
    pub fn pin_allows(&self, robot_id: Uuid) -> bool {
        self.target_robot_id.map(|t| t == robot_id).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({"nodes": []}))
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_defaults() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.priority, PRIORITY_DEFAULT);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(job.retry_count, 0);
        assert!(job.assigned_robot_id.is_none());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::DeadLetter.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Cancelling.is_terminal());
    }

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(JobState::Pending.can_transition_to(JobState::Assigned));
        assert!(JobState::Assigned.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
    }

    #[test]
    fn retry_and_replay_edges_are_legal() {
        assert!(JobState::Failed.can_transition_to(JobState::Pending));
        assert!(JobState::TimedOut.can_transition_to(JobState::Pending));
        assert!(JobState::Failed.can_transition_to(JobState::DeadLetter));
        assert!(JobState::DeadLetter.can_transition_to(JobState::Pending));
    }

    #[test]
    fn completed_is_a_dead_end() {
        for to in [
            JobState::Pending,
            JobState::Assigned,
            JobState::Running,
            JobState::Failed,
            JobState::DeadLetter,
        ] {
            assert!(!JobState::Completed.can_transition_to(to));
        }
    }

    #[test]
    fn skipping_assigned_is_illegal() {
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
    }

    #[test]
    fn cancelling_resolves_to_terminal_only() {
        assert!(JobState::Cancelling.can_transition_to(JobState::Cancelled));
        assert!(JobState::Cancelling.can_transition_to(JobState::Completed));
        assert!(!JobState::Cancelling.can_transition_to(JobState::Running));
        assert!(!JobState::Cancelling.can_transition_to(JobState::Pending));
    }

    #[test]
    fn backoff_gates_claimability() {
        let now = Utc::now();
        let mut job = sample_job();
        assert!(job.is_claimable_at(now));

        job.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_claimable_at(now));
        assert!(job.is_claimable_at(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn pin_allows_only_the_target() {
        let mut job = sample_job();
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        assert!(job.pin_allows(r1));

        job.target_robot_id = Some(r1);
        assert!(job.pin_allows(r1));
        assert!(!job.pin_allows(r2));
    }

    #[test]
    fn error_reassembles_from_columns() {
        let mut job = sample_job();
        assert!(job.error().is_none());

        job.error_kind = Some(ErrorKind::WorkerLost);
        job.error_message = Some("robot went away".into());
        let err = job.error().unwrap();
        assert_eq!(err.kind, ErrorKind::WorkerLost);
        assert_eq!(err.message, "robot went away");
        assert!(err.stack.is_none());
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Pending,
            JobState::Assigned,
            JobState::Running,
            JobState::Cancelling,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::TimedOut,
            JobState::DeadLetter,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }
}
