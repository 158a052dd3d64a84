//! Error kinds shared across the orchestrator core.
//!
//! `ErrorKind` is the coarse classification persisted on job rows and used
//! for retry decisions. `CoreError` is the typed error the core operations
//! return; every variant maps onto exactly one kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse failure classification, stored on job rows and carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Client sent malformed input.
    Invalid,
    /// Idempotency/dedup hit.
    Duplicate,
    /// Referenced entity missing.
    NotFound,
    /// Conditional state update lost a race.
    StaleTransition,
    /// Assigned worker disconnected or stopped heartbeating.
    WorkerLost,
    /// Job or cancel exceeded its deadline.
    Timeout,
    /// Store or network glitch.
    Transient,
    /// User-initiated cancellation.
    Cancelled,
    /// Unrecoverable; the process exits nonzero.
    Fatal,
}

impl ErrorKind {
    /// Whether a job failing with this kind goes back through the retry
    /// pipeline (until `max_retries` is exhausted).
    pub fn retries_job(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::WorkerLost | ErrorKind::Transient
        )
    }

    /// Whether an internal operation failing with this kind should be
    /// retried in place with a bounded loop.
    pub fn retries_inline(&self) -> bool {
        matches!(self, ErrorKind::StaleTransition | ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StaleTransition => "stale_transition",
            ErrorKind::WorkerLost => "worker_lost",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// A job failure as reported to submitters and observers: kind, a human
/// message, and the worker's stack trace when it sent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn worker_lost(robot_id: Uuid) -> Self {
        Self::new(
            ErrorKind::WorkerLost,
            format!("assigned robot {robot_id} went offline"),
        )
    }

    pub fn timed_out(timeout_seconds: i64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("job exceeded its {timeout_seconds}s timeout"),
        )
    }
}

/// Typed error for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("payload too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("duplicate {entity} {id}")]
    Duplicate { entity: &'static str, id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("stale transition for job {job_id}: state changed underneath the update")]
    StaleTransition { job_id: Uuid },

    #[error("robot {robot_id} lost while holding assignments")]
    WorkerLost { robot_id: Uuid },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CoreError::Invalid(msg.into())
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        CoreError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Invalid(_) | CoreError::TooLarge { .. } | CoreError::Unauthorized(_) => {
                ErrorKind::Invalid
            }
            CoreError::Duplicate { .. } => ErrorKind::Duplicate,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::StaleTransition { .. } => ErrorKind::StaleTransition,
            CoreError::WorkerLost { .. } => ErrorKind::WorkerLost,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::Invalid("row not found".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::Invalid(format!("unique constraint violated: {db}"))
            }
            _ => CoreError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Invalid(format!("malformed JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds_retry_the_job() {
        assert!(ErrorKind::Timeout.retries_job());
        assert!(ErrorKind::WorkerLost.retries_job());
        assert!(ErrorKind::Transient.retries_job());
    }

    #[test]
    fn terminal_kinds_do_not_retry_the_job() {
        assert!(!ErrorKind::Invalid.retries_job());
        assert!(!ErrorKind::Cancelled.retries_job());
        assert!(!ErrorKind::Fatal.retries_job());
        assert!(!ErrorKind::Duplicate.retries_job());
    }

    #[test]
    fn stale_transition_retries_inline_only() {
        assert!(ErrorKind::StaleTransition.retries_inline());
        assert!(!ErrorKind::StaleTransition.retries_job());
    }

    #[test]
    fn core_error_maps_to_its_kind() {
        let id = Uuid::new_v4();
        assert_eq!(
            CoreError::not_found("job", id).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::StaleTransition { job_id: id }.kind(),
            ErrorKind::StaleTransition
        );
        assert_eq!(
            CoreError::TooLarge {
                size: 11,
                limit: 10
            }
            .kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn job_error_serializes_without_empty_stack() {
        let err = JobError::new(ErrorKind::Timeout, "too slow");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("timeout"));
        assert!(!json.contains("stack"));

        let err = err.with_stack("at step 3");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("at step 3"));
    }
}
