//! Wire protocol for worker sessions.
//!
//! Frames are JSON objects `{type, seq, robot_id, payload}`. `seq` is a
//! per-session monotonic counter; receivers drop duplicates so a reconnect
//! replay is harmless. Messages for one job are ordered by the single
//! egress queue per session; nothing is guaranteed across jobs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::JobError;
use crate::kernel::model::{Job, RobotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Messages a worker sends to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        name: String,
        capabilities: Vec<String>,
        environment: String,
        max_concurrent_jobs: i32,
    },
    Heartbeat {
        status: RobotStatus,
        current_job_ids: Vec<Uuid>,
        cpu_percent: Option<f64>,
        memory_mb: Option<f64>,
    },
    JobAccept {
        job_id: Uuid,
    },
    JobReject {
        job_id: Uuid,
        reason: String,
    },
    JobProgress {
        job_id: Uuid,
        percent: f64,
        node_id: Option<String>,
        message: Option<String>,
    },
    JobComplete {
        job_id: Uuid,
        result: serde_json::Value,
    },
    JobFailed {
        job_id: Uuid,
        error: JobError,
    },
    JobLog {
        job_id: Uuid,
        level: LogLevel,
        message: String,
    },
}

impl WorkerMessage {
    /// The job this message refers to, when it refers to one.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            WorkerMessage::Register { .. } | WorkerMessage::Heartbeat { .. } => None,
            WorkerMessage::JobAccept { job_id }
            | WorkerMessage::JobReject { job_id, .. }
            | WorkerMessage::JobProgress { job_id, .. }
            | WorkerMessage::JobComplete { job_id, .. }
            | WorkerMessage::JobFailed { job_id, .. }
            | WorkerMessage::JobLog { job_id, .. } => Some(*job_id),
        }
    }
}

/// The job view shipped with an assignment: exactly what a black-box
/// executor needs, nothing about queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub payload: serde_json::Value,
    pub timeout_seconds: i64,
    pub attempt: i32,
}

impl From<&Job> for JobAssignment {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            workflow_id: job.workflow_id,
            payload: job.payload.clone(),
            timeout_seconds: job.timeout_seconds,
            attempt: job.retry_count + 1,
        }
    }
}

/// Messages the orchestrator sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    Assign {
        job: JobAssignment,
        deadline_ms: u64,
    },
    Cancel {
        job_id: Uuid,
    },
    /// Stop accepting new jobs, finish what is running.
    Drain,
    Shutdown,
}

/// Ingress frame as read off the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFrame {
    pub seq: u64,
    pub robot_id: Uuid,
    #[serde(flatten)]
    pub message: WorkerMessage,
}

/// Egress frame as written to the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorFrame {
    pub seq: u64,
    pub robot_id: Uuid,
    #[serde(flatten)]
    pub message: OrchestratorMessage,
}

/// Duplicate filter over per-session sequence numbers. Replayed frames
/// after a reconnect re-send old numbers and are ignored.
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `seq` advances the window; false for duplicates and
    /// out-of-order replays.
    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last {
            Some(last) if seq <= last => false,
            _ => {
                self.last = Some(seq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    #[test]
    fn worker_frame_has_the_wire_shape() {
        let frame = WorkerFrame {
            seq: 7,
            robot_id: Uuid::new_v4(),
            message: WorkerMessage::JobAccept {
                job_id: Uuid::new_v4(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("seq").is_some());
        assert!(value.get("robot_id").is_some());
        assert_eq!(value["type"], "job_accept");
        assert!(value["payload"].get("job_id").is_some());
    }

    #[test]
    fn register_round_trips() {
        let frame = WorkerFrame {
            seq: 1,
            robot_id: Uuid::new_v4(),
            message: WorkerMessage::Register {
                name: "r1".into(),
                capabilities: vec!["browser".into()],
                environment: "default".into(),
                max_concurrent_jobs: 2,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq, 1);
        match parsed.message {
            WorkerMessage::Register {
                name,
                max_concurrent_jobs,
                ..
            } => {
                assert_eq!(name, "r1");
                assert_eq!(max_concurrent_jobs, 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn job_failed_carries_the_error() {
        let frame = WorkerFrame {
            seq: 3,
            robot_id: Uuid::new_v4(),
            message: WorkerMessage::JobFailed {
                job_id: Uuid::new_v4(),
                error: JobError::new(ErrorKind::Transient, "browser crashed")
                    .with_stack("node 14: click"),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        match parsed.message {
            WorkerMessage::JobFailed { error, .. } => {
                assert_eq!(error.kind, ErrorKind::Transient);
                assert_eq!(error.stack.as_deref(), Some("node 14: click"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn assign_round_trips_with_payload() {
        let job = Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({"nodes": [{"id": "start"}]}))
            .build();
        let frame = OrchestratorFrame {
            seq: 1,
            robot_id: Uuid::new_v4(),
            message: OrchestratorMessage::Assign {
                job: JobAssignment::from(&job),
                deadline_ms: 5000,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: OrchestratorFrame = serde_json::from_str(&json).unwrap();
        match parsed.message {
            OrchestratorMessage::Assign { job: assignment, deadline_ms } => {
                assert_eq!(assignment.job_id, job.id);
                assert_eq!(assignment.attempt, 1);
                assert_eq!(deadline_ms, 5000);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn drain_has_no_payload_fields() {
        let frame = OrchestratorFrame {
            seq: 2,
            robot_id: Uuid::new_v4(),
            message: OrchestratorMessage::Drain,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "drain");
    }

    #[test]
    fn seq_tracker_drops_duplicates_and_replays() {
        let mut tracker = SeqTracker::new();
        assert!(tracker.accept(1));
        assert!(tracker.accept(2));
        assert!(!tracker.accept(2));
        assert!(!tracker.accept(1));
        assert!(tracker.accept(5));
        assert!(!tracker.accept(4));
    }

    #[test]
    fn job_id_is_extracted_per_message() {
        let job_id = Uuid::new_v4();
        assert_eq!(
            WorkerMessage::JobAccept { job_id }.job_id(),
            Some(job_id)
        );
        assert_eq!(
            WorkerMessage::Heartbeat {
                status: RobotStatus::Idle,
                current_job_ids: vec![],
                cpu_percent: None,
                memory_mb: None,
            }
            .job_id(),
            None
        );
    }
}
