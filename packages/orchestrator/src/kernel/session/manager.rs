//! Worker session registry.
//!
//! One live session per robot. The transport (socket reader/writer tasks)
//! attaches here; the dispatcher and queue manager talk to robots through
//! this registry without knowing anything about sockets. Assignments are
//! request/response: `send_assign` parks a oneshot keyed by job id and the
//! ingress side resolves it when `JobAccept`/`JobReject` arrives.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{JobAssignment, OrchestratorMessage};
use crate::common::{db_id, CoreError, Result};
use crate::kernel::model::Job;

const EGRESS_BUFFER: usize = 64;

/// Worker's answer to an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Rejected(String),
}

struct SessionHandle {
    session_id: Uuid,
    tx: mpsc::Sender<OrchestratorMessage>,
    cancel: CancellationToken,
}

/// What the transport holds for the lifetime of one connection.
pub struct SessionReceiver {
    pub session_id: Uuid,
    pub rx: mpsc::Receiver<OrchestratorMessage>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    pending_acks: Mutex<HashMap<Uuid, oneshot::Sender<AckOutcome>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh session for `robot_id`, tearing down any session it
    /// replaces (last registration wins; the stale socket sees its cancel
    /// token fire and closes).
    pub fn attach(&self, robot_id: Uuid) -> SessionReceiver {
        let (tx, rx) = mpsc::channel(EGRESS_BUFFER);
        let cancel = CancellationToken::new();
        let session_id = db_id();

        let handle = SessionHandle {
            session_id,
            tx,
            cancel: cancel.clone(),
        };

        let replaced = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(robot_id, handle);
        if let Some(old) = replaced {
            debug!(robot_id = %robot_id, "replacing live session");
            old.cancel.cancel();
        }

        SessionReceiver {
            session_id,
            rx,
            cancel,
        }
    }

    /// Remove a session, but only the one that owns `session_id`; a
    /// replacement session attached in the meantime stays.
    pub fn detach(&self, robot_id: Uuid, session_id: Uuid) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sessions.get(&robot_id) {
            if handle.session_id == session_id {
                let handle = sessions.remove(&robot_id).expect("checked above");
                handle.cancel.cancel();
            }
        }
    }

    pub fn is_connected(&self, robot_id: Uuid) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&robot_id)
    }

    pub fn connected_robots(&self) -> Vec<Uuid> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn sender_for(&self, robot_id: Uuid) -> Result<mpsc::Sender<OrchestratorMessage>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&robot_id)
            .map(|h| h.tx.clone())
            .ok_or(CoreError::WorkerLost { robot_id })
    }

    /// Deliver an assignment and wait for the worker's accept/reject up to
    /// `ack_timeout`. Timeout and disconnects surface as errors so the
    /// dispatcher can revert the claim.
    pub async fn send_assign(
        &self,
        robot_id: Uuid,
        job: &Job,
        ack_timeout: Duration,
    ) -> Result<AckOutcome> {
        let tx = self.sender_for(robot_id)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, ack_tx);

        let message = OrchestratorMessage::Assign {
            job: JobAssignment::from(job),
            deadline_ms: ack_timeout.as_millis() as u64,
        };

        let send_result = tx.send(message).await;
        if send_result.is_err() {
            self.clear_ack(job.id);
            return Err(CoreError::WorkerLost { robot_id });
        }

        match tokio::time::timeout(ack_timeout, ack_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Ack channel dropped: session torn down mid-wait.
            Ok(Err(_)) => Err(CoreError::WorkerLost { robot_id }),
            Err(_) => {
                self.clear_ack(job.id);
                Err(CoreError::Timeout(format!(
                    "robot {robot_id} did not acknowledge assignment of job {} in time",
                    job.id
                )))
            }
        }
    }

    /// Resolve a parked assignment ack. Unknown job ids are ignored (late
    /// ack after the deadline already reverted the claim).
    pub fn resolve_ack(&self, job_id: Uuid, outcome: AckOutcome) {
        let parked = self
            .pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        match parked {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(job_id = %job_id, "late assignment ack ignored"),
        }
    }

    fn clear_ack(&self, job_id: Uuid) {
        self.pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    pub async fn send_cancel(&self, robot_id: Uuid, job_id: Uuid) -> Result<()> {
        let tx = self.sender_for(robot_id)?;
        tx.send(OrchestratorMessage::Cancel { job_id })
            .await
            .map_err(|_| CoreError::WorkerLost { robot_id })
    }

    /// Best-effort broadcast (drain/shutdown). Dead sessions are skipped.
    pub async fn broadcast(&self, message: OrchestratorMessage) {
        let senders: Vec<(Uuid, mpsc::Sender<OrchestratorMessage>)> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .iter()
                .map(|(id, h)| (*id, h.tx.clone()))
                .collect()
        };
        for (robot_id, tx) in senders {
            if tx.send(message.clone()).await.is_err() {
                warn!(robot_id = %robot_id, "broadcast to dead session skipped");
            }
        }
    }

    /// Tear down a session outright (stale robot re-admission control).
    pub fn disconnect(&self, robot_id: Uuid) {
        let handle = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&robot_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::session::protocol::OrchestratorMessage;

    fn sample_job() -> Job {
        Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({}))
            .build()
    }

    #[tokio::test]
    async fn assign_resolves_on_accept() {
        let manager = std::sync::Arc::new(SessionManager::new());
        let robot_id = Uuid::new_v4();
        let mut session = manager.attach(robot_id);

        let job = sample_job();
        let job_id = job.id;

        // Fake worker: accept whatever arrives.
        let worker_manager = manager.clone();
        let worker = tokio::spawn(async move {
            match session.rx.recv().await.unwrap() {
                OrchestratorMessage::Assign { job, .. } => {
                    worker_manager.resolve_ack(job.job_id, AckOutcome::Accepted);
                }
                other => panic!("unexpected egress: {other:?}"),
            }
        });

        let outcome = manager
            .send_assign(robot_id, &job, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Accepted);
        worker.await.unwrap();

        // Ack slot is consumed.
        manager.resolve_ack(job_id, AckOutcome::Accepted);
    }

    #[tokio::test]
    async fn assign_rejection_carries_the_reason() {
        let manager = std::sync::Arc::new(SessionManager::new());
        let robot_id = Uuid::new_v4();
        let mut session = manager.attach(robot_id);

        let worker_manager = manager.clone();
        tokio::spawn(async move {
            if let Some(OrchestratorMessage::Assign { job, .. }) = session.rx.recv().await {
                worker_manager.resolve_ack(job.job_id, AckOutcome::Rejected("at capacity".into()));
            }
        });

        let outcome = manager
            .send_assign(robot_id, &sample_job(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Rejected("at capacity".into()));
    }

    #[tokio::test]
    async fn assign_times_out_without_ack() {
        let manager = SessionManager::new();
        let robot_id = Uuid::new_v4();
        let _session = manager.attach(robot_id);

        let err = manager
            .send_assign(robot_id, &sample_job(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn assign_to_unknown_robot_is_worker_lost() {
        let manager = SessionManager::new();
        let err = manager
            .send_assign(Uuid::new_v4(), &sample_job(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WorkerLost { .. }));
    }

    #[tokio::test]
    async fn reattach_replaces_and_cancels_the_old_session() {
        let manager = SessionManager::new();
        let robot_id = Uuid::new_v4();

        let old = manager.attach(robot_id);
        let _new = manager.attach(robot_id);
        assert!(old.cancel.is_cancelled());
        assert!(manager.is_connected(robot_id));

        // Detach with the old session id is a no-op.
        manager.detach(robot_id, old.session_id);
        assert!(manager.is_connected(robot_id));
    }

    #[tokio::test]
    async fn detach_removes_the_owning_session() {
        let manager = SessionManager::new();
        let robot_id = Uuid::new_v4();
        let session = manager.attach(robot_id);

        manager.detach(robot_id, session.session_id);
        assert!(!manager.is_connected(robot_id));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let manager = SessionManager::new();
        let mut sessions: Vec<SessionReceiver> =
            (0..3).map(|_| manager.attach(Uuid::new_v4())).collect();

        manager.broadcast(OrchestratorMessage::Drain).await;

        for session in sessions.iter_mut() {
            match session.rx.recv().await.unwrap() {
                OrchestratorMessage::Drain => {}
                other => panic!("unexpected egress: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn cancel_goes_to_the_assigned_robot() {
        let manager = SessionManager::new();
        let robot_id = Uuid::new_v4();
        let mut session = manager.attach(robot_id);

        let job_id = Uuid::new_v4();
        manager.send_cancel(robot_id, job_id).await.unwrap();

        match session.rx.recv().await.unwrap() {
            OrchestratorMessage::Cancel { job_id: got } => assert_eq!(got, job_id),
            other => panic!("unexpected egress: {other:?}"),
        }
    }
}
