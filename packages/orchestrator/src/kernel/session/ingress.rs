//! Ingress routing: worker messages onto queue and registry operations.
//!
//! The transport (socket reader) hands every post-registration message
//! here. Errors are returned to the caller so it can decide whether the
//! session survives: assignment mismatches are protocol errors, everything
//! else is logged and tolerated.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use super::manager::{AckOutcome, SessionManager};
use super::protocol::{LogLevel, WorkerMessage};
use crate::common::Result;
use crate::kernel::events::{Event, EventHub};
use crate::kernel::queue::JobQueue;
use crate::kernel::registry::RobotRegistry;

pub struct IngressRouter {
    queue: Arc<JobQueue>,
    registry: Arc<RobotRegistry>,
    sessions: Arc<SessionManager>,
    events: Arc<EventHub>,
}

impl IngressRouter {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<RobotRegistry>,
        sessions: Arc<SessionManager>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            queue,
            registry,
            sessions,
            events,
        }
    }

    /// Route one message from `robot_id`'s session. `Register` is handled
    /// at session setup and is unexpected here.
    pub async fn handle(&self, robot_id: Uuid, message: WorkerMessage) -> Result<()> {
        match message {
            WorkerMessage::Register { .. } => {
                warn!(robot_id = %robot_id, "duplicate register frame ignored");
                Ok(())
            }
            WorkerMessage::Heartbeat {
                status,
                current_job_ids,
                cpu_percent,
                memory_mb,
            } => {
                self.registry
                    .on_heartbeat(robot_id, status, current_job_ids, cpu_percent, memory_mb)
                    .await
            }
            WorkerMessage::JobAccept { job_id } => {
                // The dispatcher drives Assigned -> Running once this ack
                // lands; here we only wake it up.
                self.sessions.resolve_ack(job_id, AckOutcome::Accepted);
                Ok(())
            }
            WorkerMessage::JobReject { job_id, reason } => {
                self.sessions
                    .resolve_ack(job_id, AckOutcome::Rejected(reason));
                Ok(())
            }
            WorkerMessage::JobProgress {
                job_id,
                percent,
                node_id,
                message,
            } => {
                self.queue
                    .report_progress(job_id, robot_id, percent, node_id, message)
                    .await
            }
            WorkerMessage::JobComplete { job_id, result } => {
                self.queue.complete(job_id, robot_id, result).await?;
                self.registry.release(robot_id, job_id).await
            }
            WorkerMessage::JobFailed { job_id, error } => {
                self.queue.fail(job_id, robot_id, error).await?;
                self.registry.release(robot_id, job_id).await
            }
            WorkerMessage::JobLog {
                job_id,
                level,
                message,
            } => {
                self.events.publish(Event::JobLog {
                    job_id,
                    robot_id,
                    level: level_str(level).to_string(),
                    message,
                });
                Ok(())
            }
        }
    }
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ErrorKind, JobError};
    use crate::kernel::auth::RobotTokenValidator;
    use crate::kernel::model::{JobState, RobotStatus};
    use crate::kernel::queue::{PayloadLimits, SubmitOptions};
    use crate::kernel::registry::{DispatchPolicy, RegistrationRequest};
    use crate::kernel::store::{MemoryStore, Store};
    use crate::kernel::events::Topic;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<JobQueue>,
        registry: Arc<RobotRegistry>,
        sessions: Arc<SessionManager>,
        events: Arc<EventHub>,
        router: IngressRouter,
    }

    fn harness() -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventHub::new());
        let sessions = Arc::new(SessionManager::new());
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            events.clone(),
            sessions.clone(),
            PayloadLimits::default(),
            Duration::from_secs(30),
        ));
        let registry = Arc::new(RobotRegistry::new(
            store.clone(),
            queue.clone(),
            sessions.clone(),
            events.clone(),
            Arc::new(RobotTokenValidator::new(store.clone(), false)),
            DispatchPolicy::LeastLoaded,
            Duration::from_secs(90),
        ));
        let router = IngressRouter::new(
            queue.clone(),
            registry.clone(),
            sessions.clone(),
            events.clone(),
        );
        Harness {
            store,
            queue,
            registry,
            sessions,
            events,
            router,
        }
    }

    async fn assigned_job(h: &Harness, robot_id: Uuid) -> Uuid {
        h.registry
            .register(RegistrationRequest {
                robot_id,
                token: "tok".into(),
                name: "r1".into(),
                capabilities: vec![],
                environment: "default".into(),
                max_concurrent_jobs: 1,
            })
            .await
            .unwrap();
        let job_id = h
            .queue
            .submit(
                Uuid::new_v4(),
                serde_json::json!({"nodes": []}),
                SubmitOptions::default(),
            )
            .await
            .unwrap()
            .job_id();
        h.store
            .claim_one_pending(robot_id, &[], "default")
            .await
            .unwrap()
            .unwrap();
        h.registry.reserve(robot_id, job_id).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn complete_finishes_job_and_frees_the_robot() {
        let h = harness();
        let robot_id = Uuid::new_v4();
        let job_id = assigned_job(&h, robot_id).await;
        h.router
            .handle(robot_id, WorkerMessage::JobAccept { job_id })
            .await
            .unwrap();

        h.router
            .handle(
                robot_id,
                WorkerMessage::JobComplete {
                    job_id,
                    result: serde_json::json!({"ok": true}),
                },
            )
            .await
            .unwrap();

        let job = h.store.get_job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result.unwrap()["ok"], true);

        let robot = h.store.get_robot(robot_id).await.unwrap();
        assert_eq!(robot.status, RobotStatus::Idle);
    }

    #[tokio::test]
    async fn failed_goes_through_the_retry_pipeline() {
        let h = harness();
        let robot_id = Uuid::new_v4();
        let job_id = assigned_job(&h, robot_id).await;
        h.router
            .handle(robot_id, WorkerMessage::JobAccept { job_id })
            .await
            .unwrap();

        h.router
            .handle(
                robot_id,
                WorkerMessage::JobFailed {
                    job_id,
                    error: JobError::new(ErrorKind::Transient, "browser crash"),
                },
            )
            .await
            .unwrap();

        let job = h.store.get_job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(h
            .store
            .get_robot(robot_id)
            .await
            .unwrap()
            .current_job_ids
            .is_empty());
    }

    #[tokio::test]
    async fn accept_resolves_a_parked_assignment() {
        let h = harness();
        let robot_id = Uuid::new_v4();
        let _session = h.sessions.attach(robot_id);
        h.registry
            .register(RegistrationRequest {
                robot_id,
                token: "tok".into(),
                name: "r1".into(),
                capabilities: vec![],
                environment: "default".into(),
                max_concurrent_jobs: 1,
            })
            .await
            .unwrap();

        let job = crate::kernel::model::Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({}))
            .build();
        h.store.insert_job(&job).await.unwrap();
        h.store
            .claim_one_pending(robot_id, &[], "default")
            .await
            .unwrap();

        // Park an assignment ack, answer it through the router.
        let sessions = h.sessions.clone();
        let router_robot = robot_id;
        let job_id = job.id;
        let ack = tokio::spawn({
            let sessions = sessions.clone();
            let job = job.clone();
            async move {
                sessions
                    .send_assign(router_robot, &job, Duration::from_secs(1))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.router
            .handle(robot_id, WorkerMessage::JobAccept { job_id })
            .await
            .unwrap();

        let outcome = ack.await.unwrap().unwrap();
        assert_eq!(outcome, crate::kernel::session::AckOutcome::Accepted);
    }

    #[tokio::test]
    async fn progress_from_wrong_robot_is_rejected() {
        let h = harness();
        let robot_id = Uuid::new_v4();
        let job_id = assigned_job(&h, robot_id).await;
        h.router
            .handle(robot_id, WorkerMessage::JobAccept { job_id })
            .await
            .unwrap();

        let err = h
            .router
            .handle(
                Uuid::new_v4(),
                WorkerMessage::JobProgress {
                    job_id,
                    percent: 50.0,
                    node_id: None,
                    message: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn job_log_is_fanned_out() {
        let h = harness();
        let robot_id = Uuid::new_v4();
        let mut sub = h.events.subscribe(Topic::Jobs);

        h.router
            .handle(
                robot_id,
                WorkerMessage::JobLog {
                    job_id: Uuid::new_v4(),
                    level: LogLevel::Info,
                    message: "clicked login".into(),
                },
            )
            .await
            .unwrap();

        match sub.recv().await.unwrap() {
            Event::JobLog { level, message, .. } => {
                assert_eq!(level, "info");
                assert_eq!(message, "clicked login");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
