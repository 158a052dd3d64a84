//! In-process test doubles: a scripted fake robot that speaks the session
//! protocol against the ingress router, and a ready-made config. Used by
//! the integration suite; never part of the production path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::{db_id, JobError, Result};
use crate::config::Config;
use crate::kernel::model::RobotStatus;
use crate::kernel::orchestrator::Orchestrator;
use crate::kernel::registry::RegistrationRequest;
use crate::kernel::session::{OrchestratorMessage, WorkerMessage};
use crate::kernel::store::Store;

/// How a fake robot responds to assignments.
#[derive(Debug, Clone)]
pub enum RobotBehavior {
    /// Accept, report running, complete with this result.
    CompleteWith(serde_json::Value),
    /// Accept, report running, fail with this error.
    FailWith(JobError),
    /// Accept and never finish (for timeout/cancel scenarios).
    AcceptAndHold,
    /// Reject every assignment with this reason.
    Reject(String),
}

#[derive(Debug, Clone)]
pub struct FakeRobotConfig {
    pub name: String,
    pub capabilities: Vec<String>,
    pub environment: String,
    pub max_concurrent_jobs: i32,
    pub behavior: RobotBehavior,
    /// Answer `Cancel` frames with a Cancelled failure.
    pub ack_cancels: bool,
    /// Small pause between accept and the terminal report.
    pub work_duration: Duration,
}

impl Default for FakeRobotConfig {
    fn default() -> Self {
        Self {
            name: "fake-robot".to_string(),
            capabilities: vec![],
            environment: "default".to_string(),
            max_concurrent_jobs: 1,
            behavior: RobotBehavior::CompleteWith(serde_json::json!({"ok": true})),
            ack_cancels: true,
            work_duration: Duration::from_millis(10),
        }
    }
}

/// A worker that registers, attaches a session and processes egress
/// messages according to its scripted behavior. Everything it receives is
/// recorded for assertions.
pub struct FakeRobot {
    pub robot_id: Uuid,
    received: Arc<Mutex<Vec<OrchestratorMessage>>>,
    handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl FakeRobot {
    pub async fn connect(orchestrator: &Arc<Orchestrator>, config: FakeRobotConfig) -> Result<Self> {
        let robot_id = db_id();
        orchestrator
            .registry
            .register(RegistrationRequest {
                robot_id,
                token: format!("fake-token-{robot_id}"),
                name: config.name.clone(),
                capabilities: config.capabilities.clone(),
                environment: config.environment.clone(),
                max_concurrent_jobs: config.max_concurrent_jobs,
            })
            .await?;

        let mut session = orchestrator.sessions.attach(robot_id);
        let received: Arc<Mutex<Vec<OrchestratorMessage>>> = Arc::new(Mutex::new(Vec::new()));

        // Heartbeat loop: report exactly what the registry believes this
        // robot runs, at half the heartbeat interval like a real worker.
        let heartbeat_cancel = session.cancel.clone();
        let heartbeat_store = orchestrator.store.clone();
        let heartbeat_registry = orchestrator.registry.clone();
        let beat_every = orchestrator.config().heartbeat_interval / 2;
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(beat_every);
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Ok(robot) = heartbeat_store.get_robot(robot_id).await else {
                    continue;
                };
                if robot.status == RobotStatus::Offline {
                    break;
                }
                let status = if robot.current_job_ids.is_empty() {
                    RobotStatus::Idle
                } else {
                    RobotStatus::Busy
                };
                let _ = heartbeat_registry
                    .on_heartbeat(robot_id, status, robot.current_job_ids, None, None)
                    .await;
            }
        });

        let ingress = orchestrator.ingress.clone();
        let record = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    message = session.rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                record
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(message.clone());

                match message {
                    OrchestratorMessage::Assign { job, .. } => {
                        let job_id = job.job_id;
                        match &config.behavior {
                            RobotBehavior::Reject(reason) => {
                                let _ = ingress
                                    .handle(
                                        robot_id,
                                        WorkerMessage::JobReject {
                                            job_id,
                                            reason: reason.clone(),
                                        },
                                    )
                                    .await;
                            }
                            behavior => {
                                let _ = ingress
                                    .handle(robot_id, WorkerMessage::JobAccept { job_id })
                                    .await;
                                tokio::time::sleep(config.work_duration).await;
                                match behavior {
                                    RobotBehavior::CompleteWith(result) => {
                                        let _ = ingress
                                            .handle(
                                                robot_id,
                                                WorkerMessage::JobComplete {
                                                    job_id,
                                                    result: result.clone(),
                                                },
                                            )
                                            .await;
                                    }
                                    RobotBehavior::FailWith(error) => {
                                        let _ = ingress
                                            .handle(
                                                robot_id,
                                                WorkerMessage::JobFailed {
                                                    job_id,
                                                    error: error.clone(),
                                                },
                                            )
                                            .await;
                                    }
                                    RobotBehavior::AcceptAndHold | RobotBehavior::Reject(_) => {}
                                }
                            }
                        }
                    }
                    OrchestratorMessage::Cancel { job_id } => {
                        if config.ack_cancels {
                            let _ = ingress
                                .handle(
                                    robot_id,
                                    WorkerMessage::JobFailed {
                                        job_id,
                                        error: JobError::new(
                                            crate::common::ErrorKind::Cancelled,
                                            "stopped by cancel",
                                        ),
                                    },
                                )
                                .await;
                        }
                    }
                    OrchestratorMessage::Drain | OrchestratorMessage::Shutdown => {}
                }
            }
        });

        Ok(Self {
            robot_id,
            received,
            handle,
            heartbeat_handle,
        })
    }

    /// Everything the orchestrator has sent this robot so far.
    pub fn received(&self) -> Vec<OrchestratorMessage> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn received_cancel_for(&self, job_id: Uuid) -> bool {
        self.received()
            .iter()
            .any(|m| matches!(m, OrchestratorMessage::Cancel { job_id: id } if *id == job_id))
    }

    pub fn received_assign_for(&self, job_id: Uuid) -> bool {
        self.received().iter().any(
            |m| matches!(m, OrchestratorMessage::Assign { job, .. } if job.job_id == job_id),
        )
    }

    /// Send one heartbeat reporting the given in-flight jobs.
    pub async fn beat(
        &self,
        orchestrator: &Arc<Orchestrator>,
        current_job_ids: Vec<Uuid>,
    ) -> Result<()> {
        let status = if current_job_ids.is_empty() {
            RobotStatus::Idle
        } else {
            RobotStatus::Busy
        };
        orchestrator
            .registry
            .on_heartbeat(self.robot_id, status, current_job_ids, None, None)
            .await
    }

    /// Drop off the wire without saying goodbye (failover scenarios).
    pub fn vanish(&self, orchestrator: &Arc<Orchestrator>) {
        orchestrator.sessions.disconnect(self.robot_id);
        self.handle.abort();
        self.heartbeat_handle.abort();
    }
}

/// A config suitable for fast in-memory tests: short sweeps, small
/// deadlines, auth off.
pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        port: 0,
        workers: 1,
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(500),
        job_timeout_default: Duration::from_secs(3600),
        assign_ack_timeout: Duration::from_millis(500),
        cancel_ack_timeout: Duration::from_secs(2),
        schedule_sweep_interval: Duration::from_millis(50),
        timeout_sweep_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        heartbeat_retention: Duration::from_secs(86400),
        robot_auth_enabled: false,
        jwt_secret_key: "test-secret".to_string(),
        jwt_access_expire_minutes: 60,
        jwt_refresh_expire_days: 30,
        cors_origins: vec![],
        max_workflow_bytes: 10 * 1024 * 1024,
        max_workflow_nodes: 1000,
    }
}
