//! Robot registry: the authoritative view of fleet liveness and capacity.
//!
//! Mutations are serialized per robot through a keyed mutex map; reads are
//! store snapshots. The liveness sweep turns silent robots Offline and
//! pushes their in-flight jobs back through the queue, in one causal order
//! per robot, before any re-admission.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{CoreError, ErrorKind, JobError, Result};
use crate::kernel::auth::TokenValidator;
use crate::kernel::events::{Event, EventHub};
use crate::kernel::model::{AuditAction, AuditEntry, Heartbeat, Job, Robot, RobotStatus};
use crate::kernel::queue::JobQueue;
use crate::kernel::session::SessionManager;
use crate::kernel::store::{JobFilter, Store};

/// How eligible robots are ranked for an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Lowest load ratio wins; ties go to the robot idle the longest.
    #[default]
    LeastLoaded,
    /// Rotate through eligible robots.
    RoundRobin,
    /// Prefer the robot that last completed the same workflow, then fall
    /// back to least-loaded.
    Affinity,
}

/// Heartbeat/assignment disagreements younger than this are still
/// settling (the assign and the heartbeat crossed on the wire) and are
/// not reconciled.
const RECONCILE_GRACE_SECONDS: i64 = 10;

pub struct RegistrationRequest {
    pub robot_id: Uuid,
    pub token: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub environment: String,
    pub max_concurrent_jobs: i32,
}

pub struct RobotRegistry {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    sessions: Arc<SessionManager>,
    events: Arc<EventHub>,
    validator: Arc<dyn TokenValidator>,
    policy: DispatchPolicy,
    heartbeat_timeout: Duration,
    robot_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    round_robin_cursor: AtomicUsize,
    idle_signal: Notify,
}

impl RobotRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<JobQueue>,
        sessions: Arc<SessionManager>,
        events: Arc<EventHub>,
        validator: Arc<dyn TokenValidator>,
        policy: DispatchPolicy,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            sessions,
            events,
            validator,
            policy,
            heartbeat_timeout,
            robot_locks: Mutex::new(HashMap::new()),
            round_robin_cursor: AtomicUsize::new(0),
            idle_signal: Notify::new(),
        }
    }

    /// Fires whenever capacity may have appeared (registration, release).
    pub fn idle_signal(&self) -> &Notify {
        &self.idle_signal
    }

    /// Per-robot mutex; entries with no outside holders are collected on
    /// the way in.
    fn robot_lock(&self, robot_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.robot_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(robot_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Validate the token and admit (or re-admit) a robot as Idle. The
    /// registry's persisted assignment set survives a reconnect; the next
    /// heartbeat reconciles it against what the worker actually runs.
    pub async fn register(&self, request: RegistrationRequest) -> Result<Robot> {
        let credential = self.validator.validate(&request.token).await?;
        if let Some(bound) = credential.robot_id() {
            if bound != request.robot_id {
                return Err(CoreError::Unauthorized(format!(
                    "token is bound to robot {bound}, not {}",
                    request.robot_id
                )));
            }
        }
        if request.max_concurrent_jobs <= 0 {
            return Err(CoreError::invalid("max_concurrent_jobs must be positive"));
        }

        let lock = self.robot_lock(request.robot_id);
        let _guard = lock.lock().await;

        let existing = match self.store.get_robot(request.robot_id).await {
            Ok(robot) => {
                if robot.decommissioned {
                    return Err(CoreError::Unauthorized(format!(
                        "robot {} is decommissioned",
                        request.robot_id
                    )));
                }
                Some(robot)
            }
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let current_job_ids = existing
            .as_ref()
            .map(|r| r.current_job_ids.clone())
            .unwrap_or_default();
        let status = if current_job_ids.is_empty() {
            RobotStatus::Idle
        } else {
            RobotStatus::Busy
        };

        let mut robot = Robot::builder()
            .id(request.robot_id)
            .name(request.name)
            .capabilities(request.capabilities)
            .environment(request.environment)
            .max_concurrent_jobs(request.max_concurrent_jobs)
            .status(status)
            .current_job_ids(current_job_ids)
            .token_fingerprint(crate::kernel::auth::token_fingerprint(&request.token))
            .build();
        robot.last_heartbeat_at = Some(Utc::now());
        if let Some(existing) = &existing {
            robot.registered_at = existing.registered_at;
            robot.last_assignment_at = existing.last_assignment_at;
        }

        let robot = self.store.upsert_robot(&robot).await?;

        info!(robot_id = %robot.id, name = %robot.name, "robot registered");
        self.audit(
            AuditEntry::new(AuditAction::RobotRegistered)
                .robot(robot.id)
                .detail(serde_json::json!({
                    "environment": robot.environment,
                    "max_concurrent_jobs": robot.max_concurrent_jobs,
                })),
        )
        .await;
        self.events.publish(Event::RobotOnline {
            robot_id: robot.id,
            name: robot.name.clone(),
        });
        self.idle_signal.notify_waiters();
        self.idle_signal.notify_one();

        Ok(robot)
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(error = %e, "audit append failed");
        }
        self.events.publish(Event::Activity { entry });
    }

    // ------------------------------------------------------------------
    // Heartbeats and reconciliation
    // ------------------------------------------------------------------

    /// Record a heartbeat and reconcile the worker's job set against the
    /// registry's. The registry wins: jobs it holds that the worker no
    /// longer reports go back through the retry pipeline; jobs only the
    /// worker claims are cancelled on the worker.
    pub async fn on_heartbeat(
        &self,
        robot_id: Uuid,
        reported_status: RobotStatus,
        reported_job_ids: Vec<Uuid>,
        cpu_percent: Option<f64>,
        memory_mb: Option<f64>,
    ) -> Result<()> {
        let lock = self.robot_lock(robot_id);
        let _guard = lock.lock().await;

        let robot = self.store.get_robot(robot_id).await?;
        if robot.status == RobotStatus::Offline {
            // Marked stale since the session opened; a fresh Register is
            // required before heartbeats count again.
            return Err(CoreError::invalid(format!(
                "robot {robot_id} is offline; re-register first"
            )));
        }

        let mut heartbeat = Heartbeat::new(robot_id, reported_status, reported_job_ids.len() as i32);
        heartbeat.cpu_percent = cpu_percent;
        heartbeat.memory_mb = memory_mb;
        self.store.record_heartbeat(&heartbeat).await?;

        let registry_view: HashSet<Uuid> = robot.current_job_ids.iter().copied().collect();
        let worker_view: HashSet<Uuid> = reported_job_ids.iter().copied().collect();

        if registry_view != worker_view {
            // An assignment accepted moments ago may legitimately be
            // missing from the heartbeat snapshot the worker built before
            // it arrived. Only reconcile settled disagreements.
            let now = Utc::now();
            let settled = |job: &Job| match job.claimed_at {
                Some(claimed_at) => {
                    now - claimed_at > chrono::Duration::seconds(RECONCILE_GRACE_SECONDS)
                }
                None => true,
            };

            let mut lost = Vec::new();
            for &job_id in registry_view.difference(&worker_view) {
                match self.store.get_job(job_id).await {
                    Ok(job) if job.assigned_robot_id == Some(robot_id) && settled(&job) => {
                        lost.push(job_id)
                    }
                    Ok(_) => {}
                    Err(e) => debug!(job_id = %job_id, error = %e, "reconcile lookup failed"),
                }
            }

            let mut stale = Vec::new();
            for &job_id in worker_view.difference(&registry_view) {
                match self.store.get_job(job_id).await {
                    // The worker holds a job this registry no longer
                    // credits to it: a stale execution unless the claim is
                    // fresh enough to still be settling.
                    Ok(job) if job.assigned_robot_id == Some(robot_id) && !settled(&job) => {}
                    _ => stale.push(job_id),
                }
            }

            if !lost.is_empty() || !stale.is_empty() {
                warn!(
                    robot_id = %robot_id,
                    lost = lost.len(),
                    stale = stale.len(),
                    "heartbeat mismatch, reconciling"
                );

                // Jobs the registry holds that the worker dropped: lost.
                for &job_id in &lost {
                    if let Err(e) = self
                        .queue
                        .fail(
                            job_id,
                            robot_id,
                            JobError::new(
                                ErrorKind::WorkerLost,
                                "worker no longer reports this job",
                            ),
                        )
                        .await
                    {
                        debug!(job_id = %job_id, error = %e, "reconcile requeue skipped");
                    }
                }

                // Jobs only the worker claims: stale executions, cancel.
                for &job_id in &stale {
                    if let Err(e) = self.sessions.send_cancel(robot_id, job_id).await {
                        debug!(job_id = %job_id, error = %e, "reconcile cancel undeliverable");
                    }
                }

                let kept: Vec<Uuid> = robot
                    .current_job_ids
                    .iter()
                    .copied()
                    .filter(|id| !lost.contains(id))
                    .collect();
                self.store
                    .update_robot_assignments(robot_id, &kept, false)
                    .await?;
                self.audit(
                    AuditEntry::new(AuditAction::RobotReconciled)
                        .robot(robot_id)
                        .detail(serde_json::json!({
                            "lost": lost.len(),
                            "stale": stale.len(),
                        })),
                )
                .await;
                if kept.is_empty() {
                    self.idle_signal.notify_waiters();
                    self.idle_signal.notify_one();
                }
            }
        }

        let current = self.store.get_robot(robot_id).await?;
        self.events.publish(Event::RobotStatus {
            robot_id,
            status: current.status,
            current_job_count: current.current_job_ids.len(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Candidate selection
    // ------------------------------------------------------------------

    /// Pick an eligible robot for `job`, or none. Eligibility is the full
    /// predicate (online, capacity, capabilities, environment, pin, not
    /// draining) plus a live session to actually deliver on. `exclude`
    /// carries robots the caller is backing off from.
    pub async fn pick_candidate(&self, job: &Job, exclude: &[Uuid]) -> Result<Option<Robot>> {
        let robots = self.store.list_robots().await?;
        let eligible: Vec<Robot> = robots
            .into_iter()
            .filter(|r| {
                r.is_eligible_for(job)
                    && self.sessions.is_connected(r.id)
                    && !exclude.contains(&r.id)
            })
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let chosen = match self.policy {
            DispatchPolicy::LeastLoaded => pick_least_loaded(&eligible),
            DispatchPolicy::RoundRobin => {
                let index = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                eligible.get(index % eligible.len()).cloned()
            }
            DispatchPolicy::Affinity => match self.last_successful_robot(job).await? {
                Some(preferred_id) => eligible
                    .iter()
                    .find(|r| r.id == preferred_id)
                    .cloned()
                    .or_else(|| pick_least_loaded(&eligible)),
                None => pick_least_loaded(&eligible),
            },
        };
        Ok(chosen)
    }

    async fn last_successful_robot(&self, job: &Job) -> Result<Option<Uuid>> {
        let completed = self
            .store
            .list_jobs(JobFilter::completed_for_workflow(job.workflow_id))
            .await?;
        Ok(completed.first().and_then(|j| j.assigned_robot_id))
    }

    /// Record an accepted assignment in the registry's view.
    pub async fn reserve(&self, robot_id: Uuid, job_id: Uuid) -> Result<()> {
        let lock = self.robot_lock(robot_id);
        let _guard = lock.lock().await;

        let robot = self.store.get_robot(robot_id).await?;
        let mut jobs = robot.current_job_ids.clone();
        if !jobs.contains(&job_id) {
            jobs.push(job_id);
        }
        self.store
            .update_robot_assignments(robot_id, &jobs, true)
            .await
    }

    /// Drop a finished assignment from the registry's view and signal the
    /// freed capacity.
    pub async fn release(&self, robot_id: Uuid, job_id: Uuid) -> Result<()> {
        let lock = self.robot_lock(robot_id);
        let _guard = lock.lock().await;

        let robot = self.store.get_robot(robot_id).await?;
        let jobs: Vec<Uuid> = robot
            .current_job_ids
            .iter()
            .copied()
            .filter(|&id| id != job_id)
            .collect();
        self.store
            .update_robot_assignments(robot_id, &jobs, false)
            .await?;
        self.idle_signal.notify_waiters();
        self.idle_signal.notify_one();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Liveness sweep
    // ------------------------------------------------------------------

    /// Mark silent robots Offline and requeue their in-flight jobs. Per
    /// robot the order is: offline -> session torn down -> requeue; a
    /// reconnect in between sees Offline and must re-register.
    pub async fn run_liveness_sweep(&self) -> Result<Vec<Uuid>> {
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let threshold = Utc::now() - timeout;
        let stale = self.store.mark_stale_robots(threshold).await?;

        for &robot_id in &stale {
            let lock = self.robot_lock(robot_id);
            let _guard = lock.lock().await;

            warn!(robot_id = %robot_id, "robot went silent, marking offline");
            self.sessions.disconnect(robot_id);

            let summary = self.store.requeue_jobs_of_robot(robot_id).await?;
            if !summary.is_empty() {
                info!(
                    robot_id = %robot_id,
                    requeued = summary.requeued.len(),
                    exhausted = summary.exhausted.len(),
                    "in-flight jobs recovered from lost robot"
                );
            }
            self.store
                .update_robot_assignments(robot_id, &[], false)
                .await?;
            self.queue.publish_requeue_summary(robot_id, &summary).await;

            self.audit(
                AuditEntry::new(AuditAction::RobotOffline)
                    .robot(robot_id)
                    .detail(serde_json::json!({
                        "requeued": summary.requeued.len(),
                        "exhausted": summary.exhausted.len(),
                    })),
            )
            .await;
            self.events.publish(Event::RobotOffline { robot_id });
        }
        Ok(stale)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Put a robot into (or take it out of) draining: running jobs finish,
    /// nothing new is assigned.
    pub async fn set_draining(&self, robot_id: Uuid, draining: bool) -> Result<()> {
        let lock = self.robot_lock(robot_id);
        let _guard = lock.lock().await;

        let robot = self.store.get_robot(robot_id).await?;
        if robot.status == RobotStatus::Offline {
            return Err(CoreError::invalid("cannot drain an offline robot"));
        }
        let status = if draining {
            RobotStatus::Draining
        } else if robot.current_job_ids.is_empty() {
            RobotStatus::Idle
        } else {
            RobotStatus::Busy
        };
        self.store.update_robot_status(robot_id, status).await?;

        info!(robot_id = %robot_id, draining, "robot drain state changed");
        if draining {
            self.audit(AuditEntry::new(AuditAction::RobotDraining).robot(robot_id))
                .await;
        } else {
            self.idle_signal.notify_waiters();
            self.idle_signal.notify_one();
        }
        self.events.publish(Event::RobotStatus {
            robot_id,
            status,
            current_job_count: robot.current_job_ids.len(),
        });
        Ok(())
    }

    pub async fn decommission(&self, robot_id: Uuid) -> Result<()> {
        let lock = self.robot_lock(robot_id);
        let _guard = lock.lock().await;
        self.store.set_robot_decommissioned(robot_id, true).await?;
        self.sessions.disconnect(robot_id);
        info!(robot_id = %robot_id, "robot decommissioned");
        Ok(())
    }
}

fn pick_least_loaded(eligible: &[Robot]) -> Option<Robot> {
    eligible
        .iter()
        .min_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                // Oldest assignment (None = never) goes first for fairness.
                .then_with(|| a.last_assignment_at.cmp(&b.last_assignment_at))
        })
        .cloned()
}
