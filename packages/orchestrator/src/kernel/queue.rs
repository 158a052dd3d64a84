//! Job queue manager: the authoritative state machine for jobs.
//!
//! Every transition is a conditional update against the store; this module
//! holds no locks and keeps no state of its own beyond the pending-work
//! signal that wakes the dispatcher. Lost races surface as
//! `StaleTransition` and are recovered here with a bounded re-read loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{CoreError, ErrorKind, JobError, Result};
use crate::kernel::backoff::retry_decision;
use crate::kernel::events::{Event, EventHub};
use crate::kernel::model::job::{
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS, PRIORITY_MAX, PRIORITY_MIN,
};
use crate::kernel::model::{AuditAction, AuditEntry, Job, JobState, TriggerContext};
use crate::kernel::session::SessionManager;
use crate::kernel::store::{JobUpdate, RequeueSummary, Store};

/// How many times a lost `StaleTransition` race is retried in place.
const STALE_RETRY_LIMIT: usize = 3;

/// Payload limits enforced at submission.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_nodes: 1000,
        }
    }
}

/// Submission options; everything beyond the payload is optional.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubmitOptions {
    #[builder(default = crate::kernel::model::job::PRIORITY_DEFAULT)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub environment: String,
    #[builder(default)]
    pub required_capabilities: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub target_robot_id: Option<Uuid>,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default = DEFAULT_TIMEOUT_SECONDS)]
    pub timeout_seconds: i64,
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub trigger_context: Option<TriggerContext>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Result of a submit that handles idempotency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new job row was created.
    Created(Uuid),
    /// Dedup hit: the existing non-terminal job.
    Duplicate(Uuid),
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SubmitOutcome::Created(_))
    }
}

pub struct JobQueue {
    store: Arc<dyn Store>,
    events: Arc<EventHub>,
    sessions: Arc<SessionManager>,
    limits: PayloadLimits,
    cancel_ack_timeout: Duration,
    pending: Notify,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventHub>,
        sessions: Arc<SessionManager>,
        limits: PayloadLimits,
        cancel_ack_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            sessions,
            limits,
            cancel_ack_timeout,
            pending: Notify::new(),
        }
    }

    /// The dispatcher parks on this; submit/requeue/replay wake it.
    pub fn pending_signal(&self) -> &Notify {
        &self.pending
    }

    fn notify_pending(&self) {
        self.pending.notify_waiters();
        self.pending.notify_one();
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(error = %e, "audit append failed");
        }
        self.events.publish(Event::Activity { entry });
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Validate, dedup and persist a new job.
    pub async fn submit(
        &self,
        workflow_id: Uuid,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome> {
        self.validate_payload(&payload)?;
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&options.priority) {
            return Err(CoreError::invalid(format!(
                "priority {} outside {PRIORITY_MIN}..={PRIORITY_MAX}",
                options.priority
            )));
        }
        if options.max_retries < 0 {
            return Err(CoreError::invalid("max_retries must be non-negative"));
        }
        if options.timeout_seconds <= 0 {
            return Err(CoreError::invalid("timeout_seconds must be positive"));
        }

        if let Some(key) = &options.dedup_key {
            if let Some(existing) = self.store.find_active_by_dedup_key(key).await? {
                debug!(job_id = %existing.id, dedup_key = %key, "dedup hit");
                return Ok(SubmitOutcome::Duplicate(existing.id));
            }
        }

        let trigger_context = options
            .trigger_context
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let mut job = Job::builder()
            .workflow_id(workflow_id)
            .payload(payload)
            .priority(options.priority)
            .environment(options.environment)
            .required_capabilities(options.required_capabilities)
            .max_retries(options.max_retries)
            .timeout_seconds(options.timeout_seconds)
            .build();
        job.target_robot_id = options.target_robot_id;
        job.dedup_key = options.dedup_key.clone();
        job.trigger_context = trigger_context;

        match self.store.insert_job(&job).await {
            Ok(()) => {}
            // The partial unique index on dedup_key catches the race
            // between two concurrent submits with the same key.
            Err(CoreError::Invalid(_)) if options.dedup_key.is_some() => {
                let key = options.dedup_key.as_deref().expect("checked");
                if let Some(existing) = self.store.find_active_by_dedup_key(key).await? {
                    return Ok(SubmitOutcome::Duplicate(existing.id));
                }
                return Err(CoreError::Transient(
                    "dedup race lost and winner vanished; retry the submit".into(),
                ));
            }
            Err(e) => return Err(e),
        }

        info!(job_id = %job.id, workflow_id = %workflow_id, priority = job.priority, "job queued");
        self.audit(
            AuditEntry::new(AuditAction::JobSubmitted)
                .job(job.id)
                .detail(serde_json::json!({"priority": job.priority})),
        )
        .await;
        self.events.publish(Event::JobQueued {
            job_id: job.id,
            workflow_id,
            priority: job.priority,
        });
        self.notify_pending();

        Ok(SubmitOutcome::Created(job.id))
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let size = serde_json::to_vec(payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if size > self.limits.max_bytes {
            return Err(CoreError::TooLarge {
                size,
                limit: self.limits.max_bytes,
            });
        }
        let nodes = payload
            .get("nodes")
            .and_then(|n| n.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        if nodes > self.limits.max_nodes {
            return Err(CoreError::invalid(format!(
                "workflow has {nodes} nodes (limit {})",
                self.limits.max_nodes
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel a job. Pending jobs cancel immediately; in-flight jobs move
    /// to `Cancelling` and a cancel frame goes to the assigned worker; the
    /// cancel sweep forces the terminal state if the worker never acks.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobState> {
        for _ in 0..STALE_RETRY_LIMIT {
            let job = self.store.get_job(job_id).await?;
            match job.state {
                JobState::Pending => {
                    match self
                        .store
                        .update_job_state(
                            job_id,
                            JobState::Pending,
                            JobUpdate::to(JobState::Cancelled)
                                .completed_now()
                                .error(JobError::new(ErrorKind::Cancelled, "cancelled by user")),
                        )
                        .await
                    {
                        Ok(_) => {
                            info!(job_id = %job_id, "pending job cancelled");
                            self.audit(AuditEntry::new(AuditAction::JobCancelled).job(job_id))
                                .await;
                            self.events.publish(Event::JobCancelled { job_id });
                            return Ok(JobState::Cancelled);
                        }
                        Err(CoreError::StaleTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobState::Assigned | JobState::Running => {
                    let robot_id = job.assigned_robot_id.ok_or_else(|| {
                        CoreError::Fatal(format!("in-flight job {job_id} has no assigned robot"))
                    })?;
                    match self
                        .store
                        .update_job_state(job_id, job.state, JobUpdate::to(JobState::Cancelling))
                        .await
                    {
                        Ok(_) => {
                            if let Err(e) = self.sessions.send_cancel(robot_id, job_id).await {
                                // Worker already gone; the liveness sweep
                                // will requeue or the cancel sweep will
                                // finish the job.
                                warn!(job_id = %job_id, robot_id = %robot_id, error = %e,
                                      "cancel frame undeliverable");
                            }
                            info!(job_id = %job_id, robot_id = %robot_id, "cancel sent");
                            self.audit(
                                AuditEntry::new(AuditAction::JobCancelled)
                                    .job(job_id)
                                    .robot(robot_id)
                                    .detail(serde_json::json!({"phase": "requested"})),
                            )
                            .await;
                            return Ok(JobState::Cancelling);
                        }
                        Err(CoreError::StaleTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobState::Cancelling => return Ok(JobState::Cancelling),
                terminal => {
                    return Err(CoreError::invalid(format!(
                        "job {job_id} is already {}",
                        terminal.as_str()
                    )))
                }
            }
        }
        Err(CoreError::StaleTransition { job_id })
    }

    // ------------------------------------------------------------------
    // Worker-reported transitions
    // ------------------------------------------------------------------

    fn verify_assignment(job: &Job, robot_id: Uuid) -> Result<()> {
        if job.assigned_robot_id != Some(robot_id) {
            return Err(CoreError::invalid(format!(
                "robot {robot_id} does not hold job {}",
                job.id
            )));
        }
        Ok(())
    }

    /// `Assigned -> Running` once the worker confirms it started.
    pub async fn mark_running(&self, job_id: Uuid, robot_id: Uuid) -> Result<()> {
        let job = self.store.get_job(job_id).await?;
        Self::verify_assignment(&job, robot_id)?;
        self.store
            .update_job_state(
                job_id,
                JobState::Assigned,
                JobUpdate::to(JobState::Running).started_now(),
            )
            .await?;
        debug!(job_id = %job_id, robot_id = %robot_id, "job running");
        self.audit(
            AuditEntry::new(AuditAction::JobStarted)
                .job(job_id)
                .robot(robot_id),
        )
        .await;
        self.events.publish(Event::JobStarted { job_id, robot_id });
        Ok(())
    }

    /// Progress is fan-out only; nothing durable. Rejected when the robot
    /// does not hold the assignment.
    pub async fn report_progress(
        &self,
        job_id: Uuid,
        robot_id: Uuid,
        percent: f64,
        node_id: Option<String>,
        message: Option<String>,
    ) -> Result<()> {
        let job = self.store.get_job(job_id).await?;
        Self::verify_assignment(&job, robot_id)?;
        self.events.publish(Event::JobProgress {
            job_id,
            robot_id,
            percent,
            node_id,
            message,
        });
        Ok(())
    }

    /// Terminal success. A worker may finish a job we are trying to
    /// cancel; that still counts as completed.
    pub async fn complete(
        &self,
        job_id: Uuid,
        robot_id: Uuid,
        result: serde_json::Value,
    ) -> Result<()> {
        for _ in 0..STALE_RETRY_LIMIT {
            let job = self.store.get_job(job_id).await?;
            Self::verify_assignment(&job, robot_id)?;
            let from = match job.state {
                JobState::Running | JobState::Cancelling => job.state,
                JobState::Assigned => {
                    // Worker skipped the explicit running report.
                    self.mark_running(job_id, robot_id).await.ok();
                    continue;
                }
                other => {
                    return Err(CoreError::invalid(format!(
                        "cannot complete job {job_id} from {}",
                        other.as_str()
                    )))
                }
            };
            match self
                .store
                .update_job_state(
                    job_id,
                    from,
                    JobUpdate::to(JobState::Completed)
                        .completed_now()
                        .result(result.clone()),
                )
                .await
            {
                Ok(_) => {
                    info!(job_id = %job_id, robot_id = %robot_id, "job completed");
                    self.audit(
                        AuditEntry::new(AuditAction::JobCompleted)
                            .job(job_id)
                            .robot(robot_id),
                    )
                    .await;
                    self.events.publish(Event::JobCompleted { job_id });
                    return Ok(());
                }
                Err(CoreError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::StaleTransition { job_id })
    }

    /// Terminal failure, fed through the retry pipeline.
    pub async fn fail(&self, job_id: Uuid, robot_id: Uuid, error: JobError) -> Result<()> {
        for _ in 0..STALE_RETRY_LIMIT {
            let job = self.store.get_job(job_id).await?;
            Self::verify_assignment(&job, robot_id)?;

            // A worker acking a cancel reports Cancelled.
            if job.state == JobState::Cancelling {
                match self
                    .store
                    .update_job_state(
                        job_id,
                        JobState::Cancelling,
                        JobUpdate::to(JobState::Cancelled)
                            .completed_now()
                            .error(error.clone()),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(job_id = %job_id, "cancel acknowledged");
                        self.audit(
                            AuditEntry::new(AuditAction::JobCancelled)
                                .job(job_id)
                                .robot(robot_id)
                                .detail(serde_json::json!({"phase": "acknowledged"})),
                        )
                        .await;
                        self.events.publish(Event::JobCancelled { job_id });
                        return Ok(());
                    }
                    Err(CoreError::StaleTransition { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            let from = match job.state {
                JobState::Running | JobState::Assigned => job.state,
                other => {
                    return Err(CoreError::invalid(format!(
                        "cannot fail job {job_id} from {}",
                        other.as_str()
                    )))
                }
            };

            let decision = retry_decision(job.retry_count, job.max_retries, error.kind);
            let outcome = if decision.should_retry {
                let next_attempt = Utc::now() + chrono::Duration::from_std(decision.delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                self.store
                    .update_job_state(
                        job_id,
                        from,
                        JobUpdate::to(JobState::Pending)
                            .clear_assignment()
                            .retry_count(job.retry_count + 1)
                            .next_attempt_at(Some(next_attempt))
                            .error(error.clone()),
                    )
                    .await
                    .map(|_| true)
            } else {
                self.store
                    .update_job_state(
                        job_id,
                        from,
                        JobUpdate::to(JobState::Failed)
                            .completed_now()
                            .error(error.clone()),
                    )
                    .await
                    .map(|_| false)
            };

            match outcome {
                Ok(true) => {
                    let retry_count = job.retry_count + 1;
                    warn!(job_id = %job_id, retry_count, error = %error.message, "job failed, retrying");
                    self.audit(
                        AuditEntry::new(AuditAction::JobRequeued)
                            .job(job_id)
                            .robot(robot_id)
                            .detail(serde_json::json!({
                                "retry_count": retry_count,
                                "error_kind": error.kind.as_str(),
                            })),
                    )
                    .await;
                    self.events.publish(Event::JobFailed {
                        job_id,
                        error,
                        will_retry: true,
                    });
                    self.events.publish(Event::JobRequeued {
                        job_id,
                        retry_count,
                    });
                    self.notify_pending();
                    return Ok(());
                }
                Ok(false) => {
                    warn!(job_id = %job_id, error = %error.message, "job failed terminally");
                    self.audit(
                        AuditEntry::new(AuditAction::JobFailed)
                            .job(job_id)
                            .robot(robot_id)
                            .detail(serde_json::json!({"error_kind": error.kind.as_str()})),
                    )
                    .await;
                    self.events.publish(Event::JobFailed {
                        job_id,
                        error: error.clone(),
                        will_retry: false,
                    });
                    if job.retry_count >= job.max_retries && error.kind.retries_job() {
                        self.dead_letter(job_id, "max retries exhausted").await?;
                    }
                    return Ok(());
                }
                Err(CoreError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::StaleTransition { job_id })
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<()> {
        self.store
            .update_job_state(
                job_id,
                JobState::Failed,
                JobUpdate::to(JobState::DeadLetter).dead_lettered(reason),
            )
            .await?;
        warn!(job_id = %job_id, reason, "job dead-lettered");
        self.audit(
            AuditEntry::new(AuditAction::JobDeadLettered)
                .job(job_id)
                .detail(serde_json::json!({"reason": reason})),
        )
        .await;
        self.events.publish(Event::JobDeadLettered { job_id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatcher support
    // ------------------------------------------------------------------

    /// Revert a claim that could not be delivered (worker refused or never
    /// acked). The retry budget is untouched; this was never the worker's
    /// failure to execute.
    pub async fn requeue_undelivered(&self, job_id: Uuid, reason: &str) -> Result<()> {
        self.store
            .update_job_state(
                job_id,
                JobState::Assigned,
                JobUpdate::to(JobState::Pending).clear_assignment(),
            )
            .await?;
        debug!(job_id = %job_id, reason, "assignment reverted");
        self.audit(
            AuditEntry::new(AuditAction::JobRequeued)
                .job(job_id)
                .detail(serde_json::json!({"reason": reason})),
        )
        .await;
        self.notify_pending();
        Ok(())
    }

    /// Audit/fan-out for a store-level requeue (robot lost). The exhausted
    /// jobs stay `Failed(WorkerLost)`.
    pub async fn publish_requeue_summary(&self, robot_id: Uuid, summary: &RequeueSummary) {
        for &job_id in &summary.requeued {
            self.audit(
                AuditEntry::new(AuditAction::JobRequeued)
                    .job(job_id)
                    .robot(robot_id)
                    .detail(serde_json::json!({"reason": "worker_lost"})),
            )
            .await;
            if let Ok(job) = self.store.get_job(job_id).await {
                self.events.publish(Event::JobRequeued {
                    job_id,
                    retry_count: job.retry_count,
                });
            }
        }
        for &job_id in &summary.exhausted {
            self.audit(
                AuditEntry::new(AuditAction::JobFailed)
                    .job(job_id)
                    .robot(robot_id)
                    .detail(serde_json::json!({"error_kind": "worker_lost"})),
            )
            .await;
            self.events.publish(Event::JobFailed {
                job_id,
                error: JobError::worker_lost(robot_id),
                will_retry: false,
            });
        }
        if !summary.requeued.is_empty() {
            self.notify_pending();
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Mark overdue running jobs timed out, cancel them on the worker and
    /// feed them through the retry pipeline. Returns how many were acted
    /// on.
    pub async fn run_timeout_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let overdue = self.store.running_jobs_overdue(now).await?;
        let mut swept = 0;

        for job in overdue {
            let error = JobError::timed_out(job.timeout_seconds);
            let timed_out = self
                .store
                .update_job_state(
                    job.id,
                    JobState::Running,
                    JobUpdate::to(JobState::TimedOut)
                        .completed_now()
                        .error(error.clone()),
                )
                .await;
            match timed_out {
                Ok(_) => {}
                // Lost to a concurrent completion/cancel; skip.
                Err(CoreError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
            swept += 1;

            warn!(job_id = %job.id, timeout_seconds = job.timeout_seconds, "job timed out");
            if let Some(robot_id) = job.assigned_robot_id {
                if let Err(e) = self.sessions.send_cancel(robot_id, job.id).await {
                    debug!(job_id = %job.id, error = %e, "timeout cancel undeliverable");
                }
            }
            self.audit(AuditEntry::new(AuditAction::JobTimedOut).job(job.id))
                .await;
            self.events.publish(Event::JobTimedOut { job_id: job.id });

            let decision = retry_decision(job.retry_count, job.max_retries, ErrorKind::Timeout);
            if decision.should_retry {
                let next_attempt = Utc::now() + chrono::Duration::from_std(decision.delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                self.store
                    .update_job_state(
                        job.id,
                        JobState::TimedOut,
                        JobUpdate::to(JobState::Pending)
                            .clear_assignment()
                            .retry_count(job.retry_count + 1)
                            .next_attempt_at(Some(next_attempt)),
                    )
                    .await?;
                self.audit(
                    AuditEntry::new(AuditAction::JobRequeued)
                        .job(job.id)
                        .detail(serde_json::json!({"reason": "timeout"})),
                )
                .await;
                self.events.publish(Event::JobRequeued {
                    job_id: job.id,
                    retry_count: job.retry_count + 1,
                });
                self.notify_pending();
            } else {
                self.store
                    .update_job_state(
                        job.id,
                        JobState::TimedOut,
                        JobUpdate::to(JobState::DeadLetter)
                            .dead_lettered("timed out with retries exhausted"),
                    )
                    .await?;
                self.audit(AuditEntry::new(AuditAction::JobDeadLettered).job(job.id))
                    .await;
                self.events.publish(Event::JobDeadLettered { job_id: job.id });
            }
        }
        Ok(swept)
    }

    /// Force-cancel jobs whose worker never acknowledged the cancel within
    /// the deadline.
    pub async fn run_cancel_sweep(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.cancel_ack_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let stuck = self.store.cancelling_jobs_older_than(cutoff).await?;
        let mut swept = 0;

        for job in stuck {
            let forced = self
                .store
                .update_job_state(
                    job.id,
                    JobState::Cancelling,
                    JobUpdate::to(JobState::Cancelled)
                        .completed_now()
                        .error(JobError::new(
                            ErrorKind::Cancelled,
                            "cancel unacknowledged; forced",
                        )),
                )
                .await;
            match forced {
                Ok(_) => {
                    swept += 1;
                    warn!(job_id = %job.id, "cancel deadline expired, forcing cancelled");
                    self.audit(
                        AuditEntry::new(AuditAction::JobCancelled)
                            .job(job.id)
                            .detail(serde_json::json!({"phase": "forced"})),
                    )
                    .await;
                    self.events.publish(Event::JobCancelled { job_id: job.id });
                }
                Err(CoreError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }

    // ------------------------------------------------------------------
    // Dead letter replay
    // ------------------------------------------------------------------

    /// Resubmit a dead-lettered job with a fresh retry budget.
    pub async fn replay(&self, job_id: Uuid) -> Result<()> {
        let job = self.store.get_job(job_id).await?;
        if job.state != JobState::DeadLetter {
            return Err(CoreError::invalid(format!(
                "job {job_id} is {}; only dead-letter jobs can be replayed",
                job.state.as_str()
            )));
        }
        self.store
            .update_job_state(
                job_id,
                JobState::DeadLetter,
                JobUpdate::to(JobState::Pending)
                    .clear_assignment()
                    .retry_count(0)
                    .next_attempt_at(None)
                    .replayed(),
            )
            .await?;
        info!(job_id = %job_id, "dead-letter job replayed");
        self.audit(AuditEntry::new(AuditAction::JobReplayed).job(job_id))
            .await;
        self.events.publish(Event::JobQueued {
            job_id,
            workflow_id: job.workflow_id,
            priority: job.priority,
        });
        self.notify_pending();
        Ok(())
    }

    /// Periodic queue-depth gauge for the metrics topic.
    pub async fn publish_queue_depth(&self, robots_online: i64) -> Result<()> {
        let counts = self.store.count_jobs().await?;
        self.events.publish(Event::QueueDepth {
            pending: counts.pending,
            in_flight: counts.in_flight(),
            dead_letter: counts.dead_letter,
            robots_online,
        });
        Ok(())
    }
}
