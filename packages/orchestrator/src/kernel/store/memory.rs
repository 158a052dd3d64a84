//! In-memory store.
//!
//! Backs the test suite and any single-process deployment that can afford
//! to lose state on restart. One mutex guards everything, which makes the
//! claim and the schedule CAS trivially atomic; the Postgres store provides
//! the same guarantees with row locking.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{JobFilter, JobUpdate, QueueCounts, RequeueSummary, Store};
use crate::common::{CoreError, JobError, Result};
use crate::kernel::model::{
    AuditEntry, Heartbeat, Job, JobState, Robot, RobotApiKey, RobotStatus, Schedule,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    robots: HashMap<Uuid, Robot>,
    robot_keys: Vec<RobotApiKey>,
    schedules: HashMap<Uuid, Schedule>,
    heartbeats: Vec<Heartbeat>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Apply an update's field set to a job row in place.
fn apply_update(job: &mut Job, update: &JobUpdate) {
    job.state = update.to_state;
    if let Some(assignment) = update.assigned_robot_id {
        job.assigned_robot_id = assignment;
    }
    if let Some(at) = update.claimed_at {
        job.claimed_at = Some(at);
    }
    if let Some(at) = update.started_at {
        job.started_at = Some(at);
    }
    if let Some(at) = update.completed_at {
        job.completed_at = Some(at);
    }
    if let Some(result) = &update.result {
        job.result = Some(result.clone());
    }
    if let Some(error) = &update.error {
        job.error_kind = Some(error.kind);
        job.error_message = Some(error.message.clone());
        job.error_stack = error.stack.clone();
    }
    if let Some(count) = update.retry_count {
        job.retry_count = count;
    }
    if let Some(at) = update.next_attempt_at {
        job.next_attempt_at = at;
    }
    if let Some(reason) = &update.dead_letter_reason {
        job.dead_lettered_at = Some(Utc::now());
        job.dead_letter_reason = Some(reason.clone());
    }
    if update.bump_replay_count {
        job.replay_count += 1;
    }
    job.updated_at = Utc::now();
}

#[async_trait]
impl Store for MemoryStore {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(CoreError::Duplicate {
                entity: "job",
                id: job.id,
            });
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(CoreError::not_found("job", job_id))
    }

    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .find(|j| j.dedup_key.as_deref() == Some(key) && !j.state.is_terminal())
            .cloned())
    }

    async fn claim_one_pending(
        &self,
        robot_id: Uuid,
        capabilities: &[String],
        environment: &str,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.lock();

        let candidate = inner
            .jobs
            .values()
            .filter(|j| {
                j.is_claimable_at(now)
                    && j.environment == environment
                    && j.pin_allows(robot_id)
                    && j.required_capabilities
                        .iter()
                        .all(|c| capabilities.contains(c))
            })
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&job_id).expect("candidate exists");
        job.state = JobState::Assigned;
        job.assigned_robot_id = Some(robot_id);
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn peek_pending(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_claimable_at(now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .cloned())
    }

    async fn update_job_state(
        &self,
        job_id: Uuid,
        from: JobState,
        update: JobUpdate,
    ) -> Result<Job> {
        if !from.can_transition_to(update.to_state) {
            return Err(CoreError::invalid(format!(
                "illegal transition {} -> {}",
                from.as_str(),
                update.to_state.as_str()
            )));
        }

        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(CoreError::not_found("job", job_id))?;
        if job.state != from {
            return Err(CoreError::StaleTransition { job_id });
        }
        apply_update(job, &update);
        Ok(job.clone())
    }

    async fn requeue_jobs_of_robot(&self, robot_id: Uuid) -> Result<RequeueSummary> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut summary = RequeueSummary::default();

        for job in inner.jobs.values_mut() {
            if job.assigned_robot_id != Some(robot_id) || !job.state.is_in_flight() {
                continue;
            }
            if job.retries_remaining() {
                job.state = JobState::Pending;
                job.assigned_robot_id = None;
                job.claimed_at = None;
                job.started_at = None;
                job.retry_count += 1;
                job.next_attempt_at = None;
                job.updated_at = now;
                summary.requeued.push(job.id);
            } else {
                let error = JobError::worker_lost(robot_id);
                job.state = JobState::Failed;
                job.error_kind = Some(error.kind);
                job.error_message = Some(error.message);
                job.completed_at = Some(now);
                job.updated_at = now;
                summary.exhausted.push(job.id);
            }
        }
        Ok(summary)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.state.map(|s| j.state == s).unwrap_or(true))
            .filter(|j| {
                filter
                    .workflow_id
                    .map(|w| j.workflow_id == w)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            jobs.truncate(filter.limit as usize);
        }
        Ok(jobs)
    }

    async fn running_jobs_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Running
                    && j.started_at
                        .map(|at| now - at > chrono::Duration::seconds(j.timeout_seconds))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn cancelling_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Cancelling && j.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn count_jobs(&self) -> Result<QueueCounts> {
        let inner = self.lock();
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Assigned => counts.assigned += 1,
                JobState::Running => counts.running += 1,
                JobState::Cancelling => counts.cancelling += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
                JobState::TimedOut => counts.timed_out += 1,
                JobState::DeadLetter => counts.dead_letter += 1,
            }
        }
        Ok(counts)
    }

    async fn count_active_for_schedule(&self, schedule_id: Uuid) -> Result<i64> {
        let key = schedule_id.to_string();
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .filter(|j| {
                j.trigger_context
                    .as_ref()
                    .and_then(|c| c.get("schedule_id"))
                    .and_then(|v| v.as_str())
                    == Some(key.as_str())
            })
            .count() as i64)
    }

    // ------------------------------------------------------------------
    // Robots
    // ------------------------------------------------------------------

    async fn upsert_robot(&self, robot: &Robot) -> Result<Robot> {
        let mut inner = self.lock();
        let mut stored = robot.clone();
        if let Some(existing) = inner.robots.get(&robot.id) {
            stored.registered_at = existing.registered_at;
        }
        stored.updated_at = Utc::now();
        inner.robots.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_robot(&self, robot_id: Uuid) -> Result<Robot> {
        self.lock()
            .robots
            .get(&robot_id)
            .cloned()
            .ok_or(CoreError::not_found("robot", robot_id))
    }

    async fn list_robots(&self) -> Result<Vec<Robot>> {
        let mut robots: Vec<Robot> = self.lock().robots.values().cloned().collect();
        robots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(robots)
    }

    async fn update_robot_status(&self, robot_id: Uuid, status: RobotStatus) -> Result<()> {
        let mut inner = self.lock();
        let robot = inner
            .robots
            .get_mut(&robot_id)
            .ok_or(CoreError::not_found("robot", robot_id))?;
        robot.status = status;
        robot.updated_at = Utc::now();
        Ok(())
    }

    async fn update_robot_assignments(
        &self,
        robot_id: Uuid,
        current_job_ids: &[Uuid],
        stamp_assignment: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        let robot = inner
            .robots
            .get_mut(&robot_id)
            .ok_or(CoreError::not_found("robot", robot_id))?;
        robot.current_job_ids = current_job_ids.to_vec();
        if stamp_assignment {
            robot.last_assignment_at = Some(Utc::now());
        }
        if matches!(robot.status, RobotStatus::Idle | RobotStatus::Busy) {
            robot.status = if current_job_ids.is_empty() {
                RobotStatus::Idle
            } else {
                RobotStatus::Busy
            };
        }
        robot.updated_at = Utc::now();
        Ok(())
    }

    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let mut inner = self.lock();
        if let Some(robot) = inner.robots.get_mut(&heartbeat.robot_id) {
            robot.last_heartbeat_at = Some(heartbeat.at);
        }
        inner.heartbeats.push(heartbeat.clone());
        Ok(())
    }

    async fn mark_stale_robots(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut inner = self.lock();
        let mut stale = Vec::new();
        for robot in inner.robots.values_mut() {
            if !robot.status.is_online() {
                continue;
            }
            let is_stale = robot
                .last_heartbeat_at
                .map(|at| at < threshold)
                .unwrap_or(true);
            if is_stale {
                robot.status = RobotStatus::Offline;
                robot.updated_at = Utc::now();
                stale.push(robot.id);
            }
        }
        Ok(stale)
    }

    async fn set_robot_decommissioned(&self, robot_id: Uuid, decommissioned: bool) -> Result<()> {
        let mut inner = self.lock();
        let robot = inner
            .robots
            .get_mut(&robot_id)
            .ok_or(CoreError::not_found("robot", robot_id))?;
        robot.decommissioned = decommissioned;
        robot.updated_at = Utc::now();
        Ok(())
    }

    async fn prune_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.heartbeats.len();
        inner.heartbeats.retain(|hb| hb.at >= older_than);
        Ok((before - inner.heartbeats.len()) as u64)
    }

    // ------------------------------------------------------------------
    // Robot API keys
    // ------------------------------------------------------------------

    async fn find_robot_key(&self, fingerprint: &str) -> Result<Option<RobotApiKey>> {
        Ok(self
            .lock()
            .robot_keys
            .iter()
            .find(|k| k.token_fingerprint == fingerprint)
            .cloned())
    }

    async fn insert_robot_key(&self, key: &RobotApiKey) -> Result<()> {
        self.lock().robot_keys.push(key.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut inner = self.lock();
        if inner.schedules.contains_key(&schedule.id) {
            return Err(CoreError::Duplicate {
                entity: "schedule",
                id: schedule.id,
            });
        }
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule> {
        self.lock()
            .schedules
            .get(&schedule_id)
            .cloned()
            .ok_or(CoreError::not_found("schedule", schedule_id))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self.lock().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<()> {
        self.lock()
            .schedules
            .remove(&schedule_id)
            .map(|_| ())
            .ok_or(CoreError::not_found("schedule", schedule_id))
    }

    async fn set_schedule_enabled(
        &self,
        schedule_id: Uuid,
        enabled: bool,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        let mut inner = self.lock();
        let schedule = inner
            .schedules
            .get_mut(&schedule_id)
            .ok_or(CoreError::not_found("schedule", schedule_id))?;
        schedule.enabled = enabled;
        schedule.next_fire_at = next_fire_at;
        schedule.updated_at = Utc::now();
        Ok(schedule.clone())
    }

    async fn schedule_lookup_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        Ok(self
            .lock()
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_fire_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        observed_next_fire_at: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let schedule = inner
            .schedules
            .get_mut(&schedule_id)
            .ok_or(CoreError::not_found("schedule", schedule_id))?;
        if schedule.next_fire_at != observed_next_fire_at {
            return Ok(false);
        }
        schedule.next_fire_at = next_fire_at;
        schedule.last_fire_at = Some(fired_at);
        schedule.run_count += 1;
        schedule.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_schedule_failure(&self, schedule_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let schedule = inner
            .schedules
            .get_mut(&schedule_id)
            .ok_or(CoreError::not_found("schedule", schedule_id))?;
        schedule.failure_count += 1;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>> {
        let inner = self.lock();
        let mut entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .filter(|e| before.map(|b| e.at < b).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        if limit > 0 {
            entries.truncate(limit as usize);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use crate::kernel::model::job::PRIORITY_DEFAULT;

    fn job(priority: i16) -> Job {
        Job::builder()
            .workflow_id(Uuid::new_v4())
            .payload(serde_json::json!({}))
            .priority(priority)
            .build()
    }

    fn robot() -> Robot {
        Robot::builder().name("r1").status(RobotStatus::Idle).build()
    }

    #[tokio::test]
    async fn insert_twice_is_duplicate() {
        let store = MemoryStore::new();
        let j = job(PRIORITY_DEFAULT);
        store.insert_job(&j).await.unwrap();
        let err = store.insert_job(&j).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn claim_prefers_lower_priority_value() {
        let store = MemoryStore::new();
        let lo = job(15);
        let hi = job(1);
        store.insert_job(&lo).await.unwrap();
        store.insert_job(&hi).await.unwrap();

        let r = robot();
        let claimed = store
            .claim_one_pending(r.id, &[], "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, hi.id);
        assert_eq!(claimed.state, JobState::Assigned);
        assert_eq!(claimed.assigned_robot_id, Some(r.id));
        assert!(claimed.claimed_at.is_some());
    }

    #[tokio::test]
    async fn claim_breaks_priority_ties_fifo() {
        let store = MemoryStore::new();
        let mut first = job(5);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = job(5);
        store.insert_job(&second).await.unwrap();
        store.insert_job(&first).await.unwrap();

        let claimed = store
            .claim_one_pending(Uuid::new_v4(), &[], "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn claim_skips_capability_mismatch() {
        let store = MemoryStore::new();
        let mut j = job(5);
        j.required_capabilities = vec!["browser".to_string()];
        store.insert_job(&j).await.unwrap();

        let none = store
            .claim_one_pending(Uuid::new_v4(), &["desktop".to_string()], "default")
            .await
            .unwrap();
        assert!(none.is_none());

        let claimed = store
            .claim_one_pending(Uuid::new_v4(), &["browser".to_string()], "default")
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn claim_respects_target_pin() {
        let store = MemoryStore::new();
        let target = Uuid::new_v4();
        let mut j = job(5);
        j.target_robot_id = Some(target);
        store.insert_job(&j).await.unwrap();

        assert!(store
            .claim_one_pending(Uuid::new_v4(), &[], "default")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_one_pending(target, &[], "default")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn claim_skips_backoff_not_elapsed() {
        let store = MemoryStore::new();
        let mut j = job(5);
        j.next_attempt_at = Some(Utc::now() + chrono::Duration::seconds(60));
        store.insert_job(&j).await.unwrap();

        assert!(store
            .claim_one_pending(Uuid::new_v4(), &[], "default")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn conditional_update_detects_stale_state() {
        let store = MemoryStore::new();
        let j = job(5);
        store.insert_job(&j).await.unwrap();

        let err = store
            .update_job_state(j.id, JobState::Running, JobUpdate::to(JobState::Completed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleTransition);
    }

    #[tokio::test]
    async fn requeue_returns_jobs_with_retries_to_pending() {
        let store = MemoryStore::new();
        let r = robot();
        let mut j = job(5);
        j.state = JobState::Running;
        j.assigned_robot_id = Some(r.id);
        j.started_at = Some(Utc::now());
        store.insert_job(&j).await.unwrap();

        let summary = store.requeue_jobs_of_robot(r.id).await.unwrap();
        assert_eq!(summary.requeued, vec![j.id]);
        assert!(summary.exhausted.is_empty());

        let requeued = store.get_job(j.id).await.unwrap();
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.assigned_robot_id.is_none());
        assert!(requeued.started_at.is_none());
    }

    #[tokio::test]
    async fn requeue_fails_jobs_with_retries_exhausted() {
        let store = MemoryStore::new();
        let r = robot();
        let mut j = job(5);
        j.state = JobState::Running;
        j.assigned_robot_id = Some(r.id);
        j.retry_count = 3;
        j.max_retries = 3;
        store.insert_job(&j).await.unwrap();

        let summary = store.requeue_jobs_of_robot(r.id).await.unwrap();
        assert_eq!(summary.exhausted, vec![j.id]);

        let failed = store.get_job(j.id).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error_kind, Some(ErrorKind::WorkerLost));
    }

    #[tokio::test]
    async fn dedup_lookup_ignores_terminal_jobs() {
        let store = MemoryStore::new();
        let mut done = job(5);
        done.dedup_key = Some("nightly".to_string());
        done.state = JobState::Completed;
        store.insert_job(&done).await.unwrap();

        assert!(store
            .find_active_by_dedup_key("nightly")
            .await
            .unwrap()
            .is_none());

        let mut active = job(5);
        active.dedup_key = Some("nightly".to_string());
        store.insert_job(&active).await.unwrap();
        assert_eq!(
            store
                .find_active_by_dedup_key("nightly")
                .await
                .unwrap()
                .unwrap()
                .id,
            active.id
        );
    }

    #[tokio::test]
    async fn stale_robots_go_offline_once() {
        let store = MemoryStore::new();
        let mut r = robot();
        r.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(600));
        store.upsert_robot(&r).await.unwrap();

        let threshold = Utc::now() - chrono::Duration::seconds(90);
        let stale = store.mark_stale_robots(threshold).await.unwrap();
        assert_eq!(stale, vec![r.id]);

        // Already offline: a second sweep is a no-op.
        let stale = store.mark_stale_robots(threshold).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn assignment_update_flips_idle_busy() {
        let store = MemoryStore::new();
        let r = robot();
        store.upsert_robot(&r).await.unwrap();

        let j = Uuid::new_v4();
        store
            .update_robot_assignments(r.id, &[j], true)
            .await
            .unwrap();
        let busy = store.get_robot(r.id).await.unwrap();
        assert_eq!(busy.status, RobotStatus::Busy);
        assert!(busy.last_assignment_at.is_some());

        store.update_robot_assignments(r.id, &[], false).await.unwrap();
        let idle = store.get_robot(r.id).await.unwrap();
        assert_eq!(idle.status, RobotStatus::Idle);
    }

    #[tokio::test]
    async fn schedule_cas_advances_exactly_once() {
        let store = MemoryStore::new();
        let fire = Utc::now();
        let next = fire + chrono::Duration::minutes(5);
        let mut s = Schedule::builder()
            .workflow_id(Uuid::new_v4())
            .name("every-5")
            .cron_expr("*/5 * * * *".to_string())
            .payload(serde_json::json!({}))
            .build();
        s.next_fire_at = Some(fire);
        store.insert_schedule(&s).await.unwrap();

        let won = store
            .advance_schedule(s.id, Some(fire), fire, Some(next))
            .await
            .unwrap();
        assert!(won);

        // A replica observing the same old value loses the race.
        let won = store
            .advance_schedule(s.id, Some(fire), fire, Some(next))
            .await
            .unwrap();
        assert!(!won);

        let stored = store.get_schedule(s.id).await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_fire_at, Some(fire));
    }

    #[tokio::test]
    async fn heartbeat_prune_drops_old_rows() {
        let store = MemoryStore::new();
        let r = robot();
        store.upsert_robot(&r).await.unwrap();

        let mut old = Heartbeat::new(r.id, RobotStatus::Idle, 0);
        old.at = Utc::now() - chrono::Duration::hours(48);
        store.record_heartbeat(&old).await.unwrap();
        store
            .record_heartbeat(&Heartbeat::new(r.id, RobotStatus::Idle, 0))
            .await
            .unwrap();

        let removed = store
            .prune_heartbeats(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
