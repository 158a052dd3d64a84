//! Schedule engine: materializes cron expressions into job submissions.
//!
//! The per-second sweep pulls due schedules and advances each with a
//! compare-and-swap on `next_fire_at`: whichever instance wins the CAS
//! submits the job; everyone else moves on. The dedup key on the
//! submission is defense in depth on top of that. Fires missed during
//! downtime collapse into a single fire, with the missed count audited.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::model::{AuditAction, AuditEntry, ExecutionMode, Schedule, TriggerContext};
use crate::kernel::queue::{JobQueue, SubmitOptions};
use crate::kernel::store::Store;

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleSpec {
    pub workflow_id: Uuid,
    pub name: String,
    pub cron_expr: String,
    #[builder(default = "UTC".to_string())]
    pub timezone: String,
    pub payload: serde_json::Value,
    #[builder(default = crate::kernel::model::job::PRIORITY_DEFAULT)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub environment: String,
    #[builder(default)]
    pub required_capabilities: Vec<String>,
    #[builder(default)]
    pub execution_mode: ExecutionMode,
}

pub struct ScheduleEngine {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
}

impl ScheduleEngine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    // ------------------------------------------------------------------
    // Schedule management
    // ------------------------------------------------------------------

    pub async fn create(&self, spec: ScheduleSpec) -> Result<Schedule> {
        let schedule = Schedule::builder()
            .workflow_id(spec.workflow_id)
            .name(spec.name)
            .cron_expr(spec.cron_expr)
            .timezone(spec.timezone)
            .payload(spec.payload)
            .priority(spec.priority)
            .environment(spec.environment)
            .required_capabilities(spec.required_capabilities)
            .execution_mode(spec.execution_mode)
            .build();
        schedule.validate()?;

        let mut schedule = schedule;
        schedule.next_fire_at = schedule.next_occurrence(Utc::now())?;
        self.store.insert_schedule(&schedule).await?;
        info!(schedule_id = %schedule.id, name = %schedule.name, cron = %schedule.cron_expr,
              "schedule created");
        Ok(schedule)
    }

    /// Re-enabling recomputes the fire position from now; fires that would
    /// have happened while disabled are gone.
    pub async fn enable(&self, schedule_id: Uuid) -> Result<Schedule> {
        let schedule = self.store.get_schedule(schedule_id).await?;
        let next = schedule.next_occurrence(Utc::now())?;
        self.store
            .set_schedule_enabled(schedule_id, true, next)
            .await
    }

    pub async fn disable(&self, schedule_id: Uuid) -> Result<Schedule> {
        self.store
            .set_schedule_enabled(schedule_id, false, None)
            .await
    }

    pub async fn delete(&self, schedule_id: Uuid) -> Result<()> {
        self.store.delete_schedule(schedule_id).await
    }

    /// Fire a schedule immediately without moving its cron position.
    pub async fn trigger(&self, schedule_id: Uuid) -> Result<Uuid> {
        let schedule = self.store.get_schedule(schedule_id).await?;
        let job_id = self.submit_fire(&schedule, Utc::now(), "trigger").await?;
        Ok(job_id)
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// One sweep pass: fire every due schedule whose CAS we win. Returns
    /// the number of fires submitted.
    pub async fn run_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.schedule_lookup_due(now).await?;
        let mut fired = 0;

        for schedule in due {
            match self.fire_due_schedule(&schedule, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "schedule fire failed");
                    self.store.record_schedule_failure(schedule.id).await.ok();
                }
            }
        }
        Ok(fired)
    }

    async fn fire_due_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool> {
        let next = schedule.next_occurrence(now)?;

        // The CAS on next_fire_at is the single serialization point across
        // instances; losing it means a replica fired this slot.
        let won = self
            .store
            .advance_schedule(schedule.id, schedule.next_fire_at, now, next)
            .await?;
        if !won {
            debug!(schedule_id = %schedule.id, "lost fire race to a replica");
            return Ok(false);
        }

        // Downtime collapses to one fire; record how many were skipped.
        if let Some(due_at) = schedule.next_fire_at {
            let missed = schedule
                .occurrences_between(due_at, now)
                .unwrap_or(0);
            if missed > 0 {
                warn!(schedule_id = %schedule.id, missed, "missed fires collapsed into one");
                self.store
                    .append_audit(
                        &AuditEntry::new(AuditAction::ScheduleMisfired)
                            .schedule(schedule.id)
                            .detail(serde_json::json!({"missed": missed})),
                    )
                    .await
                    .ok();
            }
        }

        if schedule.execution_mode == ExecutionMode::Skip {
            let active = self.store.count_active_for_schedule(schedule.id).await?;
            if active > 0 {
                info!(schedule_id = %schedule.id, active, "fire skipped, previous run still active");
                self.store
                    .append_audit(
                        &AuditEntry::new(AuditAction::ScheduleSkipped)
                            .schedule(schedule.id)
                            .detail(serde_json::json!({"active": active})),
                    )
                    .await
                    .ok();
                return Ok(false);
            }
        }

        self.submit_fire(schedule, now, "schedule").await?;
        Ok(true)
    }

    async fn submit_fire(
        &self,
        schedule: &Schedule,
        fired_at: DateTime<Utc>,
        source: &str,
    ) -> Result<Uuid> {
        // Floor to whole seconds so replicas racing within the same fire
        // window collapse onto one key.
        let dedup_key = format!("{}:{}", schedule.id, fired_at.timestamp());
        let options = SubmitOptions::builder()
            .priority(schedule.priority)
            .environment(schedule.environment.clone())
            .required_capabilities(schedule.required_capabilities.clone())
            .dedup_key(dedup_key)
            .trigger_context(TriggerContext {
                source: source.to_string(),
                actor: None,
                schedule_id: Some(schedule.id),
            })
            .build();

        let outcome = self
            .queue
            .submit(schedule.workflow_id, schedule.payload.clone(), options)
            .await?;
        if outcome.is_created() {
            info!(schedule_id = %schedule.id, job_id = %outcome.job_id(), "schedule fired");
            self.store
                .append_audit(
                    &AuditEntry::new(AuditAction::ScheduleFired)
                        .schedule(schedule.id)
                        .job(outcome.job_id()),
                )
                .await
                .ok();
        } else {
            debug!(schedule_id = %schedule.id, job_id = %outcome.job_id(),
                   "fire deduplicated against existing job");
        }
        Ok(outcome.job_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::events::EventHub;
    use crate::kernel::model::JobState;
    use crate::kernel::queue::PayloadLimits;
    use crate::kernel::session::SessionManager;
    use crate::kernel::store::{JobFilter, MemoryStore};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<JobQueue>,
        engine: ScheduleEngine,
    }

    fn harness() -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            Arc::new(EventHub::new()),
            Arc::new(SessionManager::new()),
            PayloadLimits::default(),
            Duration::from_secs(30),
        ));
        let engine = ScheduleEngine::new(store.clone(), queue.clone());
        Harness {
            store,
            queue,
            engine,
        }
    }

    fn spec(cron: &str) -> ScheduleSpec {
        ScheduleSpec::builder()
            .workflow_id(Uuid::new_v4())
            .name("every-5")
            .cron_expr(cron.to_string())
            .payload(serde_json::json!({"nodes": []}))
            .build()
    }

    async fn backdate(h: &Harness, schedule_id: Uuid, seconds: i64) {
        let mut s = h.store.get_schedule(schedule_id).await.unwrap();
        s.next_fire_at = Some(Utc::now() - chrono::Duration::seconds(seconds));
        // Recreate with the backdated fire time.
        h.store.delete_schedule(schedule_id).await.unwrap();
        h.store.insert_schedule(&s).await.unwrap();
    }

    #[tokio::test]
    async fn create_computes_the_first_fire() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        assert!(schedule.enabled);
        let next = schedule.next_fire_at.unwrap();
        assert!(next > Utc::now());
        assert!(next <= Utc::now() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn create_rejects_bad_cron() {
        let h = harness();
        assert!(h.engine.create(spec("not a cron")).await.is_err());
    }

    #[tokio::test]
    async fn due_schedule_fires_and_advances() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        backdate(&h, schedule.id, 1).await;

        let fired = h.engine.run_sweep().await.unwrap();
        assert_eq!(fired, 1);

        // One pending job, stamped with the schedule context.
        let jobs = h
            .store
            .list_jobs(JobFilter::with_state(JobState::Pending))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].dedup_key.as_deref().unwrap().starts_with(&schedule.id.to_string()));

        let stored = h.store.get_schedule(schedule.id).await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert!(stored.next_fire_at.unwrap() > Utc::now());

        // Immediately sweeping again does nothing: not due anymore.
        assert_eq!(h.engine.run_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn two_engines_on_one_store_fire_once() {
        let h = harness();
        let other_engine = ScheduleEngine::new(h.store.clone(), h.queue.clone());
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        backdate(&h, schedule.id, 1).await;

        // Both replicas sweep the same due slot; the CAS lets one through.
        let fired_a = h.engine.run_sweep().await.unwrap();
        let fired_b = other_engine.run_sweep().await.unwrap();
        assert_eq!(fired_a + fired_b, 1);

        let jobs = h
            .store
            .list_jobs(JobFilter::with_state(JobState::Pending))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn downtime_collapses_to_a_single_fire() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        // Offline across three 5-minute slots.
        backdate(&h, schedule.id, 16 * 60).await;

        let fired = h.engine.run_sweep().await.unwrap();
        assert_eq!(fired, 1);
        assert_eq!(h.engine.run_sweep().await.unwrap(), 0);

        let jobs = h
            .store
            .list_jobs(JobFilter::with_state(JobState::Pending))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);

        // The missed fires were audited.
        let audit = h.store.list_audit(10, None).await.unwrap();
        let misfire = audit
            .iter()
            .find(|e| e.action == AuditAction::ScheduleMisfired)
            .expect("misfire entry");
        assert!(misfire.detail.as_ref().unwrap()["missed"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn disabled_schedules_do_not_fire() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        backdate(&h, schedule.id, 1).await;
        h.engine.disable(schedule.id).await.unwrap();

        assert_eq!(h.engine.run_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reenable_recomputes_from_now() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        backdate(&h, schedule.id, 3600).await;
        h.engine.disable(schedule.id).await.unwrap();

        let enabled = h.engine.enable(schedule.id).await.unwrap();
        // No catch-up: the next fire is in the future.
        assert!(enabled.next_fire_at.unwrap() > Utc::now());
        assert_eq!(h.engine.run_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skip_mode_suppresses_overlapping_fires() {
        let h = harness();
        let mut spec = spec("*/5 * * * *");
        spec.execution_mode = ExecutionMode::Skip;
        let schedule = h.engine.create(spec).await.unwrap();
        backdate(&h, schedule.id, 1).await;

        // First fire lands.
        assert_eq!(h.engine.run_sweep().await.unwrap(), 1);

        // Still running; next slot comes due -> suppressed.
        backdate(&h, schedule.id, 1).await;
        assert_eq!(h.engine.run_sweep().await.unwrap(), 0);

        let audit = h.store.list_audit(10, None).await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.action == AuditAction::ScheduleSkipped));
    }

    #[tokio::test]
    async fn trigger_fires_without_advancing() {
        let h = harness();
        let schedule = h.engine.create(spec("*/5 * * * *")).await.unwrap();
        let before = h.store.get_schedule(schedule.id).await.unwrap();

        let job_id = h.engine.trigger(schedule.id).await.unwrap();
        assert_eq!(
            h.store.get_job(job_id).await.unwrap().state,
            JobState::Pending
        );

        let after = h.store.get_schedule(schedule.id).await.unwrap();
        assert_eq!(before.next_fire_at, after.next_fire_at);
        assert_eq!(after.run_count, 0);
    }
}
