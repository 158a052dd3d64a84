//! PostgreSQL store.
//!
//! All cross-instance coordination happens here: the claim uses
//! `FOR UPDATE SKIP LOCKED`, state changes are conditional updates keyed on
//! the expected current state, and the schedule advance is a
//! compare-and-swap on `next_fire_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobFilter, JobUpdate, QueueCounts, RequeueSummary, Store};
use crate::common::{CoreError, Result};
use crate::kernel::model::{
    AuditEntry, Heartbeat, Job, JobState, Robot, RobotApiKey, RobotStatus, Schedule,
};

const JOB_COLUMNS: &str = "id, workflow_id, payload, priority, environment, required_capabilities, \
     target_robot_id, trigger_context, state, retry_count, max_retries, timeout_seconds, \
     dedup_key, next_attempt_at, assigned_robot_id, result, error_kind, error_message, \
     error_stack, dead_lettered_at, dead_letter_reason, replay_count, created_at, claimed_at, \
     started_at, completed_at, updated_at";

const ROBOT_COLUMNS: &str = "id, name, capabilities, environment, max_concurrent_jobs, status, \
     current_job_ids, last_heartbeat_at, last_assignment_at, token_fingerprint, decommissioned, \
     registered_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, workflow_id, name, cron_expr, timezone, enabled, payload, \
     priority, environment, required_capabilities, execution_mode, next_fire_at, last_fire_at, \
     run_count, failure_count, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            "#
        );
        let result = sqlx::query(&sql)
            .bind(job.id)
            .bind(job.workflow_id)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(&job.environment)
            .bind(&job.required_capabilities)
            .bind(job.target_robot_id)
            .bind(&job.trigger_context)
            .bind(job.state)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(job.timeout_seconds)
            .bind(&job.dedup_key)
            .bind(job.next_attempt_at)
            .bind(job.assigned_robot_id)
            .bind(&job.result)
            .bind(job.error_kind)
            .bind(&job.error_message)
            .bind(&job.error_stack)
            .bind(job.dead_lettered_at)
            .bind(&job.dead_letter_reason)
            .bind(job.replay_count)
            .bind(job.created_at)
            .bind(job.claimed_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::Duplicate {
                    entity: "job",
                    id: job.id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoreError::not_found("job", job_id))
    }

    async fn find_active_by_dedup_key(&self, key: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE dedup_key = $1
              AND state IN ('pending', 'assigned', 'running', 'cancelling')
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn claim_one_pending(
        &self,
        robot_id: Uuid,
        capabilities: &[String],
        environment: &str,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE state = 'pending'
                  AND environment = $2
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                  AND (target_robot_id IS NULL OR target_robot_id = $1)
                  AND required_capabilities <@ $3
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'assigned',
                assigned_robot_id = $1,
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(robot_id)
            .bind(environment)
            .bind(capabilities)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn peek_pending(&self) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY priority, created_at
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .fetch_optional(&self.pool)
            .await?)
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

        let (error_kind, error_message, error_stack) = match &update.error {
            Some(e) => (Some(e.kind), Some(e.message.clone()), e.stack.clone()),
            None => (None, None, None),
        };

        let sql = format!(
            r#"
            UPDATE jobs SET
                state = $3,
                assigned_robot_id = CASE WHEN $4 THEN $5 ELSE assigned_robot_id END,
                claimed_at = COALESCE($6, claimed_at),
                started_at = COALESCE($7, started_at),
                completed_at = COALESCE($8, completed_at),
                result = COALESCE($9, result),
                error_kind = COALESCE($10, error_kind),
                error_message = COALESCE($11, error_message),
                error_stack = COALESCE($12, error_stack),
                retry_count = COALESCE($13, retry_count),
                next_attempt_at = CASE WHEN $14 THEN $15 ELSE next_attempt_at END,
                dead_lettered_at = CASE WHEN $16::text IS NOT NULL THEN NOW() ELSE dead_lettered_at END,
                dead_letter_reason = COALESCE($16, dead_letter_reason),
                replay_count = replay_count + CASE WHEN $17 THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(from)
            .bind(update.to_state)
            .bind(update.assigned_robot_id.is_some())
            .bind(update.assigned_robot_id.flatten())
            .bind(update.claimed_at)
            .bind(update.started_at)
            .bind(update.completed_at)
            .bind(&update.result)
            .bind(error_kind)
            .bind(&error_message)
            .bind(&error_stack)
            .bind(update.retry_count)
            .bind(update.next_attempt_at.is_some())
            .bind(update.next_attempt_at.flatten())
            .bind(&update.dead_letter_reason)
            .bind(update.bump_replay_count)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(job) => Ok(job),
            // Zero rows: either the job is gone or its state moved on.
            None => {
                let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_one(&self.pool)
                    .await?;
                if exists == 0 {
                    Err(CoreError::not_found("job", job_id))
                } else {
                    Err(CoreError::StaleTransition { job_id })
                }
            }
        }
    }

    async fn requeue_jobs_of_robot(&self, robot_id: Uuid) -> Result<RequeueSummary> {
        let mut tx = self.pool.begin().await.map_err(CoreError::from)?;

        let requeued: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = 'pending',
                assigned_robot_id = NULL,
                claimed_at = NULL,
                started_at = NULL,
                retry_count = retry_count + 1,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE assigned_robot_id = $1
              AND state IN ('assigned', 'running', 'cancelling')
              AND retry_count < max_retries
            RETURNING id
            "#,
        )
        .bind(robot_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        let exhausted: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = 'failed',
                error_kind = 'worker_lost',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE assigned_robot_id = $1
              AND state IN ('assigned', 'running', 'cancelling')
              AND retry_count >= max_retries
            RETURNING id
            "#,
        )
        .bind(robot_id)
        .bind(format!("assigned robot {robot_id} went offline"))
        .fetch_all(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        tx.commit().await.map_err(CoreError::from)?;

        Ok(RequeueSummary {
            requeued,
            exhausted,
        })
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::job_state IS NULL OR state = $1)
              AND ($2::uuid IS NULL OR workflow_id = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(filter.state)
            .bind(filter.workflow_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn running_jobs_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'running'
              AND started_at IS NOT NULL
              AND started_at + make_interval(secs => timeout_seconds) < $1
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn cancelling_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'cancelling' AND updated_at < $1
            "#
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn count_jobs(&self) -> Result<QueueCounts> {
        let rows: Vec<(JobState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(CoreError::from)?;
        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            counts.set(state, count);
        }
        Ok(counts)
    }

    async fn count_active_for_schedule(&self, schedule_id: Uuid) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE trigger_context->>'schedule_id' = $1
              AND state IN ('pending', 'assigned', 'running', 'cancelling')
            "#,
        )
        .bind(schedule_id.to_string())
        .fetch_one(&self.pool)
        .await?)
    }

    // ------------------------------------------------------------------
    // Robots
    // ------------------------------------------------------------------

    async fn upsert_robot(&self, robot: &Robot) -> Result<Robot> {
        let sql = format!(
            r#"
            INSERT INTO robots ({ROBOT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                capabilities = EXCLUDED.capabilities,
                environment = EXCLUDED.environment,
                max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                status = EXCLUDED.status,
                current_job_ids = EXCLUDED.current_job_ids,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                token_fingerprint = EXCLUDED.token_fingerprint,
                decommissioned = EXCLUDED.decommissioned,
                updated_at = NOW()
            RETURNING {ROBOT_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Robot>(&sql)
            .bind(robot.id)
            .bind(&robot.name)
            .bind(&robot.capabilities)
            .bind(&robot.environment)
            .bind(robot.max_concurrent_jobs)
            .bind(robot.status)
            .bind(&robot.current_job_ids)
            .bind(robot.last_heartbeat_at)
            .bind(robot.last_assignment_at)
            .bind(&robot.token_fingerprint)
            .bind(robot.decommissioned)
            .bind(robot.registered_at)
            .bind(robot.updated_at)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_robot(&self, robot_id: Uuid) -> Result<Robot> {
        let sql = format!("SELECT {ROBOT_COLUMNS} FROM robots WHERE id = $1");
        sqlx::query_as::<_, Robot>(&sql)
            .bind(robot_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoreError::not_found("robot", robot_id))
    }

    async fn list_robots(&self) -> Result<Vec<Robot>> {
        let sql = format!("SELECT {ROBOT_COLUMNS} FROM robots ORDER BY name");
        Ok(sqlx::query_as::<_, Robot>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_robot_status(&self, robot_id: Uuid, status: RobotStatus) -> Result<()> {
        let result = sqlx::query("UPDATE robots SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(robot_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(CoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("robot", robot_id));
        }
        Ok(())
    }

    async fn update_robot_assignments(
        &self,
        robot_id: Uuid,
        current_job_ids: &[Uuid],
        stamp_assignment: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE robots SET
                current_job_ids = $2,
                last_assignment_at = CASE WHEN $3 THEN NOW() ELSE last_assignment_at END,
                status = CASE
                    WHEN status IN ('idle', 'busy') THEN
                        CASE WHEN cardinality($2::uuid[]) > 0
                             THEN 'busy'::robot_status
                             ELSE 'idle'::robot_status END
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(robot_id)
        .bind(current_job_ids)
        .bind(stamp_assignment)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("robot", robot_id));
        }
        Ok(())
    }

    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(CoreError::from)?;

        sqlx::query(
            r#"
            INSERT INTO heartbeats (robot_id, at, status, current_job_count, cpu_percent, memory_mb)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(heartbeat.robot_id)
        .bind(heartbeat.at)
        .bind(heartbeat.status)
        .bind(heartbeat.current_job_count)
        .bind(heartbeat.cpu_percent)
        .bind(heartbeat.memory_mb)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        sqlx::query("UPDATE robots SET last_heartbeat_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(heartbeat.robot_id)
            .bind(heartbeat.at)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::from)?;

        tx.commit().await.map_err(CoreError::from)?;
        Ok(())
    }

    async fn mark_stale_robots(&self, threshold: DateTime<Utc>) -> Result<Vec<Uuid>> {
        Ok(sqlx::query_scalar(
            r#"
            UPDATE robots
            SET status = 'offline', updated_at = NOW()
            WHERE status IN ('idle', 'busy', 'draining')
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            RETURNING id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn set_robot_decommissioned(&self, robot_id: Uuid, decommissioned: bool) -> Result<()> {
        let result =
            sqlx::query("UPDATE robots SET decommissioned = $2, updated_at = NOW() WHERE id = $1")
                .bind(robot_id)
                .bind(decommissioned)
                .execute(&self.pool)
                .await
                .map_err(CoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("robot", robot_id));
        }
        Ok(())
    }

    async fn prune_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM heartbeats WHERE at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Robot API keys
    // ------------------------------------------------------------------

    async fn find_robot_key(&self, fingerprint: &str) -> Result<Option<RobotApiKey>> {
        Ok(sqlx::query_as::<_, RobotApiKey>(
            r#"
            SELECT robot_id, name, token_fingerprint, created_at, revoked_at
            FROM robot_api_keys
            WHERE token_fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_robot_key(&self, key: &RobotApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO robot_api_keys (robot_id, name, token_fingerprint, created_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(key.robot_id)
        .bind(&key.name)
        .bind(&key.token_fingerprint)
        .bind(key.created_at)
        .bind(key.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO schedules ({SCHEDULE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#
        );
        let result = sqlx::query(&sql)
            .bind(schedule.id)
            .bind(schedule.workflow_id)
            .bind(&schedule.name)
            .bind(&schedule.cron_expr)
            .bind(&schedule.timezone)
            .bind(schedule.enabled)
            .bind(&schedule.payload)
            .bind(schedule.priority)
            .bind(&schedule.environment)
            .bind(&schedule.required_capabilities)
            .bind(schedule.execution_mode)
            .bind(schedule.next_fire_at)
            .bind(schedule.last_fire_at)
            .bind(schedule.run_count)
            .bind(schedule.failure_count)
            .bind(schedule.created_at)
            .bind(schedule.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::Duplicate {
                    entity: "schedule",
                    id: schedule.id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1");
        sqlx::query_as::<_, Schedule>(&sql)
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoreError::not_found("schedule", schedule_id))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name");
        Ok(sqlx::query_as::<_, Schedule>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("schedule", schedule_id));
        }
        Ok(())
    }

    async fn set_schedule_enabled(
        &self,
        schedule_id: Uuid,
        enabled: bool,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        let sql = format!(
            r#"
            UPDATE schedules
            SET enabled = $2, next_fire_at = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Schedule>(&sql)
            .bind(schedule_id)
            .bind(enabled)
            .bind(next_fire_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CoreError::not_found("schedule", schedule_id))
    }

    async fn schedule_lookup_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let sql = format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM schedules
            WHERE enabled = true AND next_fire_at IS NOT NULL AND next_fire_at <= $1
            ORDER BY next_fire_at
            "#
        );
        Ok(sqlx::query_as::<_, Schedule>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        observed_next_fire_at: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET next_fire_at = $4,
                last_fire_at = $3,
                run_count = run_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND next_fire_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(schedule_id)
        .bind(observed_next_fire_at)
        .bind(fired_at)
        .bind(next_fire_at)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_schedule_failure(&self, schedule_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET failure_count = failure_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(schedule_id)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, at, action, job_id, robot_id, schedule_id, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.at)
        .bind(entry.action)
        .bind(entry.job_id)
        .bind(entry.robot_id)
        .bind(entry.schedule_id)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }

    async fn list_audit(
        &self,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>> {
        let limit = if limit > 0 { limit } else { 100 };
        Ok(sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, at, action, job_id, robot_id, schedule_id, detail
            FROM audit_log
            WHERE $2::timestamptz IS NULL OR at < $2
            ORDER BY at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(before)
        .fetch_all(&self.pool)
        .await?)
    }
}
