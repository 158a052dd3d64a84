//! Postgres store integration tests.
//!
//! These exercise the production store against a real database and are
//! ignored by default; point DATABASE_URL at a scratch Postgres and run
//! `cargo test --test store_pg -- --ignored`. Each test isolates itself
//! with a unique environment tag so suites can share a database.

use std::sync::Arc;

use orchestrator_core::common::{CoreError, ErrorKind};
use orchestrator_core::kernel::model::{Job, JobState, Robot, RobotStatus, Schedule};
use orchestrator_core::kernel::store::{JobUpdate, PgStore, Store};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn pg_store() -> Arc<PgStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for pg tests");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("connect to postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    Arc::new(PgStore::new(pool))
}

fn job_in(environment: &str) -> Job {
    Job::builder()
        .workflow_id(Uuid::new_v4())
        .payload(serde_json::json!({"nodes": []}))
        .environment(environment.to_string())
        .build()
}

fn unique_env() -> String {
    format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn insert_get_roundtrip() {
    let store = pg_store().await;
    let env = unique_env();
    let job = job_in(&env);
    store.insert_job(&job).await.unwrap();

    let loaded = store.get_job(job.id).await.unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.state, JobState::Pending);
    assert_eq!(loaded.environment, env);
}

#[tokio::test]
#[ignore]
async fn duplicate_insert_is_rejected() {
    let store = pg_store().await;
    let job = job_in(&unique_env());
    store.insert_job(&job).await.unwrap();
    let err = store.insert_job(&job).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
}

#[tokio::test]
#[ignore]
async fn claim_orders_by_priority_then_age() {
    let store = pg_store().await;
    let env = unique_env();

    let mut low = job_in(&env);
    low.priority = 15;
    let mut high = job_in(&env);
    high.priority = 1;
    store.insert_job(&low).await.unwrap();
    store.insert_job(&high).await.unwrap();

    let claimed = store
        .claim_one_pending(Uuid::new_v4(), &[], &env)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, high.id);
    assert_eq!(claimed.state, JobState::Assigned);
    assert!(claimed.claimed_at.is_some());
}

#[tokio::test]
#[ignore]
async fn concurrent_claimers_never_share_a_job() {
    let store = pg_store().await;
    let env = unique_env();

    let total_jobs = 200;
    for _ in 0..total_jobs {
        store.insert_job(&job_in(&env)).await.unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let env = env.clone();
        claimers.push(tokio::spawn(async move {
            let robot_id = Uuid::new_v4();
            let mut claimed = Vec::new();
            loop {
                match store.claim_one_pending(robot_id, &[], &env).await.unwrap() {
                    Some(job) => claimed.push(job.id),
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }
    assert_eq!(all.len(), total_jobs);
    let unique: std::collections::HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(unique.len(), total_jobs);
}

#[tokio::test]
#[ignore]
async fn claim_filters_capabilities_environment_and_pin() {
    let store = pg_store().await;
    let env = unique_env();

    let mut needs_browser = job_in(&env);
    needs_browser.required_capabilities = vec!["browser".to_string()];
    store.insert_job(&needs_browser).await.unwrap();

    // Wrong capability set.
    assert!(store
        .claim_one_pending(Uuid::new_v4(), &["desktop".to_string()], &env)
        .await
        .unwrap()
        .is_none());
    // Wrong environment.
    assert!(store
        .claim_one_pending(Uuid::new_v4(), &["browser".to_string()], "elsewhere")
        .await
        .unwrap()
        .is_none());
    // Right both.
    assert!(store
        .claim_one_pending(Uuid::new_v4(), &["browser".to_string()], &env)
        .await
        .unwrap()
        .is_some());

    let target = Uuid::new_v4();
    let mut pinned = job_in(&env);
    pinned.target_robot_id = Some(target);
    store.insert_job(&pinned).await.unwrap();

    assert!(store
        .claim_one_pending(Uuid::new_v4(), &[], &env)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        store
            .claim_one_pending(target, &[], &env)
            .await
            .unwrap()
            .unwrap()
            .id,
        pinned.id
    );
}

#[tokio::test]
#[ignore]
async fn conditional_update_detects_stale_transitions() {
    let store = pg_store().await;
    let job = job_in(&unique_env());
    store.insert_job(&job).await.unwrap();

    let err = store
        .update_job_state(job.id, JobState::Running, JobUpdate::to(JobState::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StaleTransition { .. }));

    store
        .update_job_state(job.id, JobState::Pending, JobUpdate::to(JobState::Cancelled))
        .await
        .unwrap();
    assert_eq!(
        store.get_job(job.id).await.unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
#[ignore]
async fn dedup_backstop_rejects_second_active_row() {
    let store = pg_store().await;
    let key = format!("dedup-{}", Uuid::new_v4());

    let mut first = job_in(&unique_env());
    first.dedup_key = Some(key.clone());
    store.insert_job(&first).await.unwrap();

    let mut second = job_in(&unique_env());
    second.dedup_key = Some(key.clone());
    let err = store.insert_job(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    assert_eq!(
        store
            .find_active_by_dedup_key(&key)
            .await
            .unwrap()
            .unwrap()
            .id,
        first.id
    );
}

#[tokio::test]
#[ignore]
async fn requeue_splits_by_remaining_budget() {
    let store = pg_store().await;
    let env = unique_env();
    let robot_id = Uuid::new_v4();

    let mut retriable = job_in(&env);
    retriable.state = JobState::Running;
    retriable.assigned_robot_id = Some(robot_id);
    store.insert_job(&retriable).await.unwrap();

    let mut exhausted = job_in(&env);
    exhausted.state = JobState::Running;
    exhausted.assigned_robot_id = Some(robot_id);
    exhausted.retry_count = 3;
    store.insert_job(&exhausted).await.unwrap();

    let summary = store.requeue_jobs_of_robot(robot_id).await.unwrap();
    assert_eq!(summary.requeued, vec![retriable.id]);
    assert_eq!(summary.exhausted, vec![exhausted.id]);

    let back = store.get_job(retriable.id).await.unwrap();
    assert_eq!(back.state, JobState::Pending);
    assert_eq!(back.retry_count, 1);
    assert!(back.assigned_robot_id.is_none());

    let failed = store.get_job(exhausted.id).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::WorkerLost));
}

#[tokio::test]
#[ignore]
async fn robot_upsert_and_stale_sweep() {
    let store = pg_store().await;
    let robot = Robot::builder()
        .name(format!("pg-robot-{}", Uuid::new_v4()))
        .status(RobotStatus::Idle)
        .build();
    store.upsert_robot(&robot).await.unwrap();

    // No heartbeat ever: the sweep takes it offline.
    let stale = store
        .mark_stale_robots(chrono::Utc::now() - chrono::Duration::seconds(90))
        .await
        .unwrap();
    assert!(stale.contains(&robot.id));
    assert_eq!(
        store.get_robot(robot.id).await.unwrap().status,
        RobotStatus::Offline
    );
}

#[tokio::test]
#[ignore]
async fn schedule_cas_advances_exactly_once() {
    let store = pg_store().await;
    let fire = chrono::Utc::now();
    let next = fire + chrono::Duration::minutes(5);

    let mut schedule = Schedule::builder()
        .workflow_id(Uuid::new_v4())
        .name(format!("pg-schedule-{}", Uuid::new_v4()))
        .cron_expr("*/5 * * * *".to_string())
        .payload(serde_json::json!({}))
        .build();
    schedule.next_fire_at = Some(fire);
    store.insert_schedule(&schedule).await.unwrap();

    let won = store
        .advance_schedule(schedule.id, Some(fire), fire, Some(next))
        .await
        .unwrap();
    assert!(won);
    let lost = store
        .advance_schedule(schedule.id, Some(fire), fire, Some(next))
        .await
        .unwrap();
    assert!(!lost);

    let stored = store.get_schedule(schedule.id).await.unwrap();
    assert_eq!(stored.run_count, 1);
}
