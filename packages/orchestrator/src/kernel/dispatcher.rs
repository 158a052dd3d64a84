//! Dispatcher: drains the pending queue into eligible workers.
//!
//! The loop is cooperative: peek and candidate selection are advisory and
//! may race freely across instances; the store's atomic claim is the only
//! serialization point. A claim that cannot be delivered (refusal, ack
//! timeout, dead session) is reverted and the robot backs off briefly;
//! sustained delivery failures trip the breaker and drain the robot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{CoreError, Result};
use crate::kernel::events::{Event, EventHub};
use crate::kernel::model::{AuditAction, AuditEntry};
use crate::kernel::queue::JobQueue;
use crate::kernel::registry::RobotRegistry;
use crate::kernel::session::{AckOutcome, SessionManager};
use crate::kernel::store::Store;

/// Consecutive delivery failures before a robot is drained.
const BREAKER_TRIP_THRESHOLD: u32 = 3;
/// How long a robot sits out after a failed delivery.
const ROBOT_BACKOFF: Duration = Duration::from_secs(2);
/// Extra sleep after a failed delivery, so a broken fleet does not spin.
const FAILURE_SLOWDOWN: Duration = Duration::from_millis(200);

/// Tracks per-robot delivery failures; trips after a run of consecutive
/// failures.
#[derive(Default)]
pub struct DeliveryBreaker {
    state: Mutex<HashMap<Uuid, BreakerEntry>>,
}

#[derive(Clone, Copy)]
struct BreakerEntry {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl DeliveryBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed delivery; returns true when the breaker trips.
    pub fn record_failure(&self, robot_id: Uuid) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(robot_id).or_insert(BreakerEntry {
            consecutive_failures: 0,
            backoff_until: None,
        });
        entry.consecutive_failures += 1;
        entry.backoff_until = Some(Instant::now() + ROBOT_BACKOFF);
        if entry.consecutive_failures >= BREAKER_TRIP_THRESHOLD {
            entry.consecutive_failures = 0;
            entry.backoff_until = None;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, robot_id: Uuid) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&robot_id);
    }

    /// Whether the robot is sitting out its post-failure backoff.
    pub fn is_backed_off(&self, robot_id: Uuid) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&robot_id)
            .and_then(|e| e.backoff_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Robots currently in backoff, for candidate exclusion.
    pub fn backed_off_robots(&self) -> Vec<Uuid> {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, e)| e.backoff_until.map(|until| now < until).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect()
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    registry: Arc<RobotRegistry>,
    sessions: Arc<SessionManager>,
    events: Arc<EventHub>,
    assign_ack_timeout: Duration,
    poll_interval: Duration,
    breaker: DeliveryBreaker,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<JobQueue>,
        registry: Arc<RobotRegistry>,
        sessions: Arc<SessionManager>,
        events: Arc<EventHub>,
        assign_ack_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            sessions,
            events,
            assign_ack_timeout,
            poll_interval,
            breaker: DeliveryBreaker::new(),
        }
    }

    /// Long-lived loop: wake on pending work, freed capacity or the poll
    /// interval; drain until nothing matches.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "dispatcher starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.pending_signal().notified() => {}
                _ = self.registry.idle_signal().notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.drain().await {
                warn!(error = %e, "dispatch cycle failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("dispatcher stopped");
    }

    /// One drain cycle: match pending jobs to workers until the queue or
    /// the fleet runs dry. Returns assignments made.
    pub async fn drain(&self) -> Result<usize> {
        let mut assigned = 0;
        loop {
            // Advisory peek; the claim below is the serialization point.
            let Some(candidate) = self.store.peek_pending().await? else {
                break;
            };
            let backed_off = self.breaker.backed_off_robots();
            let Some(robot) = self.registry.pick_candidate(&candidate, &backed_off).await? else {
                break;
            };

            let Some(claimed) = self
                .store
                .claim_one_pending(robot.id, &robot.capabilities, &robot.environment)
                .await?
            else {
                // Raced with another claimer; re-peek.
                continue;
            };

            match self
                .sessions
                .send_assign(robot.id, &claimed, self.assign_ack_timeout)
                .await
            {
                Ok(AckOutcome::Accepted) => {
                    self.registry.reserve(robot.id, claimed.id).await?;
                    self.breaker.record_success(robot.id);
                    assigned += 1;
                    info!(job_id = %claimed.id, robot_id = %robot.id, "job assigned");
                    if let Err(e) = self
                        .store
                        .append_audit(
                            &AuditEntry::new(AuditAction::JobAssigned)
                                .job(claimed.id)
                                .robot(robot.id),
                        )
                        .await
                    {
                        warn!(error = %e, "audit append failed");
                    }
                    self.events.publish(Event::JobAssigned {
                        job_id: claimed.id,
                        robot_id: robot.id,
                    });
                    // Acceptance is the running signal; a worker that
                    // finished impossibly fast already moved the state on.
                    if let Err(e) = self.queue.mark_running(claimed.id, robot.id).await {
                        debug!(job_id = %claimed.id, error = %e, "mark_running skipped");
                    }
                }
                Ok(AckOutcome::Rejected(reason)) => {
                    debug!(job_id = %claimed.id, robot_id = %robot.id, reason = %reason,
                           "assignment rejected");
                    self.revert(claimed.id, robot.id, &format!("worker refused: {reason}"))
                        .await?;
                    tokio::time::sleep(FAILURE_SLOWDOWN).await;
                }
                Err(CoreError::Timeout(_)) => {
                    warn!(job_id = %claimed.id, robot_id = %robot.id, "assignment ack timed out");
                    self.revert(claimed.id, robot.id, "assign ack timeout").await?;
                    tokio::time::sleep(FAILURE_SLOWDOWN).await;
                }
                Err(CoreError::WorkerLost { .. }) => {
                    warn!(job_id = %claimed.id, robot_id = %robot.id, "session died mid-assign");
                    self.revert(claimed.id, robot.id, "session lost").await?;
                    tokio::time::sleep(FAILURE_SLOWDOWN).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(assigned)
    }

    async fn revert(&self, job_id: Uuid, robot_id: Uuid, reason: &str) -> Result<()> {
        self.queue.requeue_undelivered(job_id, reason).await?;
        if self.breaker.record_failure(robot_id) {
            warn!(robot_id = %robot_id, "delivery breaker tripped, draining robot");
            if let Err(e) = self.registry.set_draining(robot_id, true).await {
                warn!(robot_id = %robot_id, error = %e, "failed to drain robot");
            }
        }
        Ok(())
    }
}
