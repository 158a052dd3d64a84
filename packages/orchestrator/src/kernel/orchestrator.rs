//! Composition root.
//!
//! Everything is constructed here at startup and passed by `Arc`; there is
//! no global mutable state. `start` spawns the named long-lived tasks
//! (dispatchers, liveness sweep, timeout sweep, schedule sweep, heartbeat
//! prune, queue gauge); `shutdown` drains the fleet, gives in-flight work
//! a grace period and then stops everything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::kernel::auth::{JwtService, RobotTokenValidator, TokenValidator};
use crate::kernel::dispatcher::Dispatcher;
use crate::kernel::events::EventHub;
use crate::kernel::queue::{JobQueue, PayloadLimits};
use crate::kernel::registry::{DispatchPolicy, RobotRegistry};
use crate::kernel::schedule::ScheduleEngine;
use crate::kernel::session::{IngressRouter, OrchestratorMessage, SessionManager};
use crate::kernel::store::Store;

pub struct Orchestrator {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventHub>,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<RobotRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub schedule_engine: Arc<ScheduleEngine>,
    pub ingress: Arc<IngressRouter>,
    pub jwt: Arc<JwtService>,
    pub robot_tokens: Arc<dyn TokenValidator>,

    config: Config,
    root_cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Arc<Self> {
        let events = Arc::new(EventHub::new());
        let sessions = Arc::new(SessionManager::new());

        let queue = Arc::new(JobQueue::new(
            store.clone(),
            events.clone(),
            sessions.clone(),
            PayloadLimits {
                max_bytes: config.max_workflow_bytes,
                max_nodes: config.max_workflow_nodes,
            },
            config.cancel_ack_timeout,
        ));

        let robot_tokens: Arc<dyn TokenValidator> = Arc::new(RobotTokenValidator::new(
            store.clone(),
            config.robot_auth_enabled,
        ));

        let registry = Arc::new(RobotRegistry::new(
            store.clone(),
            queue.clone(),
            sessions.clone(),
            events.clone(),
            robot_tokens.clone(),
            DispatchPolicy::LeastLoaded,
            config.heartbeat_timeout,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            sessions.clone(),
            events.clone(),
            config.assign_ack_timeout,
            Duration::from_secs(1),
        ));

        let schedule_engine = Arc::new(ScheduleEngine::new(store.clone(), queue.clone()));

        let ingress = Arc::new(IngressRouter::new(
            queue.clone(),
            registry.clone(),
            sessions.clone(),
            events.clone(),
        ));

        let jwt = Arc::new(JwtService::new(
            &config.jwt_secret_key,
            "casare-orchestrator".to_string(),
            config.jwt_access_expire_minutes,
        ));

        Arc::new(Self {
            store,
            events,
            sessions,
            queue,
            registry,
            dispatcher,
            schedule_engine,
            ingress,
            jwt,
            robot_tokens,
            config,
            root_cancel: CancellationToken::new(),
            dispatch_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the long-lived background tasks.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // dispatcher (xN)
        for _ in 0..self.config.workers.max(1) {
            let dispatcher = self.dispatcher.clone();
            let cancel = self.dispatch_cancel.clone();
            tasks.push(tokio::spawn(dispatcher.run(cancel)));
        }

        // liveness_sweep
        {
            let registry = self.registry.clone();
            let cancel = self.root_cancel.clone();
            let interval = self.config.liveness_sweep_interval();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = registry.run_liveness_sweep().await {
                        warn!(error = %e, "liveness sweep failed");
                    }
                }
            }));
        }

        // timeout_sweep (job timeouts + unacked cancels)
        {
            let queue = self.queue.clone();
            let cancel = self.root_cancel.clone();
            let interval = self.config.timeout_sweep_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = queue.run_timeout_sweep().await {
                        warn!(error = %e, "timeout sweep failed");
                    }
                    if let Err(e) = queue.run_cancel_sweep().await {
                        warn!(error = %e, "cancel sweep failed");
                    }
                }
            }));
        }

        // schedule_sweep
        {
            let engine = self.schedule_engine.clone();
            let cancel = self.dispatch_cancel.clone();
            let interval = self.config.schedule_sweep_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = engine.run_sweep().await {
                        warn!(error = %e, "schedule sweep failed");
                    }
                }
            }));
        }

        // heartbeat_prune
        {
            let store = self.store.clone();
            let cancel = self.root_cancel.clone();
            let retention = self.config.heartbeat_retention;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                    }
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(retention)
                            .unwrap_or_else(|_| chrono::Duration::hours(24));
                    match store.prune_heartbeats(cutoff).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "pruned old heartbeats")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "heartbeat prune failed"),
                    }
                }
            }));
        }

        // queue_gauge
        {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let cancel = self.root_cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                    let robots_online = match store.list_robots().await {
                        Ok(robots) => {
                            robots.iter().filter(|r| r.status.is_online()).count() as i64
                        }
                        Err(_) => continue,
                    };
                    if let Err(e) = queue.publish_queue_depth(robots_online).await {
                        warn!(error = %e, "queue gauge failed");
                    }
                }
            }));
        }

        info!(
            dispatchers = self.config.workers.max(1),
            "orchestrator background tasks started"
        );
    }

    /// Graceful shutdown: drain the fleet, stop producing work, give
    /// in-flight jobs the grace period, then stop everything. Jobs still
    /// running afterwards stay `Running` and are recovered as lost work by
    /// the next instance's liveness sweep.
    pub async fn shutdown(&self) {
        info!("shutting down: draining fleet");
        self.sessions.broadcast(OrchestratorMessage::Drain).await;
        self.dispatch_cancel.cancel();

        let grace_deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let in_flight = match self.store.count_jobs().await {
                Ok(counts) => counts.in_flight(),
                Err(_) => 0,
            };
            if in_flight == 0 || tokio::time::Instant::now() >= grace_deadline {
                if in_flight > 0 {
                    warn!(in_flight, "grace period expired with jobs still in flight");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        self.sessions.broadcast(OrchestratorMessage::Shutdown).await;
        self.root_cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }

    /// The cancellation token transports watch to stop accepting work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.root_cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryStore;
    use crate::kernel::testing::test_config;

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), test_config());
        orchestrator.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_broadcasts_drain_to_sessions() {
        let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), test_config());
        orchestrator.start();

        let robot_id = uuid::Uuid::new_v4();
        let mut session = orchestrator.sessions.attach(robot_id);

        orchestrator.shutdown().await;

        let mut saw_drain = false;
        while let Ok(message) = session.rx.try_recv() {
            if matches!(message, OrchestratorMessage::Drain) {
                saw_drain = true;
            }
        }
        assert!(saw_drain);
    }
}
