//! Event fan-out hub.
//!
//! Topic-keyed pub/sub for pushing live state to observers. Fan-out is a
//! best-effort mirror of the store; nothing in the core depends on
//! delivery. Two overflow policies per the reliability needs of each
//! topic:
//!
//! - `jobs` / `robots`: a full subscriber buffer disconnects the
//!   subscriber (state observers must not see silent gaps).
//! - `queue-metrics` / `activity`: oldest events are dropped (gauges and
//!   feeds tolerate loss).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::common::JobError;
use crate::kernel::model::{AuditEntry, RobotStatus};

pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Jobs,
    Robots,
    QueueMetrics,
    Activity,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Jobs => "jobs",
            Topic::Robots => "robots",
            Topic::QueueMetrics => "queue-metrics",
            Topic::Activity => "activity",
        }
    }
}

/// Everything observers can see, serialized as `{"type": ...}` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobQueued {
        job_id: Uuid,
        workflow_id: Uuid,
        priority: i16,
    },
    JobAssigned {
        job_id: Uuid,
        robot_id: Uuid,
    },
    JobStarted {
        job_id: Uuid,
        robot_id: Uuid,
    },
    JobProgress {
        job_id: Uuid,
        robot_id: Uuid,
        percent: f64,
        node_id: Option<String>,
        message: Option<String>,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        error: JobError,
        will_retry: bool,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobTimedOut {
        job_id: Uuid,
    },
    JobRequeued {
        job_id: Uuid,
        retry_count: i32,
    },
    JobDeadLettered {
        job_id: Uuid,
    },
    JobLog {
        job_id: Uuid,
        robot_id: Uuid,
        level: String,
        message: String,
    },
    RobotOnline {
        robot_id: Uuid,
        name: String,
    },
    RobotOffline {
        robot_id: Uuid,
    },
    RobotStatus {
        robot_id: Uuid,
        status: RobotStatus,
        current_job_count: usize,
    },
    QueueDepth {
        pending: i64,
        in_flight: i64,
        dead_letter: i64,
        robots_online: i64,
    },
    Activity {
        entry: AuditEntry,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::JobQueued { .. }
            | Event::JobAssigned { .. }
            | Event::JobStarted { .. }
            | Event::JobProgress { .. }
            | Event::JobCompleted { .. }
            | Event::JobFailed { .. }
            | Event::JobCancelled { .. }
            | Event::JobTimedOut { .. }
            | Event::JobRequeued { .. }
            | Event::JobDeadLettered { .. }
            | Event::JobLog { .. } => Topic::Jobs,
            Event::RobotOnline { .. } | Event::RobotOffline { .. } | Event::RobotStatus { .. } => {
                Topic::Robots
            }
            Event::QueueDepth { .. } => Topic::QueueMetrics,
            Event::Activity { .. } => Topic::Activity,
        }
    }
}

/// Subscribers on disconnect-slow topics hold an mpsc receiver; subscribers
/// on drop-oldest topics hold a broadcast receiver that skips over lag.
pub enum Subscription {
    Stream(mpsc::Receiver<Event>),
    Lossy(broadcast::Receiver<Event>),
}

impl Subscription {
    /// Next event, `None` once the subscription is closed (hub dropped, or
    /// this subscriber was disconnected for falling behind).
    pub async fn recv(&mut self) -> Option<Event> {
        match self {
            Subscription::Stream(rx) => rx.recv().await,
            Subscription::Lossy(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    // Oldest events were dropped; keep going.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Per-subscriber bounded channels for the disconnect-slow topics.
struct SubscriberSet {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    capacity: usize,
}

impl SubscriberSet {
    fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Non-blocking fan-out. A full buffer means the subscriber is too
    /// slow: its sender is dropped, which closes the stream on its end.
    fn publish(&self, event: &Event) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

pub struct EventHub {
    jobs: SubscriberSet,
    robots: SubscriberSet,
    metrics_tx: broadcast::Sender<Event>,
    activity_tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: SubscriberSet::new(capacity),
            robots: SubscriberSet::new(capacity),
            metrics_tx: broadcast::channel(capacity).0,
            activity_tx: broadcast::channel(capacity).0,
        }
    }

    /// Non-blocking publish to the event's topic. No-op without
    /// subscribers.
    pub fn publish(&self, event: Event) {
        match event.topic() {
            Topic::Jobs => self.jobs.publish(&event),
            Topic::Robots => self.robots.publish(&event),
            Topic::QueueMetrics => {
                let _ = self.metrics_tx.send(event);
            }
            Topic::Activity => {
                let _ = self.activity_tx.send(event);
            }
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        match topic {
            Topic::Jobs => Subscription::Stream(self.jobs.subscribe()),
            Topic::Robots => Subscription::Stream(self.robots.subscribe()),
            Topic::QueueMetrics => Subscription::Lossy(self.metrics_tx.subscribe()),
            Topic::Activity => Subscription::Lossy(self.activity_tx.subscribe()),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        match topic {
            Topic::Jobs => self.jobs.subscriber_count(),
            Topic::Robots => self.robots.subscriber_count(),
            Topic::QueueMetrics => self.metrics_tx.receiver_count(),
            Topic::Activity => self.activity_tx.receiver_count(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(job_id: Uuid) -> Event {
        Event::JobQueued {
            job_id,
            workflow_id: Uuid::new_v4(),
            priority: 10,
        }
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe(Topic::Jobs);

        let job_id = Uuid::new_v4();
        hub.publish(queued(job_id));

        match sub.recv().await.unwrap() {
            Event::JobQueued { job_id: got, .. } => assert_eq!(got, job_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.publish(queued(Uuid::new_v4()));
        hub.publish(Event::QueueDepth {
            pending: 0,
            in_flight: 0,
            dead_letter: 0,
            robots_online: 0,
        });
    }

    #[tokio::test]
    async fn events_route_to_their_topic() {
        let hub = EventHub::new();
        let mut jobs = hub.subscribe(Topic::Jobs);
        let mut robots = hub.subscribe(Topic::Robots);

        hub.publish(Event::RobotOffline {
            robot_id: Uuid::new_v4(),
        });

        assert!(robots.recv().await.is_some());
        // Nothing arrived on the jobs side.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), jobs.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn slow_jobs_subscriber_is_disconnected() {
        let hub = EventHub::with_capacity(4);
        let mut sub = hub.subscribe(Topic::Jobs);
        assert_eq!(hub.subscriber_count(Topic::Jobs), 1);

        // Never drained: buffer fills, fifth publish drops the subscriber.
        for _ in 0..5 {
            hub.publish(queued(Uuid::new_v4()));
        }
        assert_eq!(hub.subscriber_count(Topic::Jobs), 0);

        // The buffered events are still readable, then the stream ends.
        let mut received = 0;
        while sub.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn slow_metrics_subscriber_drops_oldest_but_stays() {
        let hub = EventHub::with_capacity(4);
        let mut sub = hub.subscribe(Topic::QueueMetrics);

        for pending in 0..10 {
            hub.publish(Event::QueueDepth {
                pending,
                in_flight: 0,
                dead_letter: 0,
                robots_online: 0,
            });
        }

        // Still subscribed; the first events were dropped, recent ones
        // survive.
        let event = sub.recv().await.unwrap();
        match event {
            Event::QueueDepth { pending, .. } => assert!(pending >= 6),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(hub.subscriber_count(Topic::QueueMetrics), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&queued(Uuid::new_v4())).unwrap();
        assert!(json.contains("\"type\":\"job_queued\""));

        let json = serde_json::to_string(&Event::RobotStatus {
            robot_id: Uuid::new_v4(),
            status: RobotStatus::Busy,
            current_job_count: 2,
        })
        .unwrap();
        assert!(json.contains("\"status\":\"busy\""));
    }
}
