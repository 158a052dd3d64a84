//! Observer streaming endpoints.
//!
//! One WebSocket per subscription: /ws/live-jobs, /ws/robot-status,
//! /ws/queue-metrics, /ws/activity. Events are forwarded as JSON text
//! frames; an application-level "ping" text gets a "pong" back. A
//! subscriber that falls behind on a state topic is disconnected by the
//! hub and sees its stream end.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::kernel::events::{Subscription, Topic};
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// JWT passed as a query param; browsers cannot set headers on
    /// WebSocket upgrades.
    token: Option<String>,
}

pub async fn live_jobs(
    state: State<AppState>,
    ws: WebSocketUpgrade,
    query: Query<StreamQuery>,
) -> Response {
    observer_stream(state, ws, query, Topic::Jobs)
}

pub async fn robot_status(
    state: State<AppState>,
    ws: WebSocketUpgrade,
    query: Query<StreamQuery>,
) -> Response {
    observer_stream(state, ws, query, Topic::Robots)
}

pub async fn queue_metrics(
    state: State<AppState>,
    ws: WebSocketUpgrade,
    query: Query<StreamQuery>,
) -> Response {
    observer_stream(state, ws, query, Topic::QueueMetrics)
}

pub async fn activity(
    state: State<AppState>,
    ws: WebSocketUpgrade,
    query: Query<StreamQuery>,
) -> Response {
    observer_stream(state, ws, query, Topic::Activity)
}

fn observer_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    topic: Topic,
) -> Response {
    // A presented token must verify; the deployment's edge decides
    // whether anonymous observers are reachable at all.
    if let Some(token) = &query.token {
        if state.orchestrator.jwt.verify_token(token).is_err() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let subscription = state.orchestrator.events.subscribe(topic);
    ws.on_upgrade(move |socket| run_observer(socket, subscription, topic))
}

async fn run_observer(mut socket: WebSocket, mut subscription: Subscription, topic: Topic) {
    debug!(topic = topic.as_str(), "observer connected");
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    // Hub dropped us (slow consumer) or is shutting down.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!(topic = topic.as_str(), "observer disconnected");
}
