//! Worker session transport: WebSocket at /ws/robot.
//!
//! The upgrade authenticates with a bearer token, the first frame must be
//! `Register`, then the socket splits into a reader (ingress routing) and
//! a writer (egress queue with per-session sequence numbers). Any
//! transport or protocol error tears the session down; reconnection is a
//! fresh upgrade and a fresh `Register`.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kernel::registry::RegistrationRequest;
use crate::kernel::session::{
    OrchestratorFrame, SeqTracker, SessionReceiver, WorkerFrame, WorkerMessage,
};
use crate::server::app::AppState;

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

pub async fn robot_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let credential = match state.orchestrator.robot_tokens.validate(&token).await {
        Ok(credential) => credential,
        Err(e) => {
            debug!(error = %e, "robot upgrade rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    let bound_robot_id = credential.robot_id();

    ws.on_upgrade(move |socket| handle_robot_socket(socket, state, token, bound_robot_id))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    Some(auth.strip_prefix("Bearer ").unwrap_or(auth).to_string())
}

async fn handle_robot_socket(
    mut socket: WebSocket,
    state: AppState,
    token: String,
    bound_robot_id: Option<Uuid>,
) {
    // First frame: Register, within the deadline.
    let first = match tokio::time::timeout(REGISTER_DEADLINE, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            debug!("robot session closed: no register frame in time");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let frame: WorkerFrame = match serde_json::from_str(&first) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "robot session closed: malformed register frame");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let robot_id = frame.robot_id;
    let WorkerMessage::Register {
        name,
        capabilities,
        environment,
        max_concurrent_jobs,
    } = frame.message
    else {
        debug!(robot_id = %robot_id, "robot session closed: first frame was not register");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    // The session binds to exactly one robot id; a token bound to another
    // robot is a protocol error.
    if let Some(bound) = bound_robot_id {
        if bound != robot_id {
            warn!(robot_id = %robot_id, bound = %bound, "register under foreign token rejected");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    if let Err(e) = state
        .orchestrator
        .registry
        .register(RegistrationRequest {
            robot_id,
            token,
            name,
            capabilities,
            environment,
            max_concurrent_jobs,
        })
        .await
    {
        warn!(robot_id = %robot_id, error = %e, "registration failed");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let SessionReceiver {
        session_id,
        mut rx,
        cancel,
    } = state.orchestrator.sessions.attach(robot_id);
    info!(robot_id = %robot_id, "robot session established");

    let (mut sink, mut stream) = socket.split();

    // writer: egress queue -> socket, stamping the session sequence.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            let message = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            seq += 1;
            let frame = OrchestratorFrame {
                seq,
                robot_id,
                message,
            };
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // reader: socket -> ingress router.
    let mut tracker = SeqTracker::new();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(robot_id = %robot_id, error = %e, "robot socket error");
                    break;
                }
                None => break,
            },
        };
        match message {
            Message::Text(text) => {
                let frame: WorkerFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(robot_id = %robot_id, error = %e, "malformed frame, closing session");
                        break;
                    }
                };
                if frame.robot_id != robot_id {
                    warn!(robot_id = %robot_id, frame_robot = %frame.robot_id,
                          "frame identity mismatch, closing session");
                    break;
                }
                // Reconnect replays resend old sequence numbers.
                if !tracker.accept(frame.seq) {
                    continue;
                }
                let is_heartbeat = matches!(frame.message, WorkerMessage::Heartbeat { .. });
                if let Err(e) = state.orchestrator.ingress.handle(robot_id, frame.message).await {
                    if is_heartbeat {
                        // Offline robots must re-register; end the session.
                        warn!(robot_id = %robot_id, error = %e, "heartbeat rejected, closing session");
                        break;
                    }
                    debug!(robot_id = %robot_id, error = %e, "ingress message rejected");
                }
            }
            Message::Close(_) => break,
            // Protocol pings are answered by the transport; heartbeats are
            // the application keepalive.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    cancel.cancel();
    state.orchestrator.sessions.detach(robot_id, session_id);
    let _ = writer.await;
    info!(robot_id = %robot_id, "robot session closed");
}
