//! WebSocket endpoints: the worker channel and the UI event stream.
//!
//! Both speak JSON text frames. Workers drive their own reconnection;
//! the core tolerates reconnects because dispatch is idempotent on
//! `(subtask, attempt)`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use conductor_core::dispatch::WorkerMessage;
use conductor_core::events::{self, EventKind, Topic};

use super::AppState;

// ---------------------------------------------------------------------------
// Worker channel
// ---------------------------------------------------------------------------

/// `GET /ws/worker`: the bidirectional worker channel.
pub async fn worker_channel(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_worker_socket(state, socket))
}

async fn handle_worker_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut attached_worker: Option<Uuid> = None;
    let mut outbox: Option<tokio::sync::mpsc::Receiver<conductor_core::dispatch::CoreMessage>> =
        None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(frame)) = incoming else {
                    break;
                };
                let Message::Text(text) = frame else {
                    continue;
                };

                let message: WorkerMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(%error, "unparseable worker message");
                        continue;
                    }
                };

                // First registration on this socket attaches the outbox.
                if let WorkerMessage::Register { worker_id, .. } = &message
                    && attached_worker != Some(*worker_id)
                {
                    outbox = Some(state.orchestrator.channels().attach(*worker_id).await);
                    attached_worker = Some(*worker_id);
                }

                if let Err(error) = state.orchestrator.handle_worker_message(message).await {
                    tracing::warn!(%error, "worker message rejected");
                    let notice = serde_json::json!({
                        "type": "error",
                        "error": error.code(),
                        "message": error.message,
                    });
                    if sink.send(Message::Text(notice.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
            dispatched = recv_outbox(&mut outbox) => {
                match dispatched {
                    Some(message) => {
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(error) => {
                                tracing::error!(%error, "failed to serialize dispatch");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(worker_id) = attached_worker {
        state.orchestrator.channels().detach(worker_id).await;
        tracing::info!(worker_id = %worker_id, "worker socket closed");
    }
}

/// Receive from the outbox when attached; otherwise park forever so the
/// select stays driven by the socket alone.
async fn recv_outbox(
    outbox: &mut Option<tokio::sync::mpsc::Receiver<conductor_core::dispatch::CoreMessage>>,
) -> Option<conductor_core::dispatch::CoreMessage> {
    match outbox {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamQuery {
    /// Restrict to one task's topic.
    pub task_id: Option<Uuid>,
    /// Comma-separated event kinds (e.g. `task-update,checkpoint-ready`).
    pub kinds: Option<String>,
}

/// `GET /ws/events`: the multiplexed UI event stream.
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_event_socket(state, query, socket))
}

/// Parse the kind filter; `None` means no filtering.
fn parse_kinds(raw: Option<&str>) -> Option<Vec<EventKind>> {
    let raw = raw?;
    let kinds: Vec<EventKind> = raw
        .split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                return None;
            }
            serde_json::from_value(serde_json::Value::String(trimmed.to_owned())).ok()
        })
        .collect();
    (!kinds.is_empty()).then_some(kinds)
}

async fn handle_event_socket(state: AppState, query: EventStreamQuery, socket: WebSocket) {
    let topic = match query.task_id {
        Some(task_id) => Topic::Task(task_id),
        None => Topic::All,
    };
    let kinds = parse_kinds(query.kinds.as_deref());

    let subscription = state.orchestrator.bus().subscribe(topic);
    let (mut sink, mut stream) = socket.split();
    let mut receiver = subscription.receiver;

    // Serve the replay buffer first so reconnecting clients catch up.
    for event in subscription.replay {
        if !matches_filter(&event.kind, &kinds) {
            continue;
        }
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events::next_event(&mut receiver) => {
                let Some(event) = event else { break };
                // The synthetic catch-up marker always passes the filter.
                if event.kind != EventKind::CatchUpRequired
                    && !matches_filter(&event.kind, &kinds)
                {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                // Clients only ever close; any frame other than close is
                // ignored.
                match incoming {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn matches_filter(kind: &EventKind, kinds: &Option<Vec<EventKind>>) -> bool {
    match kinds {
        Some(kinds) => kinds.contains(kind),
        None => true,
    }
}
