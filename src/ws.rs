use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::http::AppState;
use crate::protocol::{BufferReport, ClientCommand, ServerEvent};
use crate::room::RoomCommand;

/// Fan-out surface owned by the transport. Rooms address members by
/// connection id and never hold sockets; a send to a gone connection is a
/// no-op.
#[derive(Clone, Default)]
pub struct Publisher {
    senders: Arc<DashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Uuid, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.senders.insert(conn, tx);
    }

    pub fn unregister(&self, conn: Uuid) {
        self.senders.remove(&conn);
    }

    pub fn send_to(&self, conn: Uuid, event: ServerEvent) {
        if let Some(tx) = self.senders.get(&conn) {
            let _ = tx.send(event);
        }
    }

    pub fn send_many(&self, targets: &[Uuid], event: &ServerEvent) {
        for conn in targets {
            if let Some(tx) = self.senders.get(conn) {
                let _ = tx.send(event.clone());
            }
        }
    }
}

pub async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let conn_short = conn_id.to_string()[..8].to_string();
    tracing::info!("↗ Client connected [{}]", conn_short);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.publisher.register(conn_id, tx);

    // Outbound events drain in queue order, so per-connection send order
    // follows room command order.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    tracing::error!("Failed to serialize event: {err}");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // The room this connection most recently joined; disconnect routes there.
    let mut current_room: Option<String> = None;

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                handle_frame(&text, conn_id, &state, &mut current_room).await;
            }
            Ok(WsMessage::Close(_)) => {
                tracing::info!("↙ Client disconnected [{}]", conn_short);
                break;
            }
            Err(err) => {
                tracing::debug!("WebSocket error [{}]: {err}", conn_short);
                break;
            }
            _ => {}
        }
    }

    state.publisher.unregister(conn_id);
    if let Some(room_id) = current_room {
        if let Some(handle) = state.registry.get(&room_id) {
            handle.send(RoomCommand::Disconnect { conn: conn_id });
        }
    }
    send_task.abort();
}

async fn handle_frame(
    text: &str,
    conn: Uuid,
    state: &AppState,
    current_room: &mut Option<String>,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            tracing::debug!("Unparsable frame from {conn}: {err}");
            return;
        }
    };

    match command {
        ClientCommand::Join { room_id, nickname, password, room_name } => {
            let (room_id, handle) =
                state.registry.get_or_create(&room_id, room_name.as_deref(), password.as_deref());
            let (reply_tx, reply_rx) = oneshot::channel();
            handle.send(RoomCommand::Join {
                conn,
                nickname,
                password,
                reply: reply_tx,
            });
            let event = match reply_rx.await {
                Ok(Ok(snapshot)) => {
                    if let Some(previous) = current_room.replace(room_id.clone()) {
                        if previous != room_id {
                            if let Some(old) = state.registry.get(&previous) {
                                old.send(RoomCommand::Disconnect { conn });
                            }
                        }
                    }
                    ServerEvent::JoinResult {
                        ok: true,
                        error: None,
                        snapshot: Some(snapshot),
                        self_id: Some(conn),
                    }
                }
                Ok(Err(err)) => ServerEvent::JoinResult {
                    ok: false,
                    error: Some(err.to_string()),
                    snapshot: None,
                    self_id: Some(conn),
                },
                Err(_) => ServerEvent::JoinResult {
                    ok: false,
                    error: Some("internal".to_string()),
                    snapshot: None,
                    self_id: Some(conn),
                },
            };
            state.publisher.send_to(conn, event);
        }
        ClientCommand::Leave { room_id } => {
            if let Some(handle) = state.registry.get(&room_id) {
                let (reply_tx, reply_rx) = oneshot::channel();
                handle.send(RoomCommand::Leave { conn, reply: reply_tx });
                let _ = reply_rx.await;
            }
            if current_room.as_deref() == Some(crate::clock::normalize_room_id(&room_id).as_str())
                || current_room.as_deref() == Some(room_id.as_str())
            {
                *current_room = None;
            }
            state.publisher.send_to(conn, ServerEvent::LeaveResult { ok: true });
        }
        ClientCommand::SelectMedia { room_id, media } => {
            route(state, &room_id, RoomCommand::SelectMedia { conn, media });
        }
        ClientCommand::PlaybackControl { room_id, position, paused, rate, reason } => {
            route(
                state,
                &room_id,
                RoomCommand::PlaybackControl { conn, position, paused, rate, reason },
            );
        }
        ClientCommand::Buffering {
            room_id,
            buffering,
            buffer_ahead_seconds,
            ready_state,
            can_play_through,
            startup_ready,
        } => {
            let report = BufferReport {
                buffering,
                buffer_ahead_seconds,
                ready_state,
                can_play_through,
                startup_ready,
            };
            route(state, &room_id, RoomCommand::ReportBuffering { conn, report });
        }
        ClientCommand::RequestPlayback { room_id } => {
            route(state, &room_id, RoomCommand::RequestPlayback { conn });
        }
        ClientCommand::RequestSnapshot { room_id } => {
            route(state, &room_id, RoomCommand::RequestSnapshot { conn });
        }
        ClientCommand::Config { room_id, sync_mode } => {
            route(state, &room_id, RoomCommand::SetSyncMode { conn, mode: sync_mode });
        }
    }
}

/// Commands addressed to rooms that do not exist are dropped silently.
fn route(state: &AppState, room_id: &str, command: RoomCommand) {
    if let Some(handle) = state.registry.get(room_id) {
        handle.send(command);
    }
}
