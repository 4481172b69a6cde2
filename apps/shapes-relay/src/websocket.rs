use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::AppState;

/// Message types the clients expect wrapped in a `relay` envelope.
const RELAYED_TYPES: &[&str] = &["offer", "answer", "candidate"];

/// Room-scoped fan-out of text frames between connected sockets.
#[derive(Clone, Default)]
pub struct RelayState {
    /// room -> (connection id -> outbound queue)
    rooms: Arc<DashMap<String, DashMap<u64, mpsc::UnboundedSender<String>>>>,
    next_conn: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&self, room: &str, tx: mpsc::UnboundedSender<String>) -> u64 {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn, tx);
        conn
    }

    fn leave(&self, room: &str, conn: u64) {
        let mut remove_room = false;
        if let Some(members) = self.rooms.get(room) {
            members.remove(&conn);
            remove_room = members.is_empty();
        }
        if remove_room {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Returns how many members the frame was queued for.
    fn broadcast_except(&self, room: &str, sender: u64, frame: &str) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter(|member| *member.key() != sender)
            .filter(|member| member.value().send(frame.to_string()).is_ok())
            .count()
    }
}

/// Rewrites a client frame into what the other members receive.
///
/// Negotiation messages are wrapped as `{"relay": <msg>}`; anything else that
/// parses as JSON is forwarded untouched. Unparseable frames are dropped.
pub fn relay_frame(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let wrap = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|kind| RELAYED_TYPES.contains(&kind));
    if wrap {
        Some(json!({ "relay": value }).to_string())
    } else {
        Some(text.to_string())
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room, state.relay))
}

async fn handle_socket(socket: WebSocket, room: String, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = state.join(&room, tx);
    debug!(target: "shapes_relay::ws", room = %room, conn, members = state.room_size(&room), "socket joined");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(target: "shapes_relay::ws", room = %room, conn, error = %err, "socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match relay_frame(&text) {
                Some(frame) => {
                    let delivered = state.broadcast_except(&room, conn, &frame);
                    debug!(target: "shapes_relay::ws", room = %room, conn, delivered, "frame relayed");
                }
                None => debug!(target: "shapes_relay::ws", room = %room, conn, "dropping non-json frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.leave(&room, conn);
    writer.abort();
    debug!(target: "shapes_relay::ws", room = %room, conn, "socket left");
}
