use std::sync::Arc;

use capsule_codec::decrypt_anchors;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{SignalSink, TransportError};
use crate::config::Config;
use crate::presence::{PresenceTracker, RttPath};
use crate::protocol::{InboundFrame, PeerId, SignalingMessage, now_millis, parse_inbound};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingStatus {
    Connected,
    Disconnected,
}

/// What the signaling socket hands upward.
#[derive(Clone, Debug)]
pub enum SignalingEvent {
    /// Offer, answer or candidate for the peer connection.
    Negotiation(SignalingMessage),
    /// A `geometry.cgp.v1` broadcast, anchors already decrypted when a viewer
    /// passphrase is configured.
    Geometry { from: Option<PeerId>, data: Value },
    Disconnected,
}

/// State shared with the socket tasks. Kept apart from [`SignalingClient`] so
/// the tasks never keep the client alive.
struct Shared {
    peer_id: PeerId,
    send_tx: mpsc::UnboundedSender<SignalingMessage>,
    presence: Arc<PresenceTracker>,
    viewer_passphrase: Option<String>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    status_tx: watch::Sender<SignalingStatus>,
}

pub struct SignalingClient {
    shared: Arc<Shared>,
    room: String,
    url: Url,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    pub async fn connect(
        config: &Config,
        room: &str,
        presence: Arc<PresenceTracker>,
    ) -> Result<Arc<Self>, TransportError> {
        Self::connect_as(config, room, PeerId::generate(), presence).await
    }

    pub async fn connect_as(
        config: &Config,
        room: &str,
        peer_id: PeerId,
        presence: Arc<PresenceTracker>,
    ) -> Result<Arc<Self>, TransportError> {
        let url = derive_websocket_url(&config.signaling_url, room)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::WebSocket(format!("connect failed: {err}")))?;
        tracing::debug!(
            target: "shapes::signaling",
            url = %url,
            peer = %peer_id,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let (status_tx, _) = watch::channel(SignalingStatus::Connected);

        let shared = Arc::new(Shared {
            peer_id,
            send_tx,
            presence,
            viewer_passphrase: config.viewer_passphrase.clone(),
            events_tx,
            status_tx,
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "shapes::signaling", kind = message.kind(), error = %err, "encode failed");
                        continue;
                    }
                };
                tracing::trace!(target: "shapes::signaling", event = "ws_out", kind = message.kind(), len = text.len());
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target: "shapes::signaling", event = "ws_in", kind = "text", len = text.len());
                        reader_shared.handle_text(&text);
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::trace!(target: "shapes::signaling", event = "ws_in", kind = "binary", len = data.len());
                        match String::from_utf8(data) {
                            Ok(text) => reader_shared.handle_text(&text),
                            Err(_) => tracing::debug!(target: "shapes::signaling", "dropping non-utf8 frame"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "shapes::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "shapes::signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            reader_shared.mark_disconnected();
        });

        let ping_shared = Arc::clone(&shared);
        let ping_interval = config.ws_ping_interval;
        let ping_handle = tokio::spawn(async move {
            let mut status = ping_shared.status_tx.subscribe();
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = status.changed() => {
                        if changed.is_err() || *status.borrow() == SignalingStatus::Disconnected {
                            break;
                        }
                        continue;
                    }
                }
                if !ping_shared.ping_known_peers() {
                    break;
                }
            }
            tracing::debug!(target: "shapes::signaling", "ws ping loop stopped");
        });

        let client = Arc::new(SignalingClient {
            shared,
            room: room.to_string(),
            url,
            events_rx: AsyncMutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![writer_handle, reader_handle, ping_handle]),
        });

        client.send(SignalingMessage::Presence {
            from: client.shared.peer_id.clone(),
            to: None,
        })?;
        tracing::debug!(target: "shapes::signaling", room = %client.room, "presence announced");
        Ok(client)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.shared.presence
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.status_tx.borrow() == SignalingStatus::Connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SignalingStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Hand out the event stream. Only the first caller gets it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().await.take()
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.shared.send(message)
    }

    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.shared.mark_disconnected();
    }
}

impl SignalSink for SignalingClient {
    fn local_peer(&self) -> &PeerId {
        self.peer_id()
    }

    fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.send(message)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Shared {
    fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.send_tx
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn mark_disconnected(&self) {
        let changed = self.status_tx.send_if_modified(|status| {
            let was_connected = *status == SignalingStatus::Connected;
            *status = SignalingStatus::Disconnected;
            was_connected
        });
        if changed {
            tracing::info!(target: "shapes::signaling", "signaling disconnected");
            let _ = self.events_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// One ws-ping round. Returns `false` once the writer is gone.
    fn ping_known_peers(&self) -> bool {
        self.presence.prune_stale();
        let ts = now_millis();
        for peer in self.presence.known_peers() {
            let ping = SignalingMessage::WsPing {
                from: self.peer_id.clone(),
                to: peer,
                ts,
            };
            if self.send(ping).is_err() {
                return false;
            }
        }
        true
    }

    fn handle_text(&self, text: &str) {
        let frame = match parse_inbound(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target: "shapes::signaling", error = %err, len = text.len(), "malformed signaling frame");
                return;
            }
        };
        match frame {
            InboundFrame::Relayed(message) | InboundFrame::Direct(message) => self.dispatch(message),
            InboundFrame::Geometry { from, data } => self.handle_geometry(from, data),
            InboundFrame::Unknown(kind) => {
                tracing::trace!(target: "shapes::signaling", kind = ?kind, "ignoring unknown frame");
            }
        }
    }

    fn dispatch(&self, message: SignalingMessage) {
        if message.from_peer() == &self.peer_id {
            tracing::trace!(target: "shapes::signaling", kind = message.kind(), "dropping self echo");
            return;
        }
        if let Some(to) = message.to_peer() {
            if to != &self.peer_id {
                return;
            }
        }

        match message {
            SignalingMessage::Presence { from, to } => {
                let is_new = self.presence.register(&from);
                if is_new && to.is_none() {
                    let reply = SignalingMessage::Presence {
                        from: self.peer_id.clone(),
                        to: Some(from),
                    };
                    if let Err(err) = self.send(reply) {
                        tracing::debug!(target: "shapes::signaling", error = %err, "presence reply failed");
                    }
                }
            }
            SignalingMessage::WsPing { from, ts, .. } => {
                let pong = SignalingMessage::WsPong {
                    from: self.peer_id.clone(),
                    to: from,
                    ts,
                };
                if let Err(err) = self.send(pong) {
                    tracing::debug!(target: "shapes::signaling", error = %err, "ws-pong failed");
                }
            }
            SignalingMessage::WsPong { from, ts, .. } => {
                let rtt = now_millis().saturating_sub(ts);
                self.presence.record_rtt(&from, rtt, RttPath::Signaling);
            }
            negotiation => {
                tracing::debug!(
                    target: "shapes::signaling",
                    kind = negotiation.kind(),
                    from = %negotiation.from_peer(),
                    "negotiation message received"
                );
                let _ = self.events_tx.send(SignalingEvent::Negotiation(negotiation));
            }
        }
    }

    fn handle_geometry(&self, from: Option<PeerId>, data: Value) {
        if from.as_ref() == Some(&self.peer_id) {
            return;
        }
        let Some(passphrase) = self.viewer_passphrase.clone() else {
            let _ = self.events_tx.send(SignalingEvent::Geometry { from, data });
            return;
        };
        // Key derivation is CPU bound; the result is delivered even if the
        // socket has closed in the meantime.
        let events_tx = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let pass = decrypt_anchors(&data, &passphrase);
            if !pass.report.is_clean() {
                tracing::warn!(
                    target: "shapes::signaling",
                    failures = pass.report.failures.len(),
                    "geometry anchors left encrypted"
                );
            }
            let _ = events_tx.send(SignalingEvent::Geometry {
                from,
                data: pass.payload,
            });
        });
    }
}

/// `<base>/ws/signaling/<room>`, with `http(s)` mapped to `ws(s)`.
pub fn derive_websocket_url(signaling_url: &str, room: &str) -> Result<Url, TransportError> {
    let base = Url::parse(signaling_url).map_err(|err| {
        TransportError::Setup(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    if room.is_empty() {
        return Err(TransportError::Setup("room must not be empty".into()));
    }
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling scheme: {other}"
            )));
        }
    };

    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    ws.path_segments_mut()
        .map_err(|_| TransportError::Setup("signaling url cannot be a base".into()))?
        .pop_if_empty()
        .extend(["ws", "signaling", room]);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}
