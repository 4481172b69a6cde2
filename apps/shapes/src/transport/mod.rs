use thiserror::Error;

use crate::protocol::{PeerId, SignalingMessage};

pub mod signaling;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("no open data channel")]
    NotConnected,
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound half of the signaling path, as seen by the peer connection.
///
/// Implemented by [`signaling::SignalingClient`]; tests wire two peers together
/// with an in-memory implementation instead.
pub trait SignalSink: Send + Sync {
    fn local_peer(&self) -> &PeerId;
    fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError>;
}
