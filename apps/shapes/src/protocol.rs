use std::fmt;

use capsule_codec::Capsule;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

pub use capsule_codec::now_millis;

/// Label of the single reliable, ordered data channel.
pub const SHAPES_CHANNEL_LABEL: &str = "shapes";
pub const GEOMETRY_BROADCAST_TYPE: &str = "geometry.cgp.v1";

/// Random per-session identifier: 16 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Browser-shaped ICE candidate (`RTCIceCandidateInit` JSON).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Control messages carried as JSON text frames over the signaling socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Presence {
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    Offer {
        sdp: String,
        from: PeerId,
    },
    Answer {
        sdp: String,
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    Candidate {
        candidate: IceCandidate,
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    WsPing {
        from: PeerId,
        to: PeerId,
        ts: u64,
    },
    WsPong {
        from: PeerId,
        to: PeerId,
        ts: u64,
    },
}

impl SignalingMessage {
    pub fn from_peer(&self) -> &PeerId {
        match self {
            SignalingMessage::Presence { from, .. }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::Candidate { from, .. }
            | SignalingMessage::WsPing { from, .. }
            | SignalingMessage::WsPong { from, .. } => from,
        }
    }

    pub fn to_peer(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Presence { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::Candidate { to, .. } => to.as_ref(),
            SignalingMessage::WsPing { to, .. } | SignalingMessage::WsPong { to, .. } => Some(to),
            SignalingMessage::Offer { .. } => None,
        }
    }

    /// Offer, answer and candidate drive the peer connection; the rest is liveness.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::Candidate { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Presence { .. } => "presence",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::WsPing { .. } => "ws-ping",
            SignalingMessage::WsPong { .. } => "ws-pong",
        }
    }
}

/// What a text frame from the relay turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Wrapped in `{ "relay": ... }` by the server.
    Relayed(SignalingMessage),
    Direct(SignalingMessage),
    Geometry { from: Option<PeerId>, data: Value },
    Unknown(Option<String>),
}

pub fn parse_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;
    if let Some(inner) = value.get_mut("relay") {
        let message = serde_json::from_value(inner.take())?;
        return Ok(InboundFrame::Relayed(message));
    }

    let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
    match kind.as_deref() {
        Some(GEOMETRY_BROADCAST_TYPE) => {
            let from = value
                .get("from")
                .and_then(Value::as_str)
                .map(PeerId::from);
            let data = value
                .get_mut("data")
                .map(Value::take)
                .unwrap_or(Value::Null);
            Ok(InboundFrame::Geometry { from, data })
        }
        Some(
            "presence" | "offer" | "answer" | "candidate" | "ws-ping" | "ws-pong",
        ) => Ok(InboundFrame::Direct(serde_json::from_value(value)?)),
        _ => Ok(InboundFrame::Unknown(kind)),
    }
}

/// Messages exchanged over the `shapes` data channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    ShapeHello {
        room: String,
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        forms: Vec<String>,
        policy: String,
    },
    Ping {
        ts: u64,
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Pong {
        ts: u64,
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    ShapeShare {
        note: String,
        ts: u64,
    },
    ShapeCapsule {
        capsule: Capsule,
    },
}
