use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{Config, DEFAULT_STUN_URL};
use crate::protocol::SHAPES_CHANNEL_LABEL;

/// Configuration for the peer connection and its data channel
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub data_channel_label: String,
    /// Whether the data channel should be ordered
    pub ordered: bool,
    /// Gather loopback candidates (same-host peers, tests)
    pub include_loopback: bool,
    /// Upper bound on remote candidates held before a remote description exists
    pub max_pending_candidates: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            data_channel_label: SHAPES_CHANNEL_LABEL.to_string(),
            ordered: true,
            include_loopback: false,
            max_pending_candidates: 64,
        }
    }
}

impl WebRtcConfig {
    /// A missing STUN URL means localhost-only ICE.
    pub fn from_config(config: &Config) -> Self {
        match &config.stun_url {
            Some(url) => Self {
                ice_servers: vec![RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                }],
                ..Default::default()
            },
            None => Self::localhost(),
        }
    }

    /// Create a localhost-only configuration (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            include_loopback: true,
            ..Default::default()
        }
    }
}
