use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_codec::{Capsule, CapsuleError, encrypt_anchors, export_file_name};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::mesh::{MeshPublisher, PublishError};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::protocol::{ChannelMessage, PeerId, now_millis};
use crate::transport::signaling::{SignalingClient, SignalingEvent};
use crate::transport::webrtc::{
    HelloAnnouncement, PeerConnectionManager, PeerEvent, PeerOptions, PeerState, WebRtcConfig,
};
use crate::transport::{SignalSink, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Capsule(#[from] CapsuleError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-facing events of a joined room.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Connected {
        remote: Option<PeerId>,
    },
    Hello {
        peer_id: PeerId,
        room: String,
        forms: Vec<String>,
        policy: String,
    },
    Share {
        note: String,
        ts: u64,
    },
    Capsule(Capsule),
    Geometry {
        from: Option<PeerId>,
        data: Value,
    },
    ChannelClosed,
    Disconnected,
}

#[derive(Clone, Debug, Default)]
pub struct ShareOptions {
    /// Encrypt anchors with this passphrase before sending.
    pub passphrase: Option<String>,
    /// Sign `canonicalize(data)` with this secret.
    pub secret: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Channel,
    Mesh,
    Undelivered,
}

/// A capsule after the best-effort encrypt and sign steps.
#[derive(Clone, Debug)]
pub struct SealedCapsule {
    pub capsule: Capsule,
    pub anchors_encrypted: usize,
    pub anchor_failures: usize,
}

impl SealedCapsule {
    pub fn is_signed(&self) -> bool {
        self.capsule.is_signed()
    }
}

#[derive(Clone, Debug)]
pub struct ShareOutcome {
    pub sealed: SealedCapsule,
    pub delivery: Delivery,
}

/// Build a capsule from `data`. Encryption and signing failures are logged
/// and the capsule goes out with whatever succeeded.
pub async fn seal_capsule(data: Value, from: Option<&PeerId>, options: &ShareOptions) -> SealedCapsule {
    let mut data = data;
    let mut anchors_encrypted = 0;
    let mut anchor_failures = 0;

    if let Some(passphrase) = options.passphrase.clone() {
        let fallback = data.clone();
        let job = tokio::task::spawn_blocking(move || {
            let mut payload = data;
            let report = encrypt_anchors(&mut payload, &passphrase);
            (payload, report)
        });
        match job.await {
            Ok((payload, report)) => {
                anchors_encrypted = report.processed;
                anchor_failures = report.failures.len();
                data = payload;
            }
            Err(err) => {
                tracing::warn!(target: "shapes::capsule", error = %err, "encrypt failed");
                data = fallback;
            }
        }
    }

    let mut capsule = Capsule::new(data);
    if let Some(peer) = from {
        capsule = capsule.with_from(peer.as_str());
    }
    if let Some(secret) = &options.secret {
        if let Err(err) = capsule.sign(secret) {
            tracing::warn!(target: "shapes::capsule", error = %err, "sign failed");
        }
    }

    SealedCapsule {
        capsule,
        anchors_encrypted,
        anchor_failures,
    }
}

/// Write `{type: "shape-capsule", capsule}` as `shape-capsule-<ms>.json`.
pub async fn save_capsule(dir: &Path, capsule: &Capsule) -> Result<PathBuf, SessionError> {
    let text = capsule.export().to_json_pretty()?;
    let path = dir.join(export_file_name(now_millis()));
    tokio::fs::write(&path, text).await?;
    tracing::info!(target: "shapes::capsule", path = %path.display(), "capsule saved");
    Ok(path)
}

/// One client in one room: signaling socket, peer connection and mesh
/// fallback wired together.
pub struct MeshSession {
    config: Config,
    presence: Arc<PresenceTracker>,
    signaling: Arc<SignalingClient>,
    peer: Arc<PeerConnectionManager>,
    publisher: MeshPublisher,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshSession {
    pub async fn join(config: Config) -> Result<Self, SessionError> {
        let publisher = MeshPublisher::new(&config.mesh_url, config.publish_timeout)?;
        let presence = Arc::new(PresenceTracker::new(config.presence.clone()));
        let signaling = SignalingClient::connect(&config, &config.room, Arc::clone(&presence)).await?;

        let options = PeerOptions {
            webrtc: WebRtcConfig::from_config(&config),
            hello: HelloAnnouncement {
                room: config.room.clone(),
                forms: config.hello_forms.clone(),
                policy: config.hello_policy.clone(),
            },
            ping_interval: config.channel_ping_interval,
        };
        let sink: Arc<dyn SignalSink> = signaling.clone();
        let peer = Arc::new(PeerConnectionManager::new(sink, Arc::clone(&presence), options).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        if let Some(mut signaling_events) = signaling.take_events().await {
            let peer = Arc::clone(&peer);
            let events_tx = events_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = signaling_events.recv().await {
                    match event {
                        SignalingEvent::Negotiation(message) => {
                            let kind = message.kind();
                            if let Err(err) = peer.handle_signal(message).await {
                                tracing::warn!(target: "shapes::session", kind, error = %err, "negotiation step failed");
                            }
                        }
                        SignalingEvent::Geometry { from, data } => {
                            let _ = events_tx.send(SessionEvent::Geometry { from, data });
                        }
                        SignalingEvent::Disconnected => {
                            let _ = events_tx.send(SessionEvent::Disconnected);
                        }
                    }
                }
            }));
        }

        if let Some(mut peer_events) = peer.take_events() {
            tasks.push(tokio::spawn(async move {
                while let Some(event) = peer_events.recv().await {
                    let mapped = match event {
                        PeerEvent::ChannelOpen { remote } => SessionEvent::Connected { remote },
                        PeerEvent::Hello {
                            room,
                            peer_id,
                            forms,
                            policy,
                        } => SessionEvent::Hello {
                            peer_id,
                            room,
                            forms,
                            policy,
                        },
                        PeerEvent::Share { note, ts } => SessionEvent::Share { note, ts },
                        PeerEvent::Capsule(capsule) => SessionEvent::Capsule(capsule),
                        PeerEvent::ChannelClosed => SessionEvent::ChannelClosed,
                    };
                    if events_tx.send(mapped).is_err() {
                        break;
                    }
                }
            }));
        }

        peer.start().await?;
        tracing::info!(
            target: "shapes::session",
            room = %config.room,
            peer = %signaling.peer_id(),
            "joined room"
        );

        Ok(Self {
            config,
            presence,
            signaling,
            peer,
            publisher,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.signaling.peer_id()
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    pub fn peer_state(&self) -> PeerState {
        self.peer.state()
    }

    pub fn is_channel_open(&self) -> bool {
        self.peer.is_open()
    }

    pub fn is_signaling_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    pub fn presence(&self) -> HashMap<PeerId, PresenceEntry> {
        self.presence.snapshot()
    }

    /// Seal `data` and deliver it over the data channel, or through the mesh
    /// endpoint when no channel is open.
    pub async fn share_capsule(&self, data: Value, options: &ShareOptions) -> ShareOutcome {
        let sealed = seal_capsule(data, Some(self.peer_id()), options).await;
        let delivery = self.deliver(&sealed.capsule).await;
        ShareOutcome { sealed, delivery }
    }

    async fn deliver(&self, capsule: &Capsule) -> Delivery {
        if self.peer.is_open() {
            let message = ChannelMessage::ShapeCapsule {
                capsule: capsule.clone(),
            };
            match self.peer.send(&message).await {
                Ok(()) => {
                    tracing::info!(target: "shapes::session", "capsule sent over data channel");
                    return Delivery::Channel;
                }
                Err(err) => {
                    tracing::warn!(target: "shapes::session", error = %err, "channel send failed; using mesh");
                }
            }
        }
        if self.publisher.publish(capsule).await {
            Delivery::Mesh
        } else {
            Delivery::Undelivered
        }
    }

    pub async fn share_note(&self, note: impl Into<String>) -> Result<(), SessionError> {
        let message = ChannelMessage::ShapeShare {
            note: note.into(),
            ts: now_millis(),
        };
        self.peer.send(&message).await?;
        Ok(())
    }

    pub async fn save_capsule(&self, dir: &Path, capsule: &Capsule) -> Result<PathBuf, SessionError> {
        save_capsule(dir, capsule).await
    }

    pub async fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.peer.close().await;
        self.signaling.close();
        tracing::info!(target: "shapes::session", room = %self.config.room, "left room");
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
