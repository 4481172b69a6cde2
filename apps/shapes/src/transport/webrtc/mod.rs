use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_codec::Capsule;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{SignalSink, TransportError};
use crate::presence::{PresenceTracker, RttPath};
use crate::protocol::{ChannelMessage, IceCandidate, PeerId, SignalingMessage, now_millis};

pub mod config;

pub use config::WebRtcConfig;

/// Negotiation state of the single peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    /// Local offer sent, waiting for an answer.
    Offering,
    /// Remote offer answered, waiting for the channel to open.
    Negotiating,
    Connected,
    Closed,
}

/// Contents of the `shape-hello` sent when the channel opens.
#[derive(Clone, Debug)]
pub struct HelloAnnouncement {
    pub room: String,
    pub forms: Vec<String>,
    pub policy: String,
}

#[derive(Clone, Debug)]
pub struct PeerOptions {
    pub webrtc: WebRtcConfig,
    pub hello: HelloAnnouncement,
    pub ping_interval: Duration,
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    ChannelOpen {
        remote: Option<PeerId>,
    },
    Hello {
        room: String,
        peer_id: PeerId,
        forms: Vec<String>,
        policy: String,
    },
    Share {
        note: String,
        ts: u64,
    },
    Capsule(Capsule),
    ChannelClosed,
}

/// Everything the peer connection callbacks need. Callbacks hold it weakly so
/// dropping the manager releases it.
struct Context {
    sink: Arc<dyn SignalSink>,
    presence: Arc<PresenceTracker>,
    options: PeerOptions,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    state_tx: watch::Sender<PeerState>,
    /// Bumped on every rebuild; callbacks from older connections are ignored.
    generation: AtomicU64,
    channel: RwLock<Option<Arc<RTCDataChannel>>>,
    remote_peer: RwLock<Option<PeerId>>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    open_channels: AtomicUsize,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

struct Negotiation {
    pc: Arc<RTCPeerConnection>,
    pending_candidates: VecDeque<(PeerId, RTCIceCandidateInit)>,
}

/// Owns one `RTCPeerConnection` and its `shapes` data channel, and drives the
/// offer/answer/candidate exchange through a [`SignalSink`].
pub struct PeerConnectionManager {
    ctx: Arc<Context>,
    negotiation: AsyncMutex<Negotiation>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl PeerConnectionManager {
    pub async fn new(
        sink: Arc<dyn SignalSink>,
        presence: Arc<PresenceTracker>,
        options: PeerOptions,
    ) -> Result<Self, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PeerState::Idle);
        let ctx = Arc::new(Context {
            sink,
            presence,
            options,
            events_tx,
            state_tx,
            generation: AtomicU64::new(0),
            channel: RwLock::new(None),
            remote_peer: RwLock::new(None),
            local_candidates: Mutex::new(Vec::new()),
            open_channels: AtomicUsize::new(0),
            ping_task: Mutex::new(None),
        });
        let pc = build_peer_connection(&ctx, true).await?;
        Ok(Self {
            ctx,
            negotiation: AsyncMutex::new(Negotiation {
                pc,
                pending_candidates: VecDeque::new(),
            }),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        self.ctx.local_peer()
    }

    pub fn remote_peer(&self) -> Option<PeerId> {
        self.ctx.remote_peer.read().clone()
    }

    pub fn state(&self) -> PeerState {
        self.ctx.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeerState> {
        self.ctx.state_tx.subscribe()
    }

    /// Number of data channels currently open.
    pub fn open_channels(&self) -> usize {
        self.ctx.open_channels.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.ctx
            .channel
            .read()
            .as_ref()
            .is_some_and(|channel| channel.ready_state() == RTCDataChannelState::Open)
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    pub async fn pending_candidates(&self) -> usize {
        self.negotiation.lock().await.pending_candidates.len()
    }

    /// `Idle -> Offering`: create and send the local offer.
    pub async fn start(&self) -> Result<(), TransportError> {
        let neg = self.negotiation.lock().await;
        if self.state() != PeerState::Idle {
            tracing::debug!(target: "shapes::webrtc", state = ?self.state(), "start ignored");
            return Ok(());
        }
        let offer = neg.pc.create_offer(None).await?;
        neg.pc.set_local_description(offer.clone()).await?;
        self.ctx.set_state(PeerState::Offering);
        self.ctx.sink.send_signal(SignalingMessage::Offer {
            sdp: offer.sdp,
            from: self.local_peer().clone(),
        })?;
        tracing::debug!(target: "shapes::webrtc", peer = %self.local_peer(), "offer sent");
        Ok(())
    }

    /// Feed one inbound signaling message. Protocol violations are logged and
    /// dropped; only WebRTC failures come back as errors.
    pub async fn handle_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let local = self.local_peer();
        let from = message.from_peer().clone();
        if &from == local {
            tracing::trace!(target: "shapes::webrtc", kind = message.kind(), "ignoring self echo");
            return Ok(());
        }
        if message.to_peer().is_some_and(|to| to != local) {
            return Ok(());
        }
        if let Some(remote) = self.remote_peer() {
            if remote != from {
                tracing::debug!(
                    target: "shapes::webrtc",
                    remote = %remote,
                    from = %from,
                    kind = message.kind(),
                    "ignoring signal from second peer"
                );
                return Ok(());
            }
        }

        let mut neg = self.negotiation.lock().await;
        match message {
            SignalingMessage::Offer { sdp, .. } => self.on_remote_offer(&mut neg, sdp, from).await,
            SignalingMessage::Answer { sdp, .. } => self.on_remote_answer(&mut neg, sdp, from).await,
            SignalingMessage::Candidate { candidate, .. } => {
                self.on_remote_candidate(&mut neg, candidate.into(), from)
                    .await;
                Ok(())
            }
            other => {
                tracing::trace!(target: "shapes::webrtc", kind = other.kind(), "not a negotiation message");
                Ok(())
            }
        }
    }

    async fn on_remote_offer(
        &self,
        neg: &mut Negotiation,
        sdp: String,
        from: PeerId,
    ) -> Result<(), TransportError> {
        let state = self.state();
        match state {
            PeerState::Idle | PeerState::Offering => {}
            PeerState::Negotiating | PeerState::Connected | PeerState::Closed => {
                tracing::warn!(target: "shapes::webrtc", from = %from, ?state, "offer ignored");
                return Ok(());
            }
        }
        if neg.pc.remote_description().await.is_some() {
            tracing::warn!(target: "shapes::webrtc", from = %from, "second offer ignored");
            return Ok(());
        }
        if state == PeerState::Offering && !self.ctx.is_polite_towards(&from) {
            // Both sides offered; the peer with the lower id yields. Re-send
            // ours so a peer that joined after our first offer still sees it.
            tracing::debug!(target: "shapes::webrtc", from = %from, "glare: keeping local offer");
            if let Some(local) = neg.pc.local_description().await {
                self.ctx.sink.send_signal(SignalingMessage::Offer {
                    sdp: local.sdp,
                    from: self.local_peer().clone(),
                })?;
            }
            return Ok(());
        }

        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(offer) => offer,
            Err(err) => {
                tracing::warn!(target: "shapes::webrtc", from = %from, error = %err, "malformed offer dropped");
                return Ok(());
            }
        };

        // Answer on a fresh connection without a local channel; the remote
        // `shapes` channel arrives through on_data_channel.
        self.rebuild(neg, false).await?;
        let answer = match answer_offer(&neg.pc, offer).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target: "shapes::webrtc", from = %from, error = %err, "offer rejected");
                self.restore(neg, state).await?;
                return Ok(());
            }
        };
        self.ctx.lock_remote(&from);
        self.ctx.set_state(PeerState::Negotiating);
        self.ctx.sink.send_signal(SignalingMessage::Answer {
            sdp: answer.sdp,
            from: self.local_peer().clone(),
            to: Some(from.clone()),
        })?;
        tracing::debug!(target: "shapes::webrtc", to = %from, "answer sent");
        self.flush_candidates(neg, &from).await;
        Ok(())
    }

    async fn on_remote_answer(
        &self,
        neg: &mut Negotiation,
        sdp: String,
        from: PeerId,
    ) -> Result<(), TransportError> {
        let state = self.state();
        if state != PeerState::Offering {
            tracing::warn!(target: "shapes::webrtc", from = %from, ?state, "unexpected answer ignored");
            return Ok(());
        }
        if neg.pc.remote_description().await.is_some() {
            tracing::warn!(target: "shapes::webrtc", from = %from, "duplicate answer ignored");
            return Ok(());
        }
        neg.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        self.ctx.lock_remote(&from);
        self.ctx.set_state(PeerState::Connected);
        tracing::debug!(target: "shapes::webrtc", from = %from, "answer applied");
        self.flush_candidates(neg, &from).await;
        Ok(())
    }

    async fn on_remote_candidate(
        &self,
        neg: &mut Negotiation,
        candidate: RTCIceCandidateInit,
        from: PeerId,
    ) {
        if self.state() == PeerState::Closed {
            return;
        }
        if neg.pc.remote_description().await.is_none() {
            let max = self.ctx.options.webrtc.max_pending_candidates;
            if neg.pending_candidates.len() >= max {
                neg.pending_candidates.pop_front();
                tracing::warn!(target: "shapes::webrtc", max, "candidate queue full; dropped oldest");
            }
            neg.pending_candidates.push_back((from, candidate));
            tracing::trace!(
                target: "shapes::webrtc",
                queued = neg.pending_candidates.len(),
                "candidate queued until remote description"
            );
            return;
        }
        if let Err(err) = neg.pc.add_ice_candidate(candidate).await {
            tracing::warn!(target: "shapes::webrtc", from = %from, error = %err, "add ice candidate failed");
        }
    }

    async fn flush_candidates(&self, neg: &mut Negotiation, remote: &PeerId) {
        let pending = std::mem::take(&mut neg.pending_candidates);
        for (from, candidate) in pending {
            if &from != remote {
                continue;
            }
            if let Err(err) = neg.pc.add_ice_candidate(candidate).await {
                tracing::warn!(target: "shapes::webrtc", from = %from, error = %err, "add ice candidate failed");
            }
        }
    }

    /// Put back an offering-capable connection after a failed answer. A
    /// pending local offer is re-created and re-sent on the new connection.
    async fn restore(&self, neg: &mut Negotiation, prior: PeerState) -> Result<(), TransportError> {
        self.rebuild(neg, true).await?;
        if prior == PeerState::Offering {
            let offer = neg.pc.create_offer(None).await?;
            neg.pc.set_local_description(offer.clone()).await?;
            self.ctx.sink.send_signal(SignalingMessage::Offer {
                sdp: offer.sdp,
                from: self.local_peer().clone(),
            })?;
            tracing::debug!(target: "shapes::webrtc", "local offer re-sent after rejected remote offer");
        }
        Ok(())
    }

    async fn rebuild(&self, neg: &mut Negotiation, with_channel: bool) -> Result<(), TransportError> {
        self.ctx.channel.write().take();
        self.ctx.local_candidates.lock().clear();
        let fresh = build_peer_connection(&self.ctx, with_channel).await?;
        let stale = std::mem::replace(&mut neg.pc, fresh);
        if let Err(err) = stale.close().await {
            tracing::debug!(target: "shapes::webrtc", error = %err, "closing replaced peer connection failed");
        }
        Ok(())
    }

    /// Send one message over the open data channel.
    pub async fn send(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        self.ctx.send(message).await
    }

    /// `any -> Closed`. Stops the ping loop and closes channel and connection.
    pub async fn close(&self) {
        self.ctx.set_state(PeerState::Closed);
        self.ctx.stop_ping();
        let channel = self.ctx.channel.write().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                tracing::debug!(target: "shapes::webrtc", error = %err, "data channel close failed");
            }
        }
        let mut neg = self.negotiation.lock().await;
        neg.pending_candidates.clear();
        if let Err(err) = neg.pc.close().await {
            tracing::debug!(target: "shapes::webrtc", error = %err, "peer connection close failed");
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.ctx.stop_ping();
        if self.state() == PeerState::Closed {
            return;
        }
        self.ctx.set_state(PeerState::Closed);
        let pc = Arc::clone(&self.negotiation.get_mut().pc);
        let channel = self.ctx.channel.write().take();
        // Without a runtime there is nothing left to drive the close.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Some(channel) = channel {
                let _ = channel.close().await;
            }
            if let Err(err) = pc.close().await {
                tracing::debug!(target: "shapes::webrtc", error = %err, "peer connection close on drop failed");
            }
        });
    }
}

impl Context {
    fn local_peer(&self) -> &PeerId {
        self.sink.local_peer()
    }

    fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    /// `Closed` is terminal.
    fn set_state(&self, next: PeerState) {
        self.state_tx.send_if_modified(|state| {
            if *state == PeerState::Closed || *state == next {
                return false;
            }
            tracing::debug!(target: "shapes::webrtc", from = ?*state, to = ?next, "peer state");
            *state = next;
            true
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn is_polite_towards(&self, remote: &PeerId) -> bool {
        self.local_peer() < remote
    }

    /// Pin the single remote peer and re-send our candidates to it directly.
    fn lock_remote(&self, peer: &PeerId) {
        {
            let mut remote = self.remote_peer.write();
            if remote.is_some() {
                return;
            }
            *remote = Some(peer.clone());
        }
        tracing::debug!(target: "shapes::webrtc", remote = %peer, "remote peer locked");
        let candidates = self.local_candidates.lock().clone();
        for candidate in candidates {
            self.send_candidate(candidate, Some(peer.clone()));
        }
    }

    fn announce_candidate(&self, candidate: IceCandidate) {
        self.local_candidates.lock().push(candidate.clone());
        let to = self.remote_peer.read().clone();
        self.send_candidate(candidate, to);
    }

    fn send_candidate(&self, candidate: IceCandidate, to: Option<PeerId>) {
        let message = SignalingMessage::Candidate {
            candidate,
            from: self.local_peer().clone(),
            to,
        };
        if let Err(err) = self.sink.send_signal(message) {
            tracing::debug!(target: "shapes::webrtc", error = %err, "candidate not sent");
        }
    }

    async fn send(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        let channel = self
            .channel
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        send_on(&channel, message).await
    }

    fn stop_ping(&self) {
        if let Some(handle) = self.ping_task.lock().take() {
            handle.abort();
        }
    }

    fn start_ping_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.options.ping_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                let ping = ChannelMessage::Ping {
                    ts: now_millis(),
                    peer_id: ctx.local_peer().clone(),
                };
                if let Err(err) = ctx.send(&ping).await {
                    tracing::debug!(target: "shapes::webrtc", error = %err, "channel ping loop stopped");
                    break;
                }
            }
        });
        if let Some(previous) = self.ping_task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn channel_opened(
        self: &Arc<Self>,
        channel: &Arc<RTCDataChannel>,
        generation: u64,
        opened: &AtomicBool,
    ) {
        if !self.is_current(generation) || self.state() == PeerState::Closed {
            return;
        }
        if opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let open = self.open_channels.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(PeerState::Connected);
        let remote = self.remote_peer.read().clone();
        tracing::info!(
            target: "shapes::webrtc",
            label = %channel.label(),
            open_channels = open,
            remote = ?remote.as_ref().map(PeerId::as_str),
            "data channel open"
        );

        let hello = ChannelMessage::ShapeHello {
            room: self.options.hello.room.clone(),
            peer_id: self.local_peer().clone(),
            forms: self.options.hello.forms.clone(),
            policy: self.options.hello.policy.clone(),
        };
        if let Err(err) = send_on(channel, &hello).await {
            tracing::warn!(target: "shapes::webrtc", error = %err, "shape-hello failed");
        }
        self.start_ping_loop();
        let _ = self.events_tx.send(PeerEvent::ChannelOpen { remote });
    }

    fn channel_closed(&self, generation: u64, opened: &AtomicBool) {
        if !self.is_current(generation) {
            return;
        }
        self.channel.write().take();
        if !opened.swap(false, Ordering::SeqCst) {
            return;
        }
        let open = self
            .open_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        self.stop_ping();
        tracing::info!(target: "shapes::webrtc", open_channels = open, "data channel closed");
        let _ = self.events_tx.send(PeerEvent::ChannelClosed);
    }

    async fn handle_channel_text(&self, text: &str) {
        if let Some(reply) = self.on_channel_text(text) {
            if let Err(err) = self.send(&reply).await {
                tracing::debug!(target: "shapes::webrtc", error = %err, "channel reply failed");
            }
        }
    }

    /// Apply one inbound channel message; returns the reply to send, if any.
    fn on_channel_text(&self, text: &str) -> Option<ChannelMessage> {
        let message: ChannelMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "shapes::webrtc", error = %err, len = text.len(), "malformed channel message");
                return None;
            }
        };
        match message {
            ChannelMessage::Ping { ts, .. } => {
                return Some(ChannelMessage::Pong {
                    ts,
                    peer_id: self.local_peer().clone(),
                });
            }
            ChannelMessage::Pong { ts, peer_id } => {
                let rtt = now_millis().saturating_sub(ts);
                self.presence.record_rtt(&peer_id, rtt, RttPath::Channel);
            }
            ChannelMessage::ShapeHello {
                room,
                peer_id,
                forms,
                policy,
            } => {
                self.presence.register(&peer_id);
                tracing::info!(target: "shapes::webrtc", peer = %peer_id, room = %room, ?forms, policy = %policy, "shape-hello");
                let _ = self.events_tx.send(PeerEvent::Hello {
                    room,
                    peer_id,
                    forms,
                    policy,
                });
            }
            ChannelMessage::ShapeShare { note, ts } => {
                let _ = self.events_tx.send(PeerEvent::Share { note, ts });
            }
            ChannelMessage::ShapeCapsule { capsule } => {
                let _ = self.events_tx.send(PeerEvent::Capsule(capsule));
            }
        }
        None
    }
}

async fn answer_offer(
    pc: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn send_on(channel: &RTCDataChannel, message: &ChannelMessage) -> Result<(), TransportError> {
    if channel.ready_state() != RTCDataChannelState::Open {
        return Err(TransportError::NotConnected);
    }
    let text = serde_json::to_string(message)?;
    channel.send_text(text).await?;
    Ok(())
}

async fn build_peer_connection(
    ctx: &Arc<Context>,
    with_channel: bool,
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let generation = ctx.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let webrtc = &ctx.options.webrtc;

    let mut setting = SettingEngine::default();
    if webrtc.include_loopback {
        setting.set_include_loopback_candidate(true);
    }
    let api = APIBuilder::new().with_setting_engine(setting).build();
    let rtc_config = RTCConfiguration {
        ice_servers: webrtc.ice_servers.clone(),
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    let weak = Arc::downgrade(ctx);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let weak = weak.clone();
        Box::pin(async move {
            let (Some(ctx), Some(candidate)) = (weak.upgrade(), candidate) else {
                return;
            };
            if !ctx.is_current(generation) {
                return;
            }
            match candidate.to_json() {
                Ok(init) => ctx.announce_candidate(init.into()),
                Err(err) => {
                    tracing::warn!(target: "shapes::webrtc", error = %err, "local candidate unusable");
                }
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => {
                    tracing::warn!(target: "shapes::webrtc", generation, "peer connection failed");
                }
                _ => {
                    tracing::debug!(target: "shapes::webrtc", generation, ?state, "peer connection state");
                }
            }
        })
    }));

    let weak = Arc::downgrade(ctx);
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            if channel.label() != ctx.options.webrtc.data_channel_label {
                tracing::debug!(target: "shapes::webrtc", label = %channel.label(), "ignoring foreign data channel");
                return;
            }
            attach_channel(&ctx, channel, generation);
        })
    }));

    if with_channel {
        let init = RTCDataChannelInit {
            ordered: Some(webrtc.ordered),
            ..Default::default()
        };
        let channel = pc
            .create_data_channel(&webrtc.data_channel_label, Some(init))
            .await?;
        attach_channel(ctx, channel, generation);
    }
    Ok(pc)
}

fn attach_channel(ctx: &Arc<Context>, channel: Arc<RTCDataChannel>, generation: u64) {
    if !ctx.is_current(generation) {
        return;
    }
    *ctx.channel.write() = Some(Arc::clone(&channel));
    let opened = Arc::new(AtomicBool::new(false));

    let weak_ctx = Arc::downgrade(ctx);
    let weak_channel: Weak<RTCDataChannel> = Arc::downgrade(&channel);
    let open_flag = Arc::clone(&opened);
    channel.on_open(Box::new(move || {
        let weak_ctx = weak_ctx.clone();
        let weak_channel = weak_channel.clone();
        let open_flag = Arc::clone(&open_flag);
        Box::pin(async move {
            if let (Some(ctx), Some(channel)) = (weak_ctx.upgrade(), weak_channel.upgrade()) {
                ctx.channel_opened(&channel, generation, &open_flag).await;
            }
        })
    }));

    let weak_ctx = Arc::downgrade(ctx);
    let close_flag = Arc::clone(&opened);
    channel.on_close(Box::new(move || {
        let weak_ctx = weak_ctx.clone();
        let close_flag = Arc::clone(&close_flag);
        Box::pin(async move {
            if let Some(ctx) = weak_ctx.upgrade() {
                ctx.channel_closed(generation, &close_flag);
            }
        })
    }));

    let weak_ctx = Arc::downgrade(ctx);
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let weak_ctx = weak_ctx.clone();
        Box::pin(async move {
            let Some(ctx) = weak_ctx.upgrade() else {
                return;
            };
            match std::str::from_utf8(&message.data) {
                Ok(text) => ctx.handle_channel_text(text).await,
                Err(_) => tracing::debug!(target: "shapes::webrtc", len = message.data.len(), "dropping binary channel message"),
            }
        })
    }));

    // A remote channel can already be open by the time it is handed over.
    if channel.ready_state() == RTCDataChannelState::Open {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            ctx.channel_opened(&channel, generation, &opened).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        peer: PeerId,
        sent: Mutex<Vec<SignalingMessage>>,
    }

    impl RecordingSink {
        fn new(peer: &str) -> Arc<Self> {
            Arc::new(Self {
                peer: PeerId::from(peer),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(SignalingMessage::kind).collect()
        }
    }

    impl SignalSink for RecordingSink {
        fn local_peer(&self) -> &PeerId {
            &self.peer
        }

        fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn options() -> PeerOptions {
        PeerOptions {
            webrtc: WebRtcConfig::localhost(),
            hello: HelloAnnouncement {
                room: "lobby".into(),
                forms: vec!["cgp".into()],
                policy: "open".into(),
            },
            ping_interval: Duration::from_millis(5_000),
        }
    }

    async fn manager_for(sink: &Arc<RecordingSink>) -> PeerConnectionManager {
        manager(sink).await
    }

    async fn manager(sink: &Arc<RecordingSink>) -> PeerConnectionManager {
        PeerConnectionManager::new(
            Arc::clone(sink) as Arc<dyn SignalSink>,
            Arc::new(PresenceTracker::default()),
            options(),
        )
        .await
        .unwrap()
    }

    fn candidate(from: &str) -> SignalingMessage {
        SignalingMessage::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            from: from.into(),
            to: None,
        }
    }

    fn offer_of(sink: &RecordingSink) -> SignalingMessage {
        sink.sent
            .lock()
            .iter()
            .find(|message| matches!(message, SignalingMessage::Offer { .. }))
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn self_echo_never_drives_negotiation() {
        let sink = RecordingSink::new("bbbbbbbbbbbbbbbb");
        let manager = manager(&sink).await;
        manager
            .handle_signal(SignalingMessage::Offer {
                sdp: "v=0".into(),
                from: "bbbbbbbbbbbbbbbb".into(),
            })
            .await
            .unwrap();
        manager.handle_signal(candidate("bbbbbbbbbbbbbbbb")).await.unwrap();

        assert_eq!(manager.state(), PeerState::Idle);
        assert_eq!(manager.pending_candidates().await, 0);
        assert!(manager.remote_peer().is_none());
        assert!(sink.kinds().iter().all(|kind| *kind == "candidate"));
        manager.close().await;
    }

    #[tokio::test]
    async fn start_sends_offer_once() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.state(), PeerState::Offering);
        let offers: Vec<String> = sink
            .sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                SignalingMessage::Offer { sdp, .. } => Some(sdp.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(offers.len(), 1);
        assert!(offers[0].starts_with("v=0"));
        manager.close().await;
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_queued_and_bounded() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let mut opts = options();
        opts.webrtc.max_pending_candidates = 2;
        let manager = PeerConnectionManager::new(
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            Arc::new(PresenceTracker::default()),
            opts,
        )
        .await
        .unwrap();

        for _ in 0..3 {
            manager.handle_signal(candidate("cccccccccccccccc")).await.unwrap();
        }
        assert_eq!(manager.pending_candidates().await, 2);
        assert_eq!(manager.state(), PeerState::Idle);
        manager.close().await;
    }

    #[tokio::test]
    async fn unexpected_answer_and_foreign_directed_messages_are_ignored() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager
            .handle_signal(SignalingMessage::Answer {
                sdp: "v=0".into(),
                from: "cccccccccccccccc".into(),
                to: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.state(), PeerState::Idle);

        let directed = SignalingMessage::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            },
            from: "cccccccccccccccc".into(),
            to: Some("dddddddddddddddd".into()),
        };
        manager.handle_signal(directed).await.unwrap();
        assert_eq!(manager.pending_candidates().await, 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn send_without_open_channel_fails() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        let err = manager
            .send(&ChannelMessage::ShapeShare {
                note: "hi".into(),
                ts: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(!manager.is_open());
        assert_eq!(manager.open_channels(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager.close().await;
        assert_eq!(manager.state(), PeerState::Closed);
        manager.start().await.unwrap();
        assert_eq!(manager.state(), PeerState::Closed);
        assert!(!sink.kinds().contains(&"offer"));
    }

    #[tokio::test]
    async fn lower_id_yields_during_glare() {
        let polite = RecordingSink::new("1111111111111111");
        let polite_manager = manager(&polite).await;
        let impolite = RecordingSink::new("ffffffffffffffff");
        let impolite_manager = manager(&impolite).await;
        polite_manager.start().await.unwrap();
        impolite_manager.start().await.unwrap();

        let polite_offer = offer_of(&polite);
        let impolite_offer = offer_of(&impolite);

        impolite_manager.handle_signal(polite_offer).await.unwrap();
        assert_eq!(impolite_manager.state(), PeerState::Offering);
        assert!(impolite_manager.remote_peer().is_none());

        polite_manager.handle_signal(impolite_offer).await.unwrap();
        assert_eq!(polite_manager.state(), PeerState::Negotiating);
        assert_eq!(
            polite_manager.remote_peer(),
            Some(PeerId::from("ffffffffffffffff"))
        );
        assert!(polite.sent.lock().iter().any(|message| matches!(
            message,
            SignalingMessage::Answer { to: Some(to), .. } if to == "ffffffffffffffff"
        )));

        polite_manager.close().await;
        impolite_manager.close().await;
    }

    #[tokio::test]
    async fn malformed_offer_is_dropped_without_locking_the_remote() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager
            .handle_signal(SignalingMessage::Offer {
                sdp: "garbage".into(),
                from: "cccccccccccccccc".into(),
            })
            .await
            .unwrap();
        assert_eq!(manager.state(), PeerState::Idle);
        assert!(manager.remote_peer().is_none());
        assert!(sink.sent.lock().is_empty());

        let other_sink = RecordingSink::new("bbbbbbbbbbbbbbbb");
        let other = manager_for(&other_sink).await;
        other.start().await.unwrap();
        manager.handle_signal(offer_of(&other_sink)).await.unwrap();

        assert_eq!(manager.state(), PeerState::Negotiating);
        assert_eq!(manager.remote_peer(), Some(PeerId::from("bbbbbbbbbbbbbbbb")));
        assert!(sink.sent.lock().iter().any(|message| matches!(
            message,
            SignalingMessage::Answer { to: Some(to), .. } if to == "bbbbbbbbbbbbbbbb"
        )));
        manager.close().await;
        other.close().await;
    }

    #[tokio::test]
    async fn start_after_malformed_offer_still_offers_a_data_channel() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager
            .handle_signal(SignalingMessage::Offer {
                sdp: "garbage".into(),
                from: "cccccccccccccccc".into(),
            })
            .await
            .unwrap();
        manager.start().await.unwrap();

        assert_eq!(manager.state(), PeerState::Offering);
        match offer_of(&sink) {
            SignalingMessage::Offer { sdp, .. } => assert!(sdp.contains("m=application")),
            other => panic!("unexpected message {other:?}"),
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn malformed_answer_does_not_lock_the_remote() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager.start().await.unwrap();
        let _ = manager
            .handle_signal(SignalingMessage::Answer {
                sdp: "garbage".into(),
                from: "cccccccccccccccc".into(),
                to: Some("aaaaaaaaaaaaaaaa".into()),
            })
            .await;
        assert_eq!(manager.state(), PeerState::Offering);
        assert!(manager.remote_peer().is_none());
        manager.close().await;
    }

    #[tokio::test]
    async fn channel_ping_gets_a_pong_and_pong_records_channel_rtt() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let presence = Arc::new(PresenceTracker::default());
        let manager = PeerConnectionManager::new(
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            Arc::clone(&presence),
            options(),
        )
        .await
        .unwrap();
        let mut events = manager.take_events().unwrap();

        let reply = manager
            .ctx
            .on_channel_text(r#"{"type":"ping","ts":42,"peerId":"bbbbbbbbbbbbbbbb"}"#);
        assert_eq!(
            reply,
            Some(ChannelMessage::Pong {
                ts: 42,
                peer_id: PeerId::from("aaaaaaaaaaaaaaaa"),
            })
        );

        let pong = ChannelMessage::Pong {
            ts: now_millis() - 30,
            peer_id: PeerId::from("bbbbbbbbbbbbbbbb"),
        };
        assert!(manager
            .ctx
            .on_channel_text(&serde_json::to_string(&pong).unwrap())
            .is_none());
        let entry = presence.get(&PeerId::from("bbbbbbbbbbbbbbbb")).unwrap();
        assert!(entry.channel_rtt_ms.unwrap() >= 30);
        assert!(entry.ws_rtt_ms.is_none());

        let hello = ChannelMessage::ShapeHello {
            room: "lobby".into(),
            peer_id: PeerId::from("bbbbbbbbbbbbbbbb"),
            forms: vec!["cgp".into()],
            policy: "open".into(),
        };
        assert!(manager
            .ctx
            .on_channel_text(&serde_json::to_string(&hello).unwrap())
            .is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            PeerEvent::Hello { peer_id, .. } if peer_id.as_str() == "bbbbbbbbbbbbbbbb"
        ));
        assert!(manager.ctx.on_channel_text("{not json").is_none());
        manager.close().await;
    }

    #[tokio::test]
    async fn dropping_the_manager_closes_the_peer_connection() {
        let sink = RecordingSink::new("aaaaaaaaaaaaaaaa");
        let manager = manager(&sink).await;
        manager.start().await.unwrap();
        let pc = Arc::clone(&manager.negotiation.lock().await.pc);
        drop(manager);

        let mut closed = false;
        for _ in 0..40 {
            if pc.connection_state() == RTCPeerConnectionState::Closed {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(closed, "peer connection left open after drop");
    }
}
