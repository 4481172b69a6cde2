use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::protocol::{PeerId, now_millis};

/// RTT above which a peer is shown as unhealthy.
pub const BAD_RTT_MS: u64 = 300;

/// Which liveness probe produced an RTT sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RttPath {
    /// `ws-ping` / `ws-pong` through the signaling relay.
    Signaling,
    /// `ping` / `pong` over the data channel.
    Channel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Ok,
    Warn,
    Bad,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceEntry {
    pub ws_rtt_ms: Option<u64>,
    pub channel_rtt_ms: Option<u64>,
    /// Unix millis of the last presence or pong.
    pub last_seen: u64,
}

impl PresenceEntry {
    fn new(now: u64) -> Self {
        Self {
            ws_rtt_ms: None,
            channel_rtt_ms: None,
            last_seen: now,
        }
    }

    /// Data-channel RTT once available, otherwise the signaling RTT.
    pub fn rtt(&self) -> Option<u64> {
        self.channel_rtt_ms.or(self.ws_rtt_ms)
    }

    pub fn health(&self) -> Health {
        classify(self.rtt())
    }
}

pub fn classify(rtt_ms: Option<u64>) -> Health {
    match rtt_ms {
        None => Health::Warn,
        Some(ms) if ms > BAD_RTT_MS => Health::Bad,
        Some(_) => Health::Ok,
    }
}

/// Optional growth limits. Both are off by default, which keeps every peer ever
/// seen for the lifetime of the tracker.
#[derive(Clone, Debug, Default)]
pub struct PresenceConfig {
    pub stale_after: Option<Duration>,
    pub max_peers: Option<usize>,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    config: PresenceConfig,
    peers: RwLock<HashMap<PeerId, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record that a peer is alive. Returns `true` if it was not known before.
    pub fn register(&self, peer: &PeerId) -> bool {
        self.register_at(peer, now_millis())
    }

    pub fn register_at(&self, peer: &PeerId, now: u64) -> bool {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(peer) {
            entry.last_seen = now;
            return false;
        }
        self.make_room(&mut peers);
        peers.insert(peer.clone(), PresenceEntry::new(now));
        tracing::debug!(target: "shapes::presence", peer = %peer, known = peers.len(), "peer registered");
        true
    }

    pub fn record_rtt(&self, peer: &PeerId, rtt_ms: u64, path: RttPath) {
        self.record_rtt_at(peer, rtt_ms, path, now_millis());
    }

    pub fn record_rtt_at(&self, peer: &PeerId, rtt_ms: u64, path: RttPath, now: u64) {
        let mut peers = self.peers.write();
        if !peers.contains_key(peer) {
            self.make_room(&mut peers);
        }
        let entry = peers
            .entry(peer.clone())
            .or_insert_with(|| PresenceEntry::new(now));
        match path {
            RttPath::Signaling => entry.ws_rtt_ms = Some(rtt_ms),
            RttPath::Channel => entry.channel_rtt_ms = Some(rtt_ms),
        }
        entry.last_seen = now;
        tracing::trace!(target: "shapes::presence", peer = %peer, rtt_ms, ?path, "rtt sample");
    }

    pub fn get(&self, peer: &PeerId) -> Option<PresenceEntry> {
        self.peers.read().get(peer).cloned()
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PresenceEntry> {
        self.peers.read().clone()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Drop entries not seen within `stale_after`. No-op unless configured.
    pub fn prune_stale(&self) -> Vec<PeerId> {
        self.prune_stale_at(now_millis())
    }

    pub fn prune_stale_at(&self, now: u64) -> Vec<PeerId> {
        let Some(stale_after) = self.config.stale_after else {
            return Vec::new();
        };
        let cutoff = now.saturating_sub(stale_after.as_millis() as u64);
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .iter()
            .filter(|(_, entry)| entry.last_seen < cutoff)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &stale {
            peers.remove(peer);
            tracing::debug!(target: "shapes::presence", peer = %peer, "evicted stale peer");
        }
        stale
    }

    fn make_room(&self, peers: &mut HashMap<PeerId, PresenceEntry>) {
        let Some(max) = self.config.max_peers else {
            return;
        };
        while !peers.is_empty() && peers.len() >= max {
            let oldest = peers
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(peer, _)| peer.clone());
            match oldest {
                Some(peer) => {
                    peers.remove(&peer);
                    tracing::debug!(target: "shapes::presence", peer = %peer, "evicted peer at capacity");
                }
                None => break,
            }
        }
    }
}
