pub mod config;
pub mod mesh;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use mesh::{MeshPublisher, PublishError};
pub use presence::{Health, PresenceConfig, PresenceEntry, PresenceTracker, RttPath};
pub use protocol::{ChannelMessage, PeerId, SignalingMessage};
pub use session::{
    Delivery, MeshSession, SealedCapsule, SessionError, SessionEvent, ShareOptions, ShareOutcome,
    save_capsule, seal_capsule,
};
