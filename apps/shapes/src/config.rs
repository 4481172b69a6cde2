use std::env;
use std::time::Duration;

#[cfg(test)]
use std::sync::Mutex;

use crate::presence::PresenceConfig;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_MESH_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_ROOM: &str = "lobby";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_WS_PING_MS: u64 = 7_000;
pub const DEFAULT_CHANNEL_PING_MS: u64 = 5_000;
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HELLO_POLICY: &str = "open";

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base of the signaling relay; `/ws/signaling/<room>` is appended
    pub signaling_url: String,
    /// Base of the mesh ingress; `/mesh/handshake` is appended
    pub mesh_url: String,
    pub room: String,
    /// `None` disables the public STUN server (localhost-only ICE)
    pub stun_url: Option<String>,
    pub ws_ping_interval: Duration,
    pub channel_ping_interval: Duration,
    pub publish_timeout: Duration,
    pub presence: PresenceConfig,
    /// Forms advertised in `shape-hello`
    pub hello_forms: Vec<String>,
    pub hello_policy: String,
    /// Decrypts anchors of geometry broadcasts before they reach the application
    pub viewer_passphrase: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stun_url = if env_flag("SHAPES_WEBRTC_DISABLE_STUN") {
            None
        } else {
            Some(env::var("SHAPES_STUN_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.to_string()))
        };
        let presence = PresenceConfig {
            stale_after: env_u64("SHAPES_PRESENCE_STALE_SECS").map(Duration::from_secs),
            max_peers: env_u64("SHAPES_PRESENCE_MAX_PEERS").map(|max| max as usize),
        };
        let hello_forms = env::var("SHAPES_HELLO_FORMS")
            .ok()
            .map(|forms| {
                forms
                    .split(',')
                    .map(str::trim)
                    .filter(|form| !form.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.hello_forms);

        Self {
            signaling_url: env_string("SHAPES_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            mesh_url: env_string("SHAPES_MESH_URL").unwrap_or(defaults.mesh_url),
            room: env_string("SHAPES_ROOM").unwrap_or(defaults.room),
            stun_url,
            ws_ping_interval: env_u64("SHAPES_WS_PING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.ws_ping_interval),
            channel_ping_interval: env_u64("SHAPES_CHANNEL_PING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.channel_ping_interval),
            publish_timeout: env_u64("SHAPES_PUBLISH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.publish_timeout),
            presence,
            hello_forms,
            hello_policy: env_string("SHAPES_HELLO_POLICY").unwrap_or(defaults.hello_policy),
            viewer_passphrase: env_string("SHAPES_VIEWER_PASSPHRASE"),
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            mesh_url: DEFAULT_MESH_URL.to_string(),
            room: DEFAULT_ROOM.to_string(),
            stun_url: Some(DEFAULT_STUN_URL.to_string()),
            ws_ping_interval: Duration::from_millis(DEFAULT_WS_PING_MS),
            channel_ping_interval: Duration::from_millis(DEFAULT_CHANNEL_PING_MS),
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
            presence: PresenceConfig::default(),
            hello_forms: vec!["cgp".to_string()],
            hello_policy: DEFAULT_HELLO_POLICY.to_string(),
            viewer_passphrase: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Environment variables are process-global
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "SHAPES_SIGNALING_URL",
        "SHAPES_ROOM",
        "SHAPES_WEBRTC_DISABLE_STUN",
        "SHAPES_WS_PING_MS",
        "SHAPES_PRESENCE_STALE_SECS",
        "SHAPES_HELLO_FORMS",
    ];

    fn clear() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ws_ping_interval, Duration::from_millis(7_000));
        assert_eq!(config.channel_ping_interval, Duration::from_millis(5_000));
        assert!(config.presence.stale_after.is_none());
        assert_eq!(config.stun_url.as_deref(), Some(DEFAULT_STUN_URL));
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let config = Config::from_env();
        assert_eq!(config.room, DEFAULT_ROOM);
        assert_eq!(config.hello_forms, vec!["cgp".to_string()]);
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("SHAPES_SIGNALING_URL", "wss://relay.example.com");
            env::set_var("SHAPES_ROOM", "studio");
            env::set_var("SHAPES_WEBRTC_DISABLE_STUN", "1");
            env::set_var("SHAPES_WS_PING_MS", "250");
            env::set_var("SHAPES_PRESENCE_STALE_SECS", "60");
            env::set_var("SHAPES_HELLO_FORMS", "cgp, mesh ,");
        }
        let config = Config::from_env();
        clear();

        assert_eq!(config.signaling_url, "wss://relay.example.com");
        assert_eq!(config.room, "studio");
        assert!(config.stun_url.is_none());
        assert_eq!(config.ws_ping_interval, Duration::from_millis(250));
        assert_eq!(config.presence.stale_after, Some(Duration::from_secs(60)));
        assert_eq!(config.hello_forms, vec!["cgp".to_string(), "mesh".to_string()]);
    }
}
