//! Server configuration from environment variables.

use std::{env, path::PathBuf, time::Duration};

/// Timings and caps fixed by the protocol contract. Tunable limits live in
/// [`Config`] instead.
pub mod limits {
    use std::time::Duration;

    /// `Hello` must arrive this soon after the stream opens.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// No inbound traffic for this long closes the connection as stale.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    /// Server-initiated WebSocket ping cadence.
    pub const PING_INTERVAL: Duration = Duration::from_secs(25);
    /// Empty room lingers this long before eviction.
    pub const ROOM_IDLE_GRACE: Duration = Duration::from_secs(5 * 60);
    /// Snapshot flush cadence, whichever of time or batch count hits first.
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
    pub const FLUSH_BATCH_THRESHOLD: usize = 64;
    /// Session tokens and checkpointed sync states expire together.
    pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Presence demotions without any client frame.
    pub const PRESENCE_IDLE_AFTER: Duration = Duration::from_secs(60);
    pub const PRESENCE_AWAY_AFTER: Duration = Duration::from_secs(5 * 60);
    pub const PRESENCE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
    /// Chat message cap in bytes and retained ring length.
    pub const CHAT_MAX_BYTES: usize = 4 * 1024;
    pub const CHAT_RING_LEN: usize = 200;
    /// Outbound queue high-water marks per connection.
    pub const OUTBOUND_QUEUE_MSGS: usize = 1024;
    pub const OUTBOUND_QUEUE_BYTES: usize = 8 * 1024 * 1024;
    /// Room command mailbox depth.
    pub const ROOM_MAILBOX: usize = 256;
    /// Expired sync-state checkpoints are swept on this cadence.
    pub const SYNC_STATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
}

/// LiveKit credentials for the voice collaborator. Absent when any of the
/// three variables is unset.
#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub url: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_path: PathBuf,
    pub max_peers_per_room: usize,
    pub max_rooms: usize,
    pub max_doc_size: usize,
    pub livekit: Option<LiveKitConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        let livekit = match (
            env::var("LIVEKIT_API_KEY"),
            env::var("LIVEKIT_API_SECRET"),
            env::var("LIVEKIT_URL"),
        ) {
            (Ok(api_key), Ok(api_secret), Ok(url)) => Some(LiveKitConfig {
                api_key,
                api_secret,
                url,
            }),
            _ => None,
        };

        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5000),
            storage_path: env::var("STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/collab")),
            max_peers_per_room: env::var("ATELIER_MAX_PEERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(32),
            max_rooms: env::var("ATELIER_MAX_ROOMS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100_000),
            // Must stay under the 16 MiB frame cap: a full snapshot ships
            // inside a single ProjectJoined frame.
            max_doc_size: env::var("ATELIER_MAX_DOC_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            livekit,
        }
    }
}

/// Not a config knob; referenced by timers that need "never".
pub fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY: tests in this module run single-threaded with respect to
        // these variables; nothing else reads them concurrently.
        unsafe {
            env::remove_var("PORT");
            env::remove_var("STORAGE_PATH");
            env::remove_var("ATELIER_MAX_PEERS");
            env::remove_var("ATELIER_MAX_ROOMS");
            env::remove_var("ATELIER_MAX_DOC_SIZE");
            env::remove_var("LIVEKIT_API_KEY");
            env::remove_var("LIVEKIT_API_SECRET");
            env::remove_var("LIVEKIT_URL");
        }

        let config = Config::from_env();
        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_path, PathBuf::from("./data/collab"));
        assert_eq!(config.max_peers_per_room, 32);
        assert_eq!(config.max_rooms, 100_000);
        assert_eq!(config.max_doc_size, 10 * 1024 * 1024);
        assert!(config.livekit.is_none());
    }
}
