use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Wire protocol version carried in every packet header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes (`!BBIHH`: version, type, length, seq, reserved).
pub const HEADER_SIZE: usize = 10;

/// Maximum payload size for control/chat packets (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Chunk size for TCP file transfer (32 KiB).
pub const FILE_CHUNK_SIZE: usize = 32_768;

/// Maximum accepted file size (100 MiB).
pub const MAX_FILE_SIZE: u64 = 104_857_600;

/// Maximum screen-share frame size (10 MiB); larger frames are malformed.
pub const MAX_SCREEN_FRAME: usize = 10 * 1024 * 1024;

// ── Audio format ────────────────────────────────────────────────────────────
// Raw PCM, int16 little-endian, mono.

pub const AUDIO_RATE: u32 = 44_100;
pub const AUDIO_CHANNELS: usize = 1;
pub const AUDIO_CHUNK: usize = 1024;
pub const AUDIO_SAMPLE_BYTES: usize = 2;

/// Canonical byte length of one audio chunk; payloads of any other length
/// are discarded to keep the mix cadence clean.
pub const AUDIO_CHUNK_BYTES: usize = AUDIO_CHUNK * AUDIO_CHANNELS * AUDIO_SAMPLE_BYTES;

/// Bound on each per-source jitter buffer, in chunks (~230 ms of audio).
pub const JITTER_BUFFER_CHUNKS: usize = 10;

// ── Timeouts ────────────────────────────────────────────────────────────────

/// Per-iteration socket read timeout on blocking loops.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between server-initiated heartbeats to TCP members.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// UDP stream registrations idle longer than this are swept.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Audio sources silent longer than this have their jitter buffers dropped.
pub const AUDIO_SOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for the heartbeat loop to finish.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Room every member starts in before registering.
pub const DEFAULT_ROOM: &str = "default";

/// Username placeholder before a REGISTER arrives.
pub const UNKNOWN_USERNAME: &str = "Unknown";

// ---------------------------------------------------------------------------
// Runtime configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `LANRELAY_`.  Defaults are suitable for LAN deployment out of the box.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind every listener to.
    pub bind_host: String,
    /// TCP port for control, registration, heartbeat, and chat.
    pub control_port: u16,
    /// TCP port for file upload/download connections.
    pub file_port: u16,
    /// TCP port for the screen-share relay.
    pub screen_port: u16,
    /// UDP port for video frames.
    pub video_port: u16,
    /// UDP port for audio chunks.
    pub audio_port: u16,

    // ── Storage ─────────────────────────────────────────────────────────
    /// Directory holding uploaded files (created at startup).
    pub storage_dir: PathBuf,
    /// Maximum accepted upload size in bytes.
    pub max_file_size: u64,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading, errors ignored.
        let _ = dotenvy::dotenv();

        let config = Config {
            bind_host: env_or("LANRELAY_BIND_HOST", "0.0.0.0"),
            control_port: env_port("LANRELAY_CONTROL_PORT", 5000),
            file_port: env_port("LANRELAY_FILE_PORT", 5002),
            screen_port: env_port("LANRELAY_SCREEN_PORT", 5003),
            video_port: env_port("LANRELAY_VIDEO_PORT", 6000),
            audio_port: env_port("LANRELAY_AUDIO_PORT", 6001),
            storage_dir: PathBuf::from(env_or("LANRELAY_STORAGE_DIR", "lanrelay_files")),
            max_file_size: env_or("LANRELAY_MAX_FILE_SIZE", "104857600")
                .parse::<u64>()
                .unwrap_or(MAX_FILE_SIZE),
            log_level: env_or("LANRELAY_LOG_LEVEL", "info"),
        };

        config.log_summary();
        config
    }

    /// Bind address for a given port, as `host:port`.
    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host, port)
    }

    /// Duration of one audio chunk; the mixer ticks at this period.
    pub fn audio_tick(&self) -> Duration {
        Duration::from_secs_f64(AUDIO_CHUNK as f64 / AUDIO_RATE as f64)
    }

    fn log_summary(&self) {
        info!("──── LanRelay Configuration ────");
        info!("  bind_host     : {}", self.bind_host);
        info!("  control_port  : {} (tcp)", self.control_port);
        info!("  file_port     : {} (tcp)", self.file_port);
        info!("  screen_port   : {} (tcp)", self.screen_port);
        info!("  video_port    : {} (udp)", self.video_port);
        info!("  audio_port    : {} (udp)", self.audio_port);
        info!("  storage_dir   : {}", self.storage_dir.display());
        info!("  max_file_size : {} bytes", self.max_file_size);
        info!("  log_level     : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            control_port: 5000,
            file_port: 5002,
            screen_port: 5003,
            video_port: 6000,
            audio_port: 6001,
            storage_dir: PathBuf::from("lanrelay_files"),
            max_file_size: MAX_FILE_SIZE,
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_port(key: &str, default: u16) -> u16 {
    match std::env::var(key) {
        Ok(v) => v.parse::<u16>().unwrap_or(default),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_ports() {
        let config = Config::default();
        assert_eq!(config.control_port, 5000);
        assert_eq!(config.file_port, 5002);
        assert_eq!(config.screen_port, 5003);
        assert_eq!(config.video_port, 6000);
        assert_eq!(config.audio_port, 6001);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = Config::default();
        assert_eq!(config.bind_addr(5000), "0.0.0.0:5000");
    }

    #[test]
    fn audio_tick_matches_chunk_duration() {
        let config = Config::default();
        let tick = config.audio_tick();
        // 1024 samples at 44.1 kHz is roughly 23.2 ms.
        assert!(tick > Duration::from_millis(23));
        assert!(tick < Duration::from_millis(24));
    }

    #[test]
    fn canonical_chunk_is_2048_bytes() {
        assert_eq!(AUDIO_CHUNK_BYTES, 2048);
    }
}
