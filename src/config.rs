use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP listen port, also the port the subnet probe targets on peers.
pub const DEFAULT_PORT: u16 = 4000;

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 43153;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Server configuration, read once at startup. Invalid environment values
/// fall back to the defaults silently.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP + socket listen port (`PORT`).
    pub port: u16,
    /// How long an empty room lingers before eviction (`ROOM_IDLE_TTL_MINUTES`).
    pub room_idle_ttl: Duration,
    /// Root directory for uploaded media (`WATCH_TOGETHER_STORAGE_DIR`).
    pub storage_dir: PathBuf,
    /// UDP discovery port (`WATCH_TOGETHER_DISCOVERY_PORT`).
    pub discovery_port: u16,
    /// Port probed on peer hosts during subnet scans.
    pub probe_port: u16,
    /// `WATCH_TOGETHER_DISABLE_COMPAT_PROXY=1` — the compat proxy lives in
    /// the desktop shell; the flag is parsed here so the shell and server
    /// agree on one environment.
    pub disable_compat_proxy: bool,
    /// Bitrate ceiling for serving a file without transcoding
    /// (`WATCH_TOGETHER_DIRECT_STREAM_MAX_BPS`).
    pub direct_stream_max_bps: u64,
    /// Explicit ffprobe binary (`FFPROBE_PATH`), else resolved from PATH.
    pub ffprobe_path: Option<PathBuf>,
    /// Member limit applied to each room at creation
    /// (`WATCH_TOGETHER_MAX_MEMBERS`).
    pub max_members: usize,
    /// Upload cap for media files.
    pub media_upload_cap: u64,
    /// Upload cap for subtitle files.
    pub subtitle_upload_cap: u64,
    /// Playback envelope re-broadcast interval.
    pub playback_heartbeat: Duration,
    /// Snapshot re-broadcast interval.
    pub snapshot_heartbeat: Duration,
    /// Idle-room sweep interval.
    pub cleanup_interval: Duration,
    /// UDP announcement interval.
    pub announce_interval: Duration,
    /// Broadcast-discovered entries older than this are evicted.
    pub discovery_ttl: Duration,
    /// Per-host timeout for probe requests.
    pub probe_timeout: Duration,
    /// Concurrent in-flight probe requests.
    pub probe_concurrency: usize,
    /// How long a successful probe result is served from cache.
    pub probe_cache_window: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let idle_minutes: u64 = env_parse("ROOM_IDLE_TTL_MINUTES", 120);
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            room_idle_ttl: Duration::from_secs(idle_minutes * 60),
            storage_dir: env::var("WATCH_TOGETHER_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".watchtogether/uploads")),
            discovery_port: env_parse("WATCH_TOGETHER_DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT),
            probe_port: DEFAULT_PORT,
            disable_compat_proxy: env::var("WATCH_TOGETHER_DISABLE_COMPAT_PROXY")
                .map(|v| v == "1")
                .unwrap_or(false),
            direct_stream_max_bps: env_parse("WATCH_TOGETHER_DIRECT_STREAM_MAX_BPS", 900_000),
            ffprobe_path: env::var("FFPROBE_PATH").ok().map(PathBuf::from),
            max_members: env_parse("WATCH_TOGETHER_MAX_MEMBERS", 6),
            media_upload_cap: 15 * GIB,
            subtitle_upload_cap: 5 * MIB,
            playback_heartbeat: Duration::from_millis(1500),
            snapshot_heartbeat: Duration::from_secs(4),
            cleanup_interval: Duration::from_secs(60),
            announce_interval: Duration::from_millis(1500),
            discovery_ttl: Duration::from_millis(4500),
            probe_timeout: Duration::from_millis(300),
            probe_concurrency: 48,
            probe_cache_window: Duration::from_secs(6),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
