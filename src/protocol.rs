use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::playback::{PlaybackReason, PlaybackState};

/// Discovery wire version. Bump on incompatible datagram changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// `type` field of discovery datagrams.
pub const ANNOUNCE_TYPE: &str = "watchtogether:announce";

/// When to pause the whole room on a single member's buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Pause after a short grace window, scaled by remaining duration.
    Soft,
    /// Pause immediately.
    Strict,
}

/// How a member's locally selected file compares to the room's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMatch {
    Missing,
    Matched,
    Mismatch,
}

/// Media chosen by the host. The file itself stays local to each peer;
/// only the fingerprint travels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub duration: Option<f64>,
    pub sha256: String,
    pub selected_at: u64,
}

/// Fingerprint of a member's locally selected file, submitted over the
/// socket for match checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMediaInfo {
    pub sha256: String,
    pub size: u64,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleFormat {
    Vtt,
    Ass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleDescriptor {
    pub id: Uuid,
    pub name: String,
    pub format: SubtitleFormat,
    pub language: Option<String>,
    pub uploaded_at: u64,
}

/// Buffer/readiness telemetry reported by a member.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferReport {
    pub buffering: bool,
    pub buffer_ahead_seconds: f64,
    pub ready_state: u8,
    pub can_play_through: bool,
    pub startup_ready: bool,
}

/// Per-member view included in snapshots, host first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub connection_id: Uuid,
    pub nickname: String,
    pub is_host: bool,
    pub media_match: MediaMatch,
    pub buffering: bool,
    pub startup_ready: bool,
    pub buffer_ahead_seconds: f64,
    pub ready_state: u8,
    pub can_play_through: bool,
    pub connected_at: u64,
}

/// Full room state materialized on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub room_name: String,
    pub requires_password: bool,
    pub sync_mode: SyncMode,
    /// Startup gate is armed; playback may not begin yet.
    pub is_preparing: bool,
    /// Someone already asked to play; the gate will release it.
    pub pending_start_requested: bool,
    pub max_members: usize,
    pub server_time: u64,
    pub host_id: Option<Uuid>,
    pub media: Option<MediaDescriptor>,
    pub subtitle: Option<SubtitleDescriptor>,
    pub playback_state: PlaybackState,
    pub members: Vec<MemberSummary>,
    pub startup_buffer_target_seconds: f64,
    pub resume_buffer_target_seconds: f64,
}

/// Playback state plus server time and the buffering-members list; the unit
/// clients use to reconcile their local player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEnvelope {
    #[serde(flatten)]
    pub state: PlaybackState,
    pub server_time: u64,
    pub buffering_users: Vec<String>,
}

/// Messages from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientCommand {
    #[serde(rename = "room:join", rename_all = "camelCase")]
    Join {
        room_id: String,
        nickname: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        room_name: Option<String>,
    },
    #[serde(rename = "room:leave", rename_all = "camelCase")]
    Leave { room_id: String },
    #[serde(rename = "room:select-media", rename_all = "camelCase")]
    SelectMedia { room_id: String, media: ClientMediaInfo },
    #[serde(rename = "playback:control", rename_all = "camelCase")]
    PlaybackControl {
        room_id: String,
        position: f64,
        paused: bool,
        #[serde(default = "default_rate")]
        rate: f64,
        #[serde(default)]
        reason: Option<PlaybackReason>,
    },
    #[serde(rename = "client:buffering", rename_all = "camelCase")]
    Buffering {
        room_id: String,
        buffering: bool,
        #[serde(default)]
        buffer_ahead_seconds: f64,
        #[serde(default)]
        ready_state: u8,
        #[serde(default)]
        can_play_through: bool,
        #[serde(default)]
        startup_ready: bool,
    },
    #[serde(rename = "playback:request-state", rename_all = "camelCase")]
    RequestPlayback { room_id: String },
    #[serde(rename = "room:request-snapshot", rename_all = "camelCase")]
    RequestSnapshot { room_id: String },
    #[serde(rename = "room:config", rename_all = "camelCase")]
    Config { room_id: String, sync_mode: SyncMode },
}

fn default_rate() -> f64 {
    1.0
}

/// Messages from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "room:join:result", rename_all = "camelCase")]
    JoinResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<RoomSnapshot>,
        #[serde(skip_serializing_if = "Option::is_none")]
        self_id: Option<Uuid>,
    },
    #[serde(rename = "room:leave:result", rename_all = "camelCase")]
    LeaveResult { ok: bool },
    #[serde(rename = "room:snapshot")]
    Snapshot(RoomSnapshot),
    #[serde(rename = "playback:state")]
    Playback(PlaybackEnvelope),
    #[serde(rename = "room:error")]
    Error(String),
    #[serde(rename = "room:closed")]
    Closed(Option<String>),
}

/// Room summary used by `/api/discovery` and the UDP announcer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub room_name: String,
    pub host_nickname: String,
    pub requires_password: bool,
    pub member_count: usize,
    pub max_members: usize,
    pub media_name: Option<String>,
    pub subtitle_name: Option<String>,
    pub playback_state: DiscoveryPlayback,
}

/// Coarse playback state advertised to the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPlayback {
    Idle,
    Paused,
    Playing,
}

/// One UDP datagram announcing a hosted room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAnnouncement {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol_version: u32,
    pub instance_id: Uuid,
    #[serde(flatten)]
    pub room: RoomSummary,
    /// HTTP port the announcing instance serves on.
    pub port: u16,
    pub announced_at: u64,
}

/// Body of `GET /api/discovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub protocol_version: u32,
    pub instance_id: Uuid,
    pub rooms: Vec<RoomSummary>,
}
