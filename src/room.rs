use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::clock::now_ms;
use crate::config::Config;
use crate::gate;
use crate::media::{self, MediaRegistry, StoredFile};
use crate::member::{Member, MemberTable};
use crate::playback::{PlaybackPatch, PlaybackReason, PlaybackState};
use crate::protocol::{
    BufferReport, ClientMediaInfo, DiscoveryPlayback, MediaDescriptor, PlaybackEnvelope,
    RoomSnapshot, RoomSummary, ServerEvent, SubtitleDescriptor, SubtitleFormat, SyncMode,
};
use crate::ws::Publisher;

pub const MAX_ROOM_NAME_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

const MISMATCH_NOTICE: &str = "Local file does not match the host's media selection";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("password_mismatch")]
    PasswordMismatch,
    #[error("room_full")]
    RoomFull,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("only the host may change the room media")]
    NotHost,
}

/// Liveness facts the registry and discovery need without touching room
/// internals.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub summary: RoomSummary,
    pub member_count: usize,
    pub last_active_at: u64,
}

/// Commands executed on the room's queue, one at a time, in arrival order.
pub enum RoomCommand {
    Join {
        conn: Uuid,
        nickname: String,
        password: Option<String>,
        reply: oneshot::Sender<Result<RoomSnapshot, JoinError>>,
    },
    Leave {
        conn: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        conn: Uuid,
    },
    SelectMedia {
        conn: Uuid,
        media: ClientMediaInfo,
    },
    PlaybackControl {
        conn: Uuid,
        position: f64,
        paused: bool,
        rate: f64,
        reason: Option<PlaybackReason>,
    },
    ReportBuffering {
        conn: Uuid,
        report: BufferReport,
    },
    SetSyncMode {
        conn: Uuid,
        mode: SyncMode,
    },
    RequestSnapshot {
        conn: Uuid,
    },
    RequestPlayback {
        conn: Uuid,
    },
    InstallMedia {
        conn: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        duration: Option<f64>,
        sha256: String,
        file: StoredFile,
        reply: oneshot::Sender<Result<MediaDescriptor, InstallError>>,
    },
    InstallSubtitle {
        conn: Uuid,
        name: String,
        format: SubtitleFormat,
        language: Option<String>,
        file: StoredFile,
        reply: oneshot::Sender<Result<SubtitleDescriptor, InstallError>>,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    FileQuery(FileQuery),
    Shutdown {
        notice: Option<String>,
    },
}

/// Cloneable sender for a room's command queue.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) {
        // A closed queue means the room is being destroyed; the command is
        // dropped like any other message to a gone room.
        let _ = self.tx.send(command);
    }

    pub async fn status(&self) -> Option<RoomStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Status { reply: tx });
        rx.await.ok()
    }
}

/// The authoritative state for one room. All mutation happens on the
/// owning task; nothing here is shared.
pub struct Room {
    id: String,
    name: String,
    password_digest: Option<String>,
    host: Option<Uuid>,
    sync_mode: SyncMode,
    startup_gate_active: bool,
    pending_start_requested: bool,
    resume_after_buffer: bool,
    startup_target: f64,
    resume_target: f64,
    last_active_at: u64,
    max_members: usize,
    members: MemberTable,
    media: MediaRegistry,
    playback: PlaybackState,
    publisher: Publisher,
}

impl Room {
    pub fn new(
        id: String,
        name: Option<&str>,
        password: Option<&str>,
        config: &Config,
        publisher: Publisher,
        now: u64,
    ) -> Self {
        let name = sanitize_room_name(name, &id);
        let password_digest = password
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| hash_password(p, &id));
        Self {
            name,
            password_digest,
            host: None,
            sync_mode: SyncMode::Soft,
            startup_gate_active: false,
            pending_start_requested: false,
            resume_after_buffer: false,
            startup_target: gate::startup_target(None),
            resume_target: gate::resume_target(None),
            last_active_at: now,
            max_members: config.max_members,
            members: MemberTable::new(),
            media: MediaRegistry::new(),
            playback: PlaybackState::initial(now, None),
            publisher,
            id,
        }
    }

    /// Drain the command queue; `false` stops the room task.
    fn handle(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join { conn, nickname, password, reply } => {
                let _ = reply.send(self.join(conn, &nickname, password.as_deref()));
            }
            RoomCommand::Leave { conn, reply } => {
                self.remove_member(conn);
                let _ = reply.send(true);
            }
            RoomCommand::Disconnect { conn } => self.remove_member(conn),
            RoomCommand::SelectMedia { conn, media } => self.select_media(conn, media),
            RoomCommand::PlaybackControl { conn, position, paused, rate, reason } => {
                self.playback_control(conn, position, paused, rate, reason);
            }
            RoomCommand::ReportBuffering { conn, report } => self.report_buffering(conn, &report),
            RoomCommand::SetSyncMode { conn, mode } => self.set_sync_mode(conn, mode),
            RoomCommand::RequestSnapshot { conn } => {
                if self.members.contains(conn) {
                    let snapshot = self.snapshot(now_ms());
                    self.publisher.send_to(conn, ServerEvent::Snapshot(snapshot));
                }
            }
            RoomCommand::RequestPlayback { conn } => {
                if self.members.contains(conn) {
                    let envelope = self.envelope(now_ms());
                    self.publisher.send_to(conn, ServerEvent::Playback(envelope));
                }
            }
            RoomCommand::InstallMedia { conn, name, size, mime_type, duration, sha256, file, reply } => {
                let _ = reply.send(self.install_media(conn, name, size, mime_type, duration, sha256, file));
            }
            RoomCommand::InstallSubtitle { conn, name, format, language, file, reply } => {
                let _ = reply.send(self.install_subtitle(conn, name, format, language, file));
            }
            RoomCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RoomCommand::FileQuery(FileQuery::Media(id, reply)) => {
                let _ = reply.send(self.media_file(id));
            }
            RoomCommand::FileQuery(FileQuery::Subtitle(id, reply)) => {
                let _ = reply.send(self.subtitle_file(id));
            }
            RoomCommand::Shutdown { notice } => {
                let targets = self.members.ids();
                self.publisher.send_many(&targets, &ServerEvent::Closed(notice));
                tracing::info!("Room {} destroyed", self.id);
                return false;
            }
        }
        true
    }

    fn join(
        &mut self,
        conn: Uuid,
        nickname: &str,
        password: Option<&str>,
    ) -> Result<RoomSnapshot, JoinError> {
        if let Some(expected) = &self.password_digest {
            let provided: String = password.unwrap_or("").trim().chars().take(MAX_PASSWORD_LEN).collect();
            if &hash_password(&provided, &self.id) != expected {
                return Err(JoinError::PasswordMismatch);
            }
        }

        let rejoin = self.members.contains(conn);
        if !rejoin && self.members.len() >= self.max_members {
            return Err(JoinError::RoomFull);
        }

        let now = now_ms();
        let was_empty = self.members.is_empty();
        self.members.insert(Member::new(conn, nickname, now));
        if self.host.is_none() {
            self.host = Some(conn);
        }
        self.touch(now);

        // A newcomer in a room that is already watching something must catch
        // up before playback continues; remember whether it was playing so
        // the gate can resume it.
        let mut paused_for_gate = false;
        if !was_empty && !rejoin && self.media.media().is_some() {
            self.startup_gate_active = true;
            if !self.playback.paused {
                self.pending_start_requested = true;
                let position = self.playback.position_at(now);
                self.playback.mark(
                    PlaybackPatch { position: Some(position), paused: Some(true), rate: None },
                    PlaybackReason::StartupGate,
                    self.host,
                    now,
                );
                paused_for_gate = true;
            }
        }

        let snapshot = self.snapshot(now);
        self.broadcast_snapshot_except(conn, now);
        if paused_for_gate {
            self.broadcast_playback(now);
        }
        tracing::info!("{} joined room {}", snapshot_nickname(&snapshot, conn), self.id);
        Ok(snapshot)
    }

    fn remove_member(&mut self, conn: Uuid) {
        if self.members.remove(conn).is_none() {
            return;
        }
        let now = now_ms();
        self.touch(now);
        if self.host == Some(conn) {
            self.host = self.members.first_id();
            if let Some(new_host) = self.host {
                tracing::info!("Host of room {} reassigned to {}", self.id, new_host);
            }
        }
        if self.members.is_empty() {
            // The room lingers for idle eviction; media stays until then.
            return;
        }
        self.step_gates(now);
        self.broadcast_snapshot(now);
    }

    fn select_media(&mut self, conn: Uuid, info: ClientMediaInfo) {
        if !self.members.contains(conn) {
            return;
        }
        let now = now_ms();
        if self.host == Some(conn) {
            let descriptor = MediaDescriptor {
                id: Uuid::new_v4(),
                name: info.name.clone().unwrap_or_else(|| "media".to_string()),
                size: info.size,
                mime_type: info
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                duration: info.duration,
                sha256: info.sha256.clone(),
                selected_at: now,
            };
            self.install_media_state(descriptor, None, now);
            return;
        }

        // Non-hosts only ever move their own match state.
        let state = match self.media.media() {
            None => crate::protocol::MediaMatch::Missing,
            Some(room_media) => {
                if media::matches(room_media, &info) {
                    crate::protocol::MediaMatch::Matched
                } else {
                    crate::protocol::MediaMatch::Mismatch
                }
            }
        };
        if let Some(member) = self.members.get_mut(conn) {
            member.selected_media = Some(info);
            member.media_match = state;
        }
        if state != crate::protocol::MediaMatch::Matched {
            self.publisher.send_to(conn, ServerEvent::Error(MISMATCH_NOTICE.to_string()));
        }
        self.touch(now);
        self.broadcast_snapshot(now);
        self.step_gates(now);
    }

    fn install_media(
        &mut self,
        conn: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        duration: Option<f64>,
        sha256: String,
        file: StoredFile,
    ) -> Result<MediaDescriptor, InstallError> {
        if self.host != Some(conn) {
            return Err(InstallError::NotHost);
        }
        let now = now_ms();
        let descriptor = MediaDescriptor {
            id: Uuid::new_v4(),
            name,
            size,
            mime_type,
            duration,
            sha256,
            selected_at: now,
        };
        self.install_media_state(descriptor.clone(), Some(file), now);
        Ok(descriptor)
    }

    /// Shared tail of both media-replacement paths: swap the registry slot,
    /// reset member telemetry, recompute matches and targets, arm the
    /// startup gate, and start from a fresh paused state at zero.
    fn install_media_state(&mut self, descriptor: MediaDescriptor, file: Option<StoredFile>, now: u64) {
        let host = self.host;
        let host_info = ClientMediaInfo {
            sha256: descriptor.sha256.clone(),
            size: descriptor.size,
            duration: descriptor.duration,
            name: Some(descriptor.name.clone()),
            mime_type: Some(descriptor.mime_type.clone()),
        };
        self.media.replace_media(descriptor, file);
        self.startup_target = gate::startup_target(self.media.duration());
        self.resume_target = gate::resume_target(self.media.duration());

        let room_media = self.media.media().cloned();
        for member in self.members.iter_mut() {
            member.reset_telemetry();
            if host == Some(member.connection_id) {
                member.selected_media = Some(host_info.clone());
                member.media_match = crate::protocol::MediaMatch::Matched;
            } else {
                member.media_match = match (&room_media, &member.selected_media) {
                    (Some(room), Some(selected)) if media::matches(room, selected) => {
                        crate::protocol::MediaMatch::Matched
                    }
                    _ => crate::protocol::MediaMatch::Missing,
                };
            }
        }

        self.playback = PlaybackState::initial(now, host);
        self.startup_gate_active = true;
        self.pending_start_requested = false;
        self.resume_after_buffer = false;
        self.touch(now);
        self.broadcast_snapshot(now);
        self.broadcast_playback(now);
    }

    fn install_subtitle(
        &mut self,
        conn: Uuid,
        name: String,
        format: SubtitleFormat,
        language: Option<String>,
        file: StoredFile,
    ) -> Result<SubtitleDescriptor, InstallError> {
        if self.host != Some(conn) {
            return Err(InstallError::NotHost);
        }
        let now = now_ms();
        let descriptor = SubtitleDescriptor {
            id: Uuid::new_v4(),
            name,
            format,
            language,
            uploaded_at: now,
        };
        self.media.replace_subtitle(descriptor.clone(), Some(file));
        self.touch(now);
        self.broadcast_snapshot(now);
        Ok(descriptor)
    }

    fn playback_control(
        &mut self,
        conn: Uuid,
        position: f64,
        paused: bool,
        rate: f64,
        reason: Option<PlaybackReason>,
    ) {
        if self.media.media().is_none() || !self.members.contains(conn) {
            return;
        }
        let now = now_ms();
        self.touch(now);

        if !paused {
            if self.startup_gate_active {
                // The play intent is remembered; the gate decides when it
                // actually takes effect.
                self.pending_start_requested = true;
                if self.all_startup_ready(now) {
                    self.step_gates(now);
                } else {
                    self.playback.mark(
                        PlaybackPatch {
                            position: Some(position),
                            paused: Some(true),
                            rate: Some(rate),
                        },
                        PlaybackReason::StartupGate,
                        Some(conn),
                        now,
                    );
                    self.broadcast_playback(now);
                }
                return;
            }
            if self.sync_mode == SyncMode::Strict && self.members.any_buffering() {
                return;
            }
        }

        let reason = reason.unwrap_or(PlaybackReason::User);
        if reason == PlaybackReason::User {
            self.resume_after_buffer = false;
        }
        self.playback.mark(
            PlaybackPatch { position: Some(position), paused: Some(paused), rate: Some(rate) },
            reason,
            Some(conn),
            now,
        );
        self.broadcast_playback(now);
        self.step_gates(now);
    }

    fn report_buffering(&mut self, conn: Uuid, report: &BufferReport) {
        let now = now_ms();
        let Some(member) = self.members.get_mut(conn) else { return };
        member.apply_report(report, now);
        self.touch(now);
        self.step_gates(now);
    }

    fn set_sync_mode(&mut self, conn: Uuid, mode: SyncMode) {
        if self.host != Some(conn) {
            return;
        }
        let now = now_ms();
        self.sync_mode = mode;
        if mode == SyncMode::Soft {
            self.resume_after_buffer = false;
        }
        self.touch(now);
        if mode == SyncMode::Strict {
            self.step_gates(now);
        }
        self.broadcast_snapshot(now);
    }

    /// One gate evaluation. Runs after every mutation and on timer ticks;
    /// emits at most one playback transition per call.
    fn step_gates(&mut self, now: u64) {
        if self.media.media().is_none() || self.members.is_empty() {
            return;
        }

        if self.startup_gate_active {
            if self.pending_start_requested && self.all_startup_ready(now) {
                self.startup_gate_active = false;
                self.pending_start_requested = false;
                // Subscribers see the disarmed room before the unpause.
                self.broadcast_snapshot(now);
                self.playback.mark(
                    PlaybackPatch { paused: Some(false), ..Default::default() },
                    PlaybackReason::StartupGate,
                    self.host,
                    now,
                );
                self.touch(now);
                self.broadcast_playback(now);
            }
            return;
        }

        let duration = self.media.duration();
        let position = self.playback.position_at(now);

        if !self.playback.paused {
            if gate::should_pause_for_buffering(self.members.iter(), self.sync_mode, duration, position, now)
            {
                self.playback.mark(
                    PlaybackPatch { position: Some(position), paused: Some(true), rate: None },
                    PlaybackReason::BufferLock,
                    self.host,
                    now,
                );
                self.resume_after_buffer = true;
                self.touch(now);
                self.broadcast_playback(now);
            }
        } else if self.resume_after_buffer {
            let ready = !self.members.any_buffering()
                && self
                    .members
                    .iter()
                    .all(|m| gate::resume_ready(m, self.resume_target, duration, position));
            if ready {
                self.resume_after_buffer = false;
                self.playback.mark(
                    PlaybackPatch { paused: Some(false), ..Default::default() },
                    PlaybackReason::BufferLock,
                    self.host,
                    now,
                );
                self.touch(now);
                self.broadcast_playback(now);
            }
        }
    }

    fn all_startup_ready(&self, now: u64) -> bool {
        let duration = self.media.duration();
        let position = self.playback.position_at(now);
        !self.members.is_empty()
            && self
                .members
                .iter()
                .all(|m| gate::startup_ready(m, self.startup_target, duration, position))
    }

    fn touch(&mut self, now: u64) {
        self.last_active_at = now;
    }

    fn snapshot(&self, now: u64) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            requires_password: self.password_digest.is_some(),
            sync_mode: self.sync_mode,
            is_preparing: self.startup_gate_active,
            pending_start_requested: self.pending_start_requested,
            max_members: self.max_members,
            server_time: now,
            host_id: self.host,
            media: self.media.media().cloned(),
            subtitle: self.media.subtitle().cloned(),
            playback_state: self.playback.clone(),
            members: self.members.summaries(self.host),
            startup_buffer_target_seconds: self.startup_target,
            resume_buffer_target_seconds: self.resume_target,
        }
    }

    fn envelope(&self, now: u64) -> PlaybackEnvelope {
        PlaybackEnvelope {
            state: self.playback.clone(),
            server_time: now,
            buffering_users: self
                .members
                .iter()
                .filter(|m| m.buffering)
                .map(|m| m.nickname.clone())
                .collect(),
        }
    }

    fn status(&self) -> RoomStatus {
        let host_nickname = self
            .host
            .and_then(|id| self.members.get(id))
            .map(|m| m.nickname.clone())
            .unwrap_or_default();
        let playback_state = if self.media.media().is_none() {
            DiscoveryPlayback::Idle
        } else if self.playback.paused {
            DiscoveryPlayback::Paused
        } else {
            DiscoveryPlayback::Playing
        };
        RoomStatus {
            summary: RoomSummary {
                room_id: self.id.clone(),
                room_name: self.name.clone(),
                host_nickname,
                requires_password: self.password_digest.is_some(),
                member_count: self.members.len(),
                max_members: self.max_members,
                media_name: self.media.media().map(|m| m.name.clone()),
                subtitle_name: self.media.subtitle().map(|s| s.name.clone()),
                playback_state,
            },
            member_count: self.members.len(),
            last_active_at: self.last_active_at,
        }
    }

    /// File lookup for the HTTP byte-server; the command queue keeps this
    /// ordered against media replacement.
    fn media_file(&self, id: Uuid) -> Option<(std::path::PathBuf, MediaDescriptor)> {
        self.media.media_file(id).map(|(p, d)| (p.to_path_buf(), d.clone()))
    }

    fn subtitle_file(&self, id: Uuid) -> Option<(std::path::PathBuf, SubtitleDescriptor)> {
        self.media.subtitle_file(id).map(|(p, d)| (p.to_path_buf(), d.clone()))
    }

    fn broadcast_snapshot(&self, now: u64) {
        let targets = self.members.ids();
        self.publisher.send_many(&targets, &ServerEvent::Snapshot(self.snapshot(now)));
    }

    fn broadcast_snapshot_except(&self, except: Uuid, now: u64) {
        let targets: Vec<Uuid> = self.members.ids().into_iter().filter(|id| *id != except).collect();
        if !targets.is_empty() {
            self.publisher.send_many(&targets, &ServerEvent::Snapshot(self.snapshot(now)));
        }
    }

    fn broadcast_playback(&self, now: u64) {
        let targets = self.members.ids();
        self.publisher.send_many(&targets, &ServerEvent::Playback(self.envelope(now)));
    }
}

/// File lookups used by the HTTP layer, answered on the room queue.
pub enum FileQuery {
    Media(Uuid, oneshot::Sender<Option<(std::path::PathBuf, MediaDescriptor)>>),
    Subtitle(Uuid, oneshot::Sender<Option<(std::path::PathBuf, SubtitleDescriptor)>>),
}

impl RoomHandle {
    pub async fn media_file(&self, id: Uuid) -> Option<(std::path::PathBuf, MediaDescriptor)> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::FileQuery(FileQuery::Media(id, tx)));
        rx.await.ok().flatten()
    }

    pub async fn subtitle_file(&self, id: Uuid) -> Option<(std::path::PathBuf, SubtitleDescriptor)> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::FileQuery(FileQuery::Subtitle(id, tx)));
        rx.await.ok().flatten()
    }
}

/// Spawn the owning task for a room and hand back its queue.
pub fn spawn(mut room: Room, config: &Config) -> RoomHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<RoomCommand>();
    let playback_every = config.playback_heartbeat;
    let snapshot_every = config.snapshot_heartbeat;
    tokio::spawn(async move {
        let mut playback_tick = tokio::time::interval(playback_every);
        let mut snapshot_tick = tokio::time::interval(snapshot_every);
        playback_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => {
                            if !room.handle(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = playback_tick.tick() => {
                    if !room.members.is_empty() && room.media.media().is_some() {
                        room.broadcast_playback(now_ms());
                    }
                }
                _ = snapshot_tick.tick() => {
                    if !room.members.is_empty() {
                        room.broadcast_snapshot(now_ms());
                    }
                }
            }
        }
    });
    RoomHandle { tx }
}

fn sanitize_room_name(name: Option<&str>, id: &str) -> String {
    let trimmed = name.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        id.to_string()
    } else {
        trimmed.chars().take(MAX_ROOM_NAME_LEN).collect()
    }
}

/// Passwords are stored as a digest salted by the room id, never as text.
fn hash_password(password: &str, room_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(room_id.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn snapshot_nickname(snapshot: &RoomSnapshot, conn: Uuid) -> String {
    snapshot
        .members
        .iter()
        .find(|m| m.connection_id == conn)
        .map(|m| m.nickname.clone())
        .unwrap_or_else(|| conn.to_string())
}
