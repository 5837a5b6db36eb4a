use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{BufferReport, ClientMediaInfo, MediaMatch, MemberSummary};

pub const MAX_NICKNAME_LEN: usize = 24;

/// One connected member of a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub connection_id: Uuid,
    pub nickname: String,
    pub media_match: MediaMatch,
    pub selected_media: Option<ClientMediaInfo>,
    pub buffering: bool,
    /// Client-asserted readiness flag, surfaced in snapshots. The gates
    /// decide from the telemetry below, not from this.
    pub startup_ready: bool,
    pub buffer_ahead_seconds: f64,
    pub ready_state: u8,
    pub can_play_through: bool,
    pub buffering_started_at: Option<u64>,
    pub connected_at: u64,
}

impl Member {
    pub fn new(connection_id: Uuid, nickname: &str, now: u64) -> Self {
        Self {
            connection_id,
            nickname: sanitize_nickname(nickname, connection_id),
            media_match: MediaMatch::Missing,
            selected_media: None,
            buffering: false,
            startup_ready: false,
            buffer_ahead_seconds: 0.0,
            ready_state: 0,
            can_play_through: false,
            buffering_started_at: None,
            connected_at: now,
        }
    }

    /// Apply a telemetry report, sampling `buffering_started_at` on the
    /// rising edge and clearing it on the falling edge.
    pub fn apply_report(&mut self, report: &BufferReport, now: u64) {
        if report.buffering && !self.buffering {
            self.buffering_started_at = Some(now);
        } else if !report.buffering {
            self.buffering_started_at = None;
        }
        self.buffering = report.buffering;
        self.buffer_ahead_seconds = if report.buffer_ahead_seconds.is_finite() {
            report.buffer_ahead_seconds.max(0.0)
        } else {
            0.0
        };
        self.ready_state = report.ready_state.min(4);
        self.can_play_through = report.can_play_through;
        self.startup_ready = report.startup_ready;
    }

    /// Clear all playback telemetry, used when the room's media changes.
    pub fn reset_telemetry(&mut self) {
        self.buffering = false;
        self.startup_ready = false;
        self.buffer_ahead_seconds = 0.0;
        self.ready_state = 0;
        self.can_play_through = false;
        self.buffering_started_at = None;
    }

    pub fn summary(&self, host: Option<Uuid>) -> MemberSummary {
        MemberSummary {
            connection_id: self.connection_id,
            nickname: self.nickname.clone(),
            is_host: host == Some(self.connection_id),
            media_match: self.media_match,
            buffering: self.buffering,
            startup_ready: self.startup_ready,
            buffer_ahead_seconds: self.buffer_ahead_seconds,
            ready_state: self.ready_state,
            can_play_through: self.can_play_through,
            connected_at: self.connected_at,
        }
    }
}

/// Trim, clamp to [`MAX_NICKNAME_LEN`] characters, and fall back to a
/// `Viewer-XX` handle derived from the connection id.
pub fn sanitize_nickname(raw: &str, connection_id: Uuid) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        let bytes = connection_id.as_bytes();
        return format!("Viewer-{:02X}", bytes[0]);
    }
    trimmed.chars().take(MAX_NICKNAME_LEN).collect()
}

/// Insertion-ordered member map. Host reassignment needs the join order, so
/// removal keeps the remaining order intact. n is bounded by `max_members`;
/// linear scans are fine.
#[derive(Debug, Default)]
pub struct MemberTable {
    order: Vec<Uuid>,
    members: HashMap<Uuid, Member>,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Member> {
        self.members.get_mut(&id)
    }

    pub fn insert(&mut self, member: Member) {
        let id = member.connection_id;
        if self.members.insert(id, member).is_none() {
            self.order.push(id);
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Member> {
        let removed = self.members.remove(&id);
        if removed.is_some() {
            self.order.retain(|other| *other != id);
        }
        removed
    }

    /// Earliest-joined member still present; the host-reassignment target.
    pub fn first_id(&self) -> Option<Uuid> {
        self.order.first().copied()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.order.clone()
    }

    /// Members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.order.iter().filter_map(|id| self.members.get(id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.members.values_mut()
    }

    pub fn any_buffering(&self) -> bool {
        self.iter().any(|m| m.buffering)
    }

    /// Summaries with the host first, everyone else in insertion order.
    pub fn summaries(&self, host: Option<Uuid>) -> Vec<MemberSummary> {
        let mut out: Vec<MemberSummary> = self.iter().map(|m| m.summary(host)).collect();
        out.sort_by_key(|m| !m.is_host);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn nickname_sanitation() {
        assert_eq!(sanitize_nickname("  Alice  ", id(1)), "Alice");
        assert_eq!(sanitize_nickname("", id(0xAB)), "Viewer-AB");
        assert_eq!(sanitize_nickname("   ", id(0x0C)), "Viewer-0C");
        let long = "x".repeat(40);
        assert_eq!(sanitize_nickname(&long, id(1)).len(), MAX_NICKNAME_LEN);
    }

    #[test]
    fn insertion_order_survives_removal() {
        let mut table = MemberTable::new();
        for n in 1..=4 {
            table.insert(Member::new(id(n), &format!("m{n}"), n as u64));
        }
        table.remove(id(1));
        assert_eq!(table.first_id(), Some(id(2)));
        let order: Vec<Uuid> = table.iter().map(|m| m.connection_id).collect();
        assert_eq!(order, vec![id(2), id(3), id(4)]);
    }

    #[test]
    fn reinsert_keeps_original_slot() {
        let mut table = MemberTable::new();
        table.insert(Member::new(id(1), "a", 0));
        table.insert(Member::new(id(2), "b", 0));
        table.insert(Member::new(id(1), "a2", 1));
        assert_eq!(table.len(), 2);
        assert_eq!(table.first_id(), Some(id(1)));
        assert_eq!(table.get(id(1)).unwrap().nickname, "a2");
    }

    #[test]
    fn buffering_edge_sampling() {
        let mut member = Member::new(id(1), "a", 0);
        let mut report = BufferReport { buffering: true, ..Default::default() };
        member.apply_report(&report, 100);
        assert_eq!(member.buffering_started_at, Some(100));

        // Still buffering: the original edge timestamp is kept.
        member.apply_report(&report, 200);
        assert_eq!(member.buffering_started_at, Some(100));

        report.buffering = false;
        member.apply_report(&report, 300);
        assert_eq!(member.buffering_started_at, None);
    }

    #[test]
    fn summaries_put_host_first() {
        let mut table = MemberTable::new();
        table.insert(Member::new(id(1), "a", 0));
        table.insert(Member::new(id(2), "b", 0));
        table.insert(Member::new(id(3), "c", 0));
        let summaries = table.summaries(Some(id(2)));
        assert!(summaries[0].is_host);
        assert_eq!(summaries[0].nickname, "b");
        assert_eq!(summaries[1].nickname, "a");
        assert_eq!(summaries[2].nickname, "c");
    }
}
