use crate::member::Member;
use crate::protocol::{MediaMatch, SyncMode};

/// Smallest buffer target a member can be held to, seconds.
const TARGET_FLOOR_SECS: f64 = 0.8;

/// Startup buffer target: 2% of the duration, clamped to [8, 24] seconds;
/// 12 when the duration is unknown.
pub fn startup_target(duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => (d * 0.02).clamp(8.0, 24.0),
        _ => 12.0,
    }
}

/// Resume buffer target: 1% of the duration, clamped to [3, 10] seconds;
/// 6 when the duration is unknown.
pub fn resume_target(duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => (d * 0.01).clamp(3.0, 10.0),
        _ => 6.0,
    }
}

/// Clip a buffer target by the remaining duration, with a floor of
/// [`TARGET_FLOOR_SECS`]. Nothing left to play means nothing to buffer.
pub fn effective_target(target: f64, duration: Option<f64>, position: f64) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => {
            let remaining = d - position;
            if remaining <= 0.0 {
                0.0
            } else {
                target.min(remaining).max(TARGET_FLOOR_SECS)
            }
        }
        _ => target,
    }
}

/// Grace window before a soft-mode buffering report pauses the room,
/// scaled down near the end of the media.
pub fn soft_grace_ms(duration: Option<f64>, position: f64) -> u64 {
    let remaining = match duration {
        Some(d) if d.is_finite() && d > 0.0 => d - position,
        _ => f64::INFINITY,
    };
    if remaining <= 5.0 {
        0
    } else if remaining <= 15.0 {
        350
    } else {
        900
    }
}

fn buffer_satisfied(member: &Member, target: f64) -> bool {
    member.can_play_through
        || member.ready_state >= 4
        || (member.ready_state >= 3 && member.buffer_ahead_seconds >= target)
}

/// Per-member startup-ready predicate (§startup gate): the member holds the
/// same file and has enough runway to start together.
pub fn startup_ready(member: &Member, startup_target: f64, duration: Option<f64>, position: f64) -> bool {
    member.media_match == MediaMatch::Matched
        && buffer_satisfied(member, effective_target(startup_target, duration, position))
}

/// Per-member resume-ready predicate: same as startup readiness but also
/// requires the member to have stopped buffering.
pub fn resume_ready(member: &Member, resume_target: f64, duration: Option<f64>, position: f64) -> bool {
    member.media_match == MediaMatch::Matched
        && !member.buffering
        && buffer_satisfied(member, effective_target(resume_target, duration, position))
}

/// Whether the room must be force-paused for buffering right now.
///
/// Strict mode pauses on any buffering member. Soft mode tolerates a short
/// stall unless the member is badly starved (`ready_state < 3`) or the
/// stall outlives the grace window.
pub fn should_pause_for_buffering<'a>(
    members: impl Iterator<Item = &'a Member>,
    mode: SyncMode,
    duration: Option<f64>,
    position: f64,
    now: u64,
) -> bool {
    let grace = soft_grace_ms(duration, position);
    members.filter(|m| m.buffering).any(|m| {
        if mode == SyncMode::Strict {
            return true;
        }
        if m.ready_state < 3 {
            return true;
        }
        m.buffering_started_at
            .map(|since| now.saturating_sub(since) >= grace)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use crate::protocol::BufferReport;
    use uuid::Uuid;

    fn member(report: BufferReport, matched: bool) -> Member {
        let mut m = Member::new(Uuid::from_bytes([7; 16]), "m", 0);
        m.apply_report(&report, 0);
        m.media_match = if matched { MediaMatch::Matched } else { MediaMatch::Missing };
        m
    }

    #[test]
    fn startup_target_bands() {
        // 100 s media: 2% = 2 s, clamped up to 8.
        assert_eq!(startup_target(Some(100.0)), 8.0);
        // 1000 s media: 2% = 20 s, inside the band.
        assert_eq!(startup_target(Some(1000.0)), 20.0);
        // 3 h media: clamped down to 24.
        assert_eq!(startup_target(Some(10_800.0)), 24.0);
        assert_eq!(startup_target(None), 12.0);
    }

    #[test]
    fn resume_target_bands() {
        assert_eq!(resume_target(Some(100.0)), 3.0);
        assert_eq!(resume_target(Some(10_800.0)), 10.0);
        assert_eq!(resume_target(None), 6.0);
    }

    #[test]
    fn effective_target_clips_to_remaining() {
        assert_eq!(effective_target(8.0, Some(100.0), 0.0), 8.0);
        // 2 s remain: clipped, but not below the floor.
        assert_eq!(effective_target(8.0, Some(100.0), 98.0), 2.0_f64.max(0.8));
        assert_eq!(effective_target(8.0, Some(100.0), 99.9), 0.8);
        // Past the end.
        assert_eq!(effective_target(8.0, Some(100.0), 120.0), 0.0);
        // Unknown duration: target passes through.
        assert_eq!(effective_target(8.0, None, 50.0), 8.0);
    }

    #[test]
    fn startup_ready_needs_match_and_runway() {
        let short = BufferReport { ready_state: 3, buffer_ahead_seconds: 3.0, ..Default::default() };
        let deep = BufferReport { ready_state: 3, buffer_ahead_seconds: 9.0, ..Default::default() };
        let done = BufferReport { ready_state: 4, ..Default::default() };
        let through = BufferReport { can_play_through: true, ..Default::default() };

        // Scenario from a 100 s file: startup target 8 s.
        assert!(!startup_ready(&member(short, true), 8.0, Some(100.0), 0.0));
        assert!(startup_ready(&member(deep, true), 8.0, Some(100.0), 0.0));
        assert!(startup_ready(&member(done, true), 8.0, Some(100.0), 0.0));
        assert!(startup_ready(&member(through, true), 8.0, Some(100.0), 0.0));
        // No file match, no readiness.
        assert!(!startup_ready(&member(done, false), 8.0, Some(100.0), 0.0));
    }

    #[test]
    fn resume_ready_requires_not_buffering() {
        let report = BufferReport {
            buffering: true,
            ready_state: 4,
            ..Default::default()
        };
        assert!(!resume_ready(&member(report, true), 6.0, None, 0.0));
        let report = BufferReport { ready_state: 4, ..Default::default() };
        assert!(resume_ready(&member(report, true), 6.0, None, 0.0));
    }

    #[test]
    fn strict_mode_pauses_immediately() {
        let buffering = member(BufferReport { buffering: true, ready_state: 4, ..Default::default() }, true);
        assert!(should_pause_for_buffering(
            std::iter::once(&buffering),
            SyncMode::Strict,
            Some(600.0),
            10.0,
            0,
        ));
    }

    #[test]
    fn soft_mode_waits_out_the_grace_window() {
        let mut m = Member::new(Uuid::from_bytes([1; 16]), "m", 0);
        m.media_match = MediaMatch::Matched;
        m.apply_report(
            &BufferReport { buffering: true, ready_state: 3, ..Default::default() },
            1_000,
        );

        // Plenty of runway left: 900 ms grace.
        let members = [m];
        assert!(!should_pause_for_buffering(members.iter(), SyncMode::Soft, Some(600.0), 10.0, 1_500));
        assert!(should_pause_for_buffering(members.iter(), SyncMode::Soft, Some(600.0), 10.0, 1_900));
    }

    #[test]
    fn soft_mode_starved_member_pauses_at_once() {
        let starved = member(BufferReport { buffering: true, ready_state: 2, ..Default::default() }, true);
        assert!(should_pause_for_buffering(
            std::iter::once(&starved),
            SyncMode::Soft,
            Some(600.0),
            10.0,
            0,
        ));
    }

    #[test]
    fn grace_shrinks_near_the_end() {
        assert_eq!(soft_grace_ms(Some(100.0), 50.0), 900);
        assert_eq!(soft_grace_ms(Some(100.0), 88.0), 350);
        assert_eq!(soft_grace_ms(Some(100.0), 97.0), 0);
        assert_eq!(soft_grace_ms(None, 50.0), 900);
    }
}
