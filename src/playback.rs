use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why the playback state last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackReason {
    User,
    BufferLock,
    StartupGate,
    MediaTransfer,
}

pub const MIN_RATE: f64 = 0.5;
pub const MAX_RATE: f64 = 2.0;

/// Authoritative playback state for a room. Replaced atomically by
/// [`PlaybackState::mark`]; the current position is derived from
/// `updated_at` and the wall clock, never ticked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub position: f64,
    pub paused: bool,
    pub rate: f64,
    pub updated_at: u64,
    pub updated_by: Option<Uuid>,
    pub reason: PlaybackReason,
}

/// Partial update applied by [`PlaybackState::mark`]. `None` keeps the
/// current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackPatch {
    pub position: Option<f64>,
    pub paused: Option<bool>,
    pub rate: Option<f64>,
}

impl PlaybackState {
    /// Fresh state after a media replacement: paused at zero, rate 1.
    pub fn initial(now: u64, by: Option<Uuid>) -> Self {
        Self {
            position: 0.0,
            paused: true,
            rate: 1.0,
            updated_at: now,
            updated_by: by,
            reason: PlaybackReason::MediaTransfer,
        }
    }

    /// The only mutator. Clamps position to ≥ 0 and rate to [0.5, 2]
    /// (NaN becomes 1), stamps `updated_at`.
    pub fn mark(&mut self, patch: PlaybackPatch, reason: PlaybackReason, by: Option<Uuid>, now: u64) {
        if let Some(position) = patch.position {
            self.position = if position.is_finite() { position.max(0.0) } else { 0.0 };
        }
        if let Some(paused) = patch.paused {
            self.paused = paused;
        }
        if let Some(rate) = patch.rate {
            self.rate = if rate.is_nan() { 1.0 } else { rate.clamp(MIN_RATE, MAX_RATE) };
        }
        self.updated_at = now;
        self.updated_by = by;
        self.reason = reason;
    }

    /// Position at `now`: frozen while paused, otherwise advanced by elapsed
    /// wall time scaled by the rate.
    pub fn position_at(&self, now: u64) -> f64 {
        if self.paused {
            return self.position;
        }
        let elapsed = now.saturating_sub(self.updated_at) as f64 / 1000.0;
        self.position + elapsed * self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PlaybackState {
        PlaybackState::initial(1_000, None)
    }

    #[test]
    fn initial_is_paused_at_zero() {
        let state = fresh();
        assert!(state.paused);
        assert_eq!(state.position, 0.0);
        assert_eq!(state.rate, 1.0);
        assert_eq!(state.reason, PlaybackReason::MediaTransfer);
    }

    #[test]
    fn mark_clamps_position_and_rate() {
        let mut state = fresh();
        state.mark(
            PlaybackPatch { position: Some(-3.0), paused: Some(false), rate: Some(9.0) },
            PlaybackReason::User,
            None,
            2_000,
        );
        assert_eq!(state.position, 0.0);
        assert_eq!(state.rate, MAX_RATE);

        state.mark(
            PlaybackPatch { rate: Some(f64::NAN), ..Default::default() },
            PlaybackReason::User,
            None,
            3_000,
        );
        assert_eq!(state.rate, 1.0);

        state.mark(
            PlaybackPatch { rate: Some(0.1), ..Default::default() },
            PlaybackReason::User,
            None,
            4_000,
        );
        assert_eq!(state.rate, MIN_RATE);
    }

    #[test]
    fn position_derivation_scales_by_rate() {
        let mut state = fresh();
        state.mark(
            PlaybackPatch { position: Some(10.0), paused: Some(false), rate: Some(2.0) },
            PlaybackReason::User,
            None,
            1_000,
        );
        // 3 seconds of wall time at 2x.
        assert!((state.position_at(4_000) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn position_frozen_while_paused() {
        let mut state = fresh();
        state.mark(
            PlaybackPatch { position: Some(42.0), paused: Some(true), ..Default::default() },
            PlaybackReason::User,
            None,
            1_000,
        );
        assert_eq!(state.position_at(99_000), 42.0);
    }

    #[test]
    fn derived_position_is_monotonic_without_seeks() {
        let mut state = fresh();
        state.mark(
            PlaybackPatch { position: Some(5.0), paused: Some(false), ..Default::default() },
            PlaybackReason::User,
            None,
            1_000,
        );
        let mut last = 0.0;
        for now in (1_000..10_000).step_by(137) {
            let pos = state.position_at(now);
            assert!(pos >= last);
            last = pos;
        }
    }
}
