//! Playback drift correction.
//!
//! Large drift is fixed with a seek. Moderate drift is fixed by running the
//! local player slightly fast or slow for a short while, which is invisible
//! compared to a seek. Small drift is left alone so jitter does not cause
//! oscillation.

use std::time::Duration;

use huddle_common::{TheaterConfig, TheaterSession, TheaterStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftAction {
    /// Close enough.
    None,
    /// Jump to the broadcast position.
    Seek { to: f64 },
    /// Play at `rate` for `duration`, then return to 1.0.
    Nudge { rate: f64, duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftPolicy {
    pub seek_threshold: f64,
    pub nudge_threshold: f64,
    pub rate_bias: f64,
    pub nudge_duration: Duration,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self::from_config(&TheaterConfig::default())
    }
}

impl DriftPolicy {
    pub fn from_config(config: &TheaterConfig) -> Self {
        Self {
            seek_threshold: config.seek_threshold,
            nudge_threshold: config.nudge_threshold,
            rate_bias: config.rate_bias,
            nudge_duration: config.nudge_duration,
        }
    }

    /// Correction for a player at `local` seconds while the host is at
    /// `broadcast` seconds, both playing.
    pub fn decide(&self, local: f64, broadcast: f64) -> DriftAction {
        let drift = broadcast - local;
        let magnitude = drift.abs();
        if magnitude > self.seek_threshold {
            DriftAction::Seek { to: broadcast }
        } else if magnitude >= self.nudge_threshold {
            let rate = if drift > 0.0 {
                1.0 + self.rate_bias
            } else {
                1.0 - self.rate_bias
            };
            DriftAction::Nudge {
                rate,
                duration: self.nudge_duration,
            }
        } else {
            DriftAction::None
        }
    }

    /// Correction for a paused player. A rate change does nothing while
    /// paused, so anything worth correcting is a seek.
    pub fn decide_paused(&self, local: f64, broadcast: f64) -> DriftAction {
        if (broadcast - local).abs() >= self.nudge_threshold {
            DriftAction::Seek { to: broadcast }
        } else {
            DriftAction::None
        }
    }
}

/// Where the host's player is at `now_ms`, extrapolated from the last write
/// while playing.
pub fn expected_position(session: &TheaterSession, now_ms: i64) -> f64 {
    match session.status {
        TheaterStatus::Playing => {
            let elapsed = now_ms.saturating_sub(session.updated_at).max(0) as f64 / 1000.0;
            session.current_time + elapsed
        }
        TheaterStatus::Paused | TheaterStatus::Ended => session.current_time,
    }
}
