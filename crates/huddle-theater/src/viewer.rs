//! Viewer-side playback following.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use huddle_common::{now_millis, TheaterSession, TheaterStatus};

use crate::drift::{expected_position, DriftAction, DriftPolicy};
use crate::session::TheaterWatch;

/// The local player a viewer keeps aligned with the host.
pub trait PlaybackClock: Send {
    /// Current position in seconds.
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, to: f64);
    fn set_rate(&mut self, rate: f64);
}

/// Applies the drift policy to a [`PlaybackClock`] and undoes rate nudges
/// once they have run their course.
pub struct ViewerSync<C> {
    clock: C,
    policy: DriftPolicy,
    nudge_until: Option<Instant>,
}

impl<C: PlaybackClock> ViewerSync<C> {
    pub fn new(clock: C, policy: DriftPolicy) -> Self {
        Self {
            clock,
            policy,
            nudge_until: None,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn into_clock(self) -> C {
        self.clock
    }

    pub fn is_nudging(&self) -> bool {
        self.nudge_until.is_some()
    }

    /// Bring the local player in line with `session` as of wall time
    /// `now_ms`. Returns the correction that was applied.
    pub fn reconcile(&mut self, session: &TheaterSession, now_ms: i64, now: Instant) -> DriftAction {
        self.tick(now);

        match session.status {
            TheaterStatus::Ended => {
                if self.clock.is_playing() {
                    self.clock.pause();
                }
                self.reset_rate();
                return DriftAction::None;
            }
            TheaterStatus::Playing if !self.clock.is_playing() => self.clock.play(),
            TheaterStatus::Paused if self.clock.is_playing() => self.clock.pause(),
            _ => {}
        }

        let local = self.clock.position();
        let broadcast = expected_position(session, now_ms);
        let action = if session.status == TheaterStatus::Playing {
            self.policy.decide(local, broadcast)
        } else {
            self.policy.decide_paused(local, broadcast)
        };

        match action {
            DriftAction::Seek { to } => {
                self.reset_rate();
                self.clock.seek(to);
                debug!("seeked from {:.2}s to {:.2}s", local, to);
            }
            DriftAction::Nudge { rate, duration } => {
                // One nudge at a time; the next check re-evaluates.
                if self.nudge_until.is_none() {
                    self.clock.set_rate(rate);
                    self.nudge_until = Some(now + duration);
                    debug!("nudging at {:.2}x ({:.2}s behind host)", rate, broadcast - local);
                }
            }
            DriftAction::None => trace!("in sync at {:.2}s", local),
        }
        action
    }

    /// Restore normal speed once a nudge has expired.
    pub fn tick(&mut self, now: Instant) {
        if let Some(until) = self.nudge_until {
            if now >= until {
                self.nudge_until = None;
                self.clock.set_rate(1.0);
            }
        }
    }

    fn reset_rate(&mut self) {
        if self.nudge_until.take().is_some() {
            self.clock.set_rate(1.0);
        }
    }
}

/// Follow a session until it ends or is deleted, reconciling on every
/// update and every `interval` in between. Returns the sync state so the
/// caller gets its player back.
pub async fn follow<C: PlaybackClock>(
    mut watch: TheaterWatch,
    mut sync: ViewerSync<C>,
    interval: Duration,
) -> ViewerSync<C> {
    let mut latest: Option<TheaterSession> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            update = watch.next() => match update {
                Some(Some(session)) => {
                    sync.reconcile(&session, now_millis(), Instant::now());
                    if session.status == TheaterStatus::Ended {
                        debug!("theater session {} ended", session.id);
                        break;
                    }
                    latest = Some(session);
                }
                Some(None) | None => break,
            },
            _ = ticker.tick() => match &latest {
                Some(session) => {
                    sync.reconcile(session, now_millis(), Instant::now());
                }
                None => sync.tick(Instant::now()),
            },
        }
    }
    sync
}

/// A player driven by the caller: position only moves through
/// [`SimulatedClock::advance`]. Records every seek and rate change.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedClock {
    position: f64,
    playing: bool,
    rate: f64,
    pub seeks: Vec<f64>,
    pub rate_changes: Vec<f64>,
}

impl SimulatedClock {
    pub fn new(position: f64, playing: bool) -> Self {
        Self {
            position,
            playing,
            rate: 1.0,
            seeks: Vec::new(),
            rate_changes: Vec::new(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Let `secs` of wall time pass.
    pub fn advance(&mut self, secs: f64) {
        if self.playing {
            self.position += secs * self.rate;
        }
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0.0, false)
    }
}

impl PlaybackClock for SimulatedClock {
    fn position(&self) -> f64 {
        self.position
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn seek(&mut self, to: f64) {
        self.position = to;
        self.seeks.push(to);
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
        self.rate_changes.push(rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: TheaterStatus, current_time: f64, updated_at: i64) -> TheaterSession {
        TheaterSession {
            id: "t1".into(),
            room_id: "room".into(),
            host_id: "host".into(),
            host_name: "Host".into(),
            video: None,
            status,
            current_time,
            last_action: None,
            participants: vec!["host".into()],
            queue: Vec::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_large_drift_seeks_without_rate_change() {
        let now_ms = now_millis();
        let mut sync = ViewerSync::new(SimulatedClock::new(10.0, true), DriftPolicy::default());
        let action = sync.reconcile(
            &session(TheaterStatus::Playing, 13.0, now_ms),
            now_ms,
            Instant::now(),
        );
        assert_eq!(action, DriftAction::Seek { to: 13.0 });
        assert_eq!(sync.clock().position(), 13.0);
        assert!(sync.clock().rate_changes.is_empty());
    }

    #[test]
    fn test_nudge_is_restored_after_duration() {
        let now_ms = now_millis();
        let start = Instant::now();
        let mut sync = ViewerSync::new(SimulatedClock::new(10.0, true), DriftPolicy::default());
        let state = session(TheaterStatus::Playing, 11.0, now_ms);

        assert!(matches!(
            sync.reconcile(&state, now_ms, start),
            DriftAction::Nudge { .. }
        ));
        assert!((sync.clock().rate() - 1.05).abs() < 1e-9);

        // A second check inside the window does not stack another nudge.
        sync.reconcile(&state, now_ms, start + Duration::from_millis(500));
        assert_eq!(sync.clock().rate_changes.len(), 1);

        sync.tick(start + Duration::from_secs(1));
        assert!(!sync.is_nudging());
        assert_eq!(sync.clock().rate(), 1.0);
        assert!(sync.clock().seeks.is_empty());
    }

    #[test]
    fn test_status_is_mirrored() {
        let now_ms = now_millis();
        let mut sync = ViewerSync::new(SimulatedClock::new(5.0, false), DriftPolicy::default());

        sync.reconcile(&session(TheaterStatus::Playing, 5.0, now_ms), now_ms, Instant::now());
        assert!(sync.clock().is_playing());

        sync.reconcile(&session(TheaterStatus::Paused, 5.0, now_ms), now_ms, Instant::now());
        assert!(!sync.clock().is_playing());

        sync.clock_mut().play();
        sync.reconcile(&session(TheaterStatus::Ended, 5.0, now_ms), now_ms, Instant::now());
        assert!(!sync.clock().is_playing());
    }

    #[test]
    fn test_playing_position_is_extrapolated() {
        let updated_at = now_millis() - 3_000;
        let mut sync = ViewerSync::new(SimulatedClock::new(13.0, true), DriftPolicy::default());
        let action = sync.reconcile(
            &session(TheaterStatus::Playing, 10.0, updated_at),
            updated_at + 3_000,
            Instant::now(),
        );
        assert_eq!(action, DriftAction::None);
    }

    #[test]
    fn test_seek_cancels_running_nudge() {
        let now_ms = now_millis();
        let start = Instant::now();
        let mut sync = ViewerSync::new(SimulatedClock::new(10.0, true), DriftPolicy::default());
        sync.reconcile(&session(TheaterStatus::Playing, 11.0, now_ms), now_ms, start);
        assert!(sync.is_nudging());

        sync.reconcile(&session(TheaterStatus::Playing, 40.0, now_ms), now_ms, start);
        assert!(!sync.is_nudging());
        assert_eq!(sync.clock().rate(), 1.0);
        assert_eq!(sync.clock().seeks, vec![40.0]);
    }
}
