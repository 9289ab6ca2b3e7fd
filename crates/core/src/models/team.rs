//! Team timer model - one team's countdown state machine
//!
//! Time accounting is tick-based (`time_left` drops by one per eligible
//! heartbeat) and periodically re-anchored to the monotonic clock by
//! [`Team::correct_drift`].

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default interval between two drift corrections (3 min 11 s)
pub const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(3 * 60 + 11);

/// Lifecycle of a team timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamState {
    Ready,
    Running,
    Paused,
    Finished,
}

impl TeamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamState::Ready => "ready",
            TeamState::Running => "running",
            TeamState::Paused => "paused",
            TeamState::Finished => "finished",
        }
    }
}

impl fmt::Display for TeamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speed multiplier, transmitted as a plain number (0.5, 1, 2 or 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum Speed {
    Half,
    #[default]
    Normal,
    Double,
    Quadruple,
}

impl Speed {
    /// Multiplier applied to the countdown
    pub fn factor(self) -> f64 {
        match self {
            Speed::Half => 0.5,
            Speed::Normal => 1.0,
            Speed::Double => 2.0,
            Speed::Quadruple => 4.0,
        }
    }

    /// Number of heartbeats between two advances of a team at this speed
    ///
    /// The heartbeat counter cycles through eight values, so a team is
    /// advanced when `counter % modulus == 0`.
    pub fn tick_modulus(self) -> u8 {
        match self {
            Speed::Half => 8,
            Speed::Normal => 4,
            Speed::Double => 2,
            Speed::Quadruple => 1,
        }
    }
}

impl TryFrom<f64> for Speed {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value == 0.5 {
            Ok(Speed::Half)
        } else if value == 1.0 {
            Ok(Speed::Normal)
        } else if value == 2.0 {
            Ok(Speed::Double)
        } else if value == 4.0 {
            Ok(Speed::Quadruple)
        } else {
            Err(Error::InvalidParameter(format!("Invalid speed: {}", value)))
        }
    }
}

impl From<Speed> for f64 {
    fn from(speed: Speed) -> Self {
        speed.factor()
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.factor())
    }
}

/// A single team's countdown
#[derive(Debug, Clone)]
pub struct Team {
    pub name: String,
    /// Configured starting duration in seconds
    pub base_time: u64,
    pub state: TeamState,
    pub speed: Speed,
    /// Remaining seconds, never negative
    pub time_left: f64,
    pub time_added: f64,
    pub time_subtracted: f64,
    pub time_running: f64,
    pub time_paused: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// Uncorrected drift in milliseconds measured when the countdown ran out
    pub final_drift: f64,
    /// Monotonic origin of the current run
    reference: Option<Instant>,
    /// Last time drift was corrected
    last_correction: Option<Instant>,
}

impl Team {
    pub fn new(name: impl Into<String>, base_time: u64) -> Self {
        Self {
            name: name.into(),
            base_time,
            state: TeamState::Ready,
            speed: Speed::Normal,
            time_left: base_time as f64,
            time_added: 0.0,
            time_subtracted: 0.0,
            time_running: 0.0,
            time_paused: 0.0,
            start_time: None,
            finish_time: None,
            final_drift: 0.0,
            reference: None,
            last_correction: None,
        }
    }

    /// Reset to `ready` with the configured base time. Works from any state.
    pub fn rearm(&mut self) {
        *self = Team::new(std::mem::take(&mut self.name), self.base_time);
    }

    /// `ready -> running` (needs a non-zero base time) or `paused -> running`
    /// (needs time left). Returns whether the state changed.
    pub fn start(&mut self, now: Instant) -> bool {
        match self.state {
            TeamState::Ready if self.base_time > 0 => {
                self.start_time = Some(Utc::now());
                self.reference = Some(now);
                self.last_correction = Some(now);
                self.state = TeamState::Running;
                true
            }
            TeamState::Paused => self.resume(),
            _ => false,
        }
    }

    /// `paused -> running` only
    pub fn resume(&mut self) -> bool {
        if self.state == TeamState::Paused && self.time_left > 0.0 {
            self.state = TeamState::Running;
            return true;
        }
        false
    }

    pub fn pause(&mut self) -> bool {
        if self.state == TeamState::Running {
            self.state = TeamState::Paused;
            return true;
        }
        false
    }

    /// Explicit finish, regardless of the time left
    pub fn finish(&mut self) -> bool {
        if self.state == TeamState::Finished {
            return false;
        }
        self.state = TeamState::Finished;
        self.finish_time = Some(Utc::now());
        true
    }

    /// Set the speed multiplier. Returns whether it differed.
    pub fn set_speed(&mut self, speed: Speed) -> bool {
        let changed = self.speed != speed;
        self.speed = speed;
        changed
    }

    /// Adjust the time left by a signed amount of seconds, clamping at zero.
    ///
    /// Only the magnitude actually applied is recorded in `time_added` /
    /// `time_subtracted`. Never transitions state by itself.
    pub fn add_time(&mut self, seconds: i64) -> bool {
        let before = self.time_left;
        self.time_left = (before + seconds as f64).max(0.0);
        let applied = self.time_left - before;
        if applied > 0.0 {
            self.time_added += applied;
        } else if applied < 0.0 {
            self.time_subtracted += -applied;
        }
        applied != 0.0
    }

    /// Advance by one eligible heartbeat. Returns whether anything moved.
    pub fn advance(&mut self) -> bool {
        if self.time_left <= 0.0 {
            return false;
        }
        let step = 1.0 / self.speed.factor();
        match self.state {
            TeamState::Running => {
                self.time_left -= 1.0;
                self.time_running += step;
                true
            }
            TeamState::Paused => {
                self.time_paused += step;
                true
            }
            _ => false,
        }
    }

    /// Finish a running team whose countdown reached zero.
    ///
    /// Records the drift between the monotonic clock and the accounted
    /// running and paused time in `final_drift`.
    pub fn check_finish(&mut self, now: Instant) -> bool {
        if self.state != TeamState::Running || self.time_left > 0.0 {
            return false;
        }
        self.time_left = 0.0;
        self.state = TeamState::Finished;
        self.finish_time = Some(Utc::now());
        self.final_drift = self.drift_secs(now).unwrap_or(0.0) * 1000.0;
        true
    }

    /// Re-anchor accounted time to the monotonic clock.
    ///
    /// Applied when `interval` has elapsed since the last correction, or
    /// unconditionally when `force` is set. Returns whether any field changed.
    pub fn correct_drift(&mut self, now: Instant, interval: Duration, force: bool) -> bool {
        let Some(last) = self.last_correction else {
            return false;
        };
        if !force && now.saturating_duration_since(last) < interval {
            return false;
        }
        self.last_correction = Some(now);

        let Some(drift) = self.drift_secs(now) else {
            return false;
        };
        if drift == 0.0 {
            return false;
        }
        match self.state {
            TeamState::Running => {
                self.time_left = (self.time_left - drift).max(0.0);
                self.time_running += drift;
                true
            }
            TeamState::Paused => {
                self.time_paused += drift;
                true
            }
            _ => false,
        }
    }

    /// Wall time elapsed since the run started minus accounted time, in seconds
    fn drift_secs(&self, now: Instant) -> Option<f64> {
        let reference = self.reference?;
        let elapsed = now.saturating_duration_since(reference).as_secs_f64();
        Some(elapsed - (self.time_running + self.time_paused))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_team(base: u64) -> (Team, Instant) {
        let mut team = Team::new("A", base);
        let t0 = Instant::now();
        assert!(team.start(t0));
        (team, t0)
    }

    #[test]
    fn test_start_requires_base_time() {
        let mut team = Team::new("empty", 0);
        assert!(!team.start(Instant::now()));
        assert_eq!(team.state, TeamState::Ready);
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut team, t0) = running_team(10);
        assert!(team.start_time.is_some());
        assert!(team.pause());
        assert!(!team.pause());
        assert_eq!(team.state, TeamState::Paused);
        assert!(team.start(t0));
        assert_eq!(team.state, TeamState::Running);
    }

    #[test]
    fn test_paused_with_no_time_left_stays_paused() {
        let (mut team, t0) = running_team(10);
        team.pause();
        team.add_time(-10);
        assert!(!team.start(t0));
        assert_eq!(team.state, TeamState::Paused);
    }

    #[test]
    fn test_finished_cannot_restart_without_rearm() {
        let (mut team, t0) = running_team(10);
        assert!(team.finish());
        assert!(!team.finish());
        assert!(!team.start(t0));
        assert_eq!(team.state, TeamState::Finished);

        team.rearm();
        assert!(team.start(t0));
    }

    #[test]
    fn test_rearm_resets_everything() {
        let (mut team, _) = running_team(30);
        team.set_speed(Speed::Quadruple);
        team.add_time(15);
        team.add_time(-5);
        team.advance();
        team.finish();

        team.rearm();
        assert_eq!(team.state, TeamState::Ready);
        assert_eq!(team.time_left, 30.0);
        assert_eq!(team.time_added, 0.0);
        assert_eq!(team.time_subtracted, 0.0);
        assert_eq!(team.time_running, 0.0);
        assert_eq!(team.speed, Speed::Normal);
        assert!(team.start_time.is_none());
        assert!(team.finish_time.is_none());
        assert_eq!(team.name, "A");
    }

    #[test]
    fn test_subtract_clamps_magnitude() {
        let mut team = Team::new("A", 30);
        assert!(team.add_time(-100));
        assert_eq!(team.time_left, 0.0);
        assert_eq!(team.time_subtracted, 30.0);
        // Nothing left to subtract
        assert!(!team.add_time(-5));
        assert_eq!(team.time_subtracted, 30.0);
        assert_eq!(team.state, TeamState::Ready);
    }

    #[test]
    fn test_add_time_tracks_added() {
        let mut team = Team::new("A", 30);
        team.add_time(12);
        assert_eq!(team.time_left, 42.0);
        assert_eq!(team.time_added, 12.0);
    }

    #[test]
    fn test_add_time_to_zero_does_not_finish() {
        let (mut team, t0) = running_team(30);
        team.add_time(-30);
        assert_eq!(team.state, TeamState::Running);
        // The next finish check does it
        assert!(team.check_finish(t0));
        assert_eq!(team.state, TeamState::Finished);
        assert_eq!(team.time_left, 0.0);
    }

    #[test]
    fn test_advance_running_and_paused() {
        let (mut team, _) = running_team(10);
        team.set_speed(Speed::Double);
        assert!(team.advance());
        assert_eq!(team.time_left, 9.0);
        assert_eq!(team.time_running, 0.5);

        team.pause();
        assert!(team.advance());
        assert_eq!(team.time_left, 9.0);
        assert_eq!(team.time_paused, 0.5);
    }

    #[test]
    fn test_ready_team_does_not_advance() {
        let mut team = Team::new("A", 10);
        assert!(!team.advance());
        assert_eq!(team.time_left, 10.0);
    }

    #[test]
    fn test_time_left_never_negative() {
        let (mut team, t0) = running_team(2);
        team.add_time(-1);
        team.time_left = 0.4;
        team.advance();
        assert!(team.check_finish(t0));
        assert_eq!(team.time_left, 0.0);
    }

    #[test]
    fn test_drift_not_corrected_before_interval() {
        let (mut team, t0) = running_team(300);
        team.advance();
        let later = t0 + Duration::from_secs(60);
        assert!(!team.correct_drift(later, DRIFT_CHECK_INTERVAL, false));
        assert_eq!(team.time_left, 299.0);
    }

    #[test]
    fn test_drift_correction_anchors_to_wall_clock() {
        let (mut team, t0) = running_team(300);
        for _ in 0..3 {
            team.advance();
        }
        // 5.25s of wall time, only 3s accounted
        let now = t0 + Duration::from_millis(5250);
        assert!(team.correct_drift(now, DRIFT_CHECK_INTERVAL, true));
        assert_eq!(team.time_running, 5.25);
        assert_eq!(team.time_left, 294.75);
    }

    #[test]
    fn test_forced_drift_correction_is_idempotent() {
        let (mut team, t0) = running_team(300);
        team.advance();
        let now = t0 + Duration::from_millis(1500);
        team.correct_drift(now, DRIFT_CHECK_INTERVAL, true);
        let (left, running, paused) = (team.time_left, team.time_running, team.time_paused);

        assert!(!team.correct_drift(now, DRIFT_CHECK_INTERVAL, true));
        assert_eq!(team.time_left, left);
        assert_eq!(team.time_running, running);
        assert_eq!(team.time_paused, paused);
    }

    #[test]
    fn test_drift_while_paused_goes_to_paused_time() {
        let (mut team, t0) = running_team(300);
        team.pause();
        let now = t0 + Duration::from_secs(2);
        assert!(team.correct_drift(now, DRIFT_CHECK_INTERVAL, true));
        assert_eq!(team.time_paused, 2.0);
        assert_eq!(team.time_left, 300.0);
    }

    #[test]
    fn test_final_drift_recorded() {
        let (mut team, t0) = running_team(1);
        team.advance();
        assert!(team.check_finish(t0 + Duration::from_millis(1250)));
        assert_eq!(team.final_drift, 250.0);
        assert!(team.finish_time.is_some());
    }

    #[test]
    fn test_speed_parsing() {
        assert_eq!(Speed::try_from(0.5).unwrap(), Speed::Half);
        assert_eq!(Speed::try_from(4.0).unwrap(), Speed::Quadruple);
        assert!(Speed::try_from(3.0).is_err());
        assert_eq!(serde_json::to_string(&Speed::Half).unwrap(), "0.5");
        let speed: Speed = serde_json::from_str("2").unwrap();
        assert_eq!(speed, Speed::Double);
        assert!(serde_json::from_str::<Speed>("8").is_err());
    }
}
