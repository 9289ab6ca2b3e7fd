//! Session heartbeat
//!
//! One [`Ticker`] drives every team of a session. The underlying timer may
//! fire more often than the cadence; [`HeartbeatGate`] drops the extra polls.
//! A cyclic counter of eighths decides which teams advance on a given
//! heartbeat, so all four speeds run off the same clock.

use std::time::{Duration, Instant};

use crate::config::TimingConfig;
use crate::invariants::assert_team_invariants;
use crate::models::{Speed, Team};
use crate::snapshot::SnapshotKind;

/// Length of the heartbeat counter cycle
pub const TICK_CYCLE: u8 = 8;

/// Gates a fine-grained timer down to the heartbeat cadence
#[derive(Debug, Clone)]
pub struct HeartbeatGate {
    guard: Duration,
    last: Instant,
    counter: u8,
}

impl HeartbeatGate {
    pub fn new(guard: Duration, now: Instant) -> Self {
        Self {
            guard,
            last: now,
            counter: 0,
        }
    }

    /// Returns the new counter value if a heartbeat is due at `now`
    pub fn poll(&mut self, now: Instant) -> Option<u8> {
        if now.saturating_duration_since(self.last) < self.guard {
            return None;
        }
        self.last = now;
        self.counter = (self.counter + 1) % TICK_CYCLE;
        Some(self.counter)
    }

    /// Does a team at `speed` advance on heartbeat `counter`?
    pub fn is_eligible(counter: u8, speed: Speed) -> bool {
        counter % speed.tick_modulus() == 0
    }
}

/// Decides between partial and periodic full snapshots
#[derive(Debug, Clone)]
pub struct SnapshotCadence {
    every: u64,
    sent: u64,
}

impl SnapshotCadence {
    pub fn new(every: u64) -> Self {
        Self { every, sent: 0 }
    }

    /// Kind of the next regular broadcast. The very first one is full.
    pub fn next_kind(&mut self) -> SnapshotKind {
        let full = self.every == 0 || self.sent % self.every == 0;
        self.sent += 1;
        if full {
            SnapshotKind::Full
        } else {
            SnapshotKind::Partial
        }
    }
}

/// Heartbeat scheduler state for one session
#[derive(Debug, Clone)]
pub struct Ticker {
    gate: HeartbeatGate,
    cadence: SnapshotCadence,
    drift_interval: Duration,
}

impl Ticker {
    pub fn new(config: &TimingConfig, now: Instant) -> Self {
        Self {
            gate: HeartbeatGate::new(config.heartbeat_guard(), now),
            cadence: SnapshotCadence::new(config.full_snapshot_every),
            drift_interval: config.drift_check(),
        }
    }

    /// Run one heartbeat over `teams`.
    ///
    /// Returns the snapshot to broadcast, or `None` when the heartbeat was
    /// gated or nothing changed. A completion always yields a full snapshot.
    pub fn heartbeat(&mut self, teams: &mut [Team], now: Instant) -> Option<SnapshotKind> {
        let counter = self.gate.poll(now)?;

        let mut updated = false;
        let mut finished = false;
        for team in teams.iter_mut() {
            if !HeartbeatGate::is_eligible(counter, team.speed) {
                continue;
            }
            updated |= team.advance();
            finished |= team.check_finish(now);
            updated |= team.correct_drift(now, self.drift_interval, false);
            assert_team_invariants(team);
        }

        if finished {
            Some(SnapshotKind::Full)
        } else if updated {
            Some(self.cadence.next_kind())
        } else {
            None
        }
    }

    /// Snapshot kind for a broadcast triggered by a command
    pub fn command_snapshot(&mut self) -> SnapshotKind {
        self.cadence.next_kind()
    }
}
