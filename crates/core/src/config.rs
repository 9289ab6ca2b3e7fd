//! Timing configuration shared by the server scheduler and client mirrors

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::DRIFT_CHECK_INTERVAL;

/// Heartbeat, snapshot and lock timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Target heartbeat cadence in milliseconds
    pub heartbeat_ms: u64,
    /// Tolerance subtracted from the cadence when gating heartbeats
    pub heartbeat_slack_ms: u64,
    /// Period of the underlying timer that polls the heartbeat gate
    pub poll_ms: u64,
    /// Force a full snapshot every N broadcasts
    pub full_snapshot_every: u64,
    /// Interval between drift corrections
    pub drift_check_secs: u64,
    /// Client-side grace window after a locally issued command
    pub lock_window_ms: u64,
}

impl TimingConfig {
    /// Minimum time between two processed heartbeats
    pub fn heartbeat_guard(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.saturating_sub(self.heartbeat_slack_ms))
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn drift_check(&self) -> Duration {
        Duration::from_secs(self.drift_check_secs)
    }

    pub fn lock_window(&self) -> Duration {
        Duration::from_millis(self.lock_window_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 250,
            heartbeat_slack_ms: 3,
            poll_ms: 25,
            full_snapshot_every: 15,
            drift_check_secs: DRIFT_CHECK_INTERVAL.as_secs(),
            lock_window_ms: 500,
        }
    }
}
