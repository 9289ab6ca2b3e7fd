//! Wire views of session state
//!
//! Field names are camelCase on the wire and shared by the server and the
//! client mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{SessionRole, Speed, Team, TeamState};

/// Partial or full snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// State, time left, speed and timestamps only
    Partial,
    /// Every field including derived counters
    Full,
}

/// One team's state as broadcast to subscribers.
///
/// All fields except `name` are optional so the same type carries partial
/// snapshots and is reused by clients applying them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TeamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_left: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Speed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_subtracted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_paused: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_running: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_drift: Option<f64>,
}

impl TeamSnapshot {
    pub fn of(team: &Team, kind: SnapshotKind) -> Self {
        let mut snapshot = Self {
            name: team.name.clone(),
            state: Some(team.state),
            time_left: Some(team.time_left),
            speed: Some(team.speed),
            start_time: team.start_time,
            finish_time: team.finish_time,
            ..Default::default()
        };
        if kind == SnapshotKind::Full {
            snapshot.base_time = Some(team.base_time);
            snapshot.time_added = Some(team.time_added);
            snapshot.time_subtracted = Some(team.time_subtracted);
            snapshot.time_paused = Some(team.time_paused);
            snapshot.time_running = Some(team.time_running);
            snapshot.final_drift = Some(team.final_drift);
        }
        snapshot
    }
}

/// Team names and base time, sent on join so clients can build their mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamsConfig {
    pub name: Vec<String>,
    pub base_time: u64,
}

/// One-word summary of all teams in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimplifiedState {
    Ready,
    Running,
    Paused,
    Finished,
    Unknown,
}

impl SimplifiedState {
    /// All ready, all finished, any running, any paused, else unknown
    pub fn summarize(states: impl IntoIterator<Item = TeamState>) -> Self {
        let states: Vec<TeamState> = states.into_iter().collect();
        if states.iter().all(|s| *s == TeamState::Ready) {
            SimplifiedState::Ready
        } else if states.iter().all(|s| *s == TeamState::Finished) {
            SimplifiedState::Finished
        } else if states.contains(&TeamState::Running) {
            SimplifiedState::Running
        } else if states.contains(&TeamState::Paused) {
            SimplifiedState::Paused
        } else {
            SimplifiedState::Unknown
        }
    }
}

/// Listing/admin view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub alias: String,
    pub owner: Uuid,
    pub listener_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub privileged_user_ids: Vec<Uuid>,
    pub is_public: bool,
    pub simplified_state: SimplifiedState,
}

/// A connected user as shown in the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub alias: String,
    pub role: SessionRole,
}
