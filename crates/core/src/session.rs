//! Session model - a set of team timers plus access control
//!
//! A session is plain synchronous state. Whoever owns it (the registry's
//! per-session task) serializes heartbeats and commands by holding it behind
//! a single lock, so every observable state is the result of some serial
//! order of those events.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::action::{Action, Command};
use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::invariants::assert_session_invariants;
use crate::log::{AuditLog, LogKind};
use crate::models::{SessionRole, Team};
use crate::snapshot::{
    RosterEntry, SessionDescriptor, SimplifiedState, SnapshotKind, TeamSnapshot, TeamsConfig,
};
use crate::ticker::Ticker;

/// Length of generated session ids
const SESSION_ID_LEN: usize = 6;

/// Generate a short lowercase alphanumeric session id
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner: Uuid,
    pub team_names: Vec<String>,
    /// Starting duration of every team, in seconds
    pub initial_time: u64,
    pub autostart: bool,
    pub is_public: bool,
    pub alias: Option<String>,
    pub public_logs: bool,
}

impl NewSession {
    pub fn new(owner: Uuid, team_names: Vec<String>, initial_time: u64) -> Self {
        Self {
            owner,
            team_names,
            initial_time,
            autostart: false,
            is_public: false,
            alias: None,
            public_logs: false,
        }
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn public_logs(mut self, public_logs: bool) -> Self {
        self.public_logs = public_logs;
        self
    }
}

/// A subscribed user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub user_id: Uuid,
    pub alias: String,
}

/// Result of an accepted command
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: Action,
    /// False when the command was valid but changed nothing
    pub changed: bool,
    /// Broadcast to emit, if any
    pub snapshot: Option<SnapshotKind>,
    pub message: &'static str,
}

/// One multi-team chronometer
#[derive(Debug)]
pub struct Session {
    id: String,
    alias: String,
    owner: Uuid,
    privileged: Vec<Uuid>,
    is_public: bool,
    public_logs: bool,
    teams: Vec<Team>,
    listeners: Vec<Listener>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    log: AuditLog,
    ticker: Ticker,
    stopped: bool,
}

impl Session {
    pub fn new(params: NewSession, timing: &TimingConfig, now: Instant) -> Self {
        Self::with_id(generate_session_id(), params, timing, now)
    }

    pub fn with_id(id: String, params: NewSession, timing: &TimingConfig, now: Instant) -> Self {
        let NewSession {
            owner,
            team_names,
            initial_time,
            autostart,
            is_public,
            alias,
            public_logs,
        } = params;

        let mut log = AuditLog::new();
        log.append(
            LogKind::Created,
            format!(
                "created {}chrono with teams: {} initial time: {}s",
                if is_public { "public " } else { "" },
                team_names.join(", "),
                initial_time
            ),
        );

        let alias = alias
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| id.clone());

        let mut session = Self {
            id,
            alias,
            owner,
            privileged: vec![owner],
            is_public,
            public_logs,
            teams: team_names.into_iter().map(|name| Team::new(name, initial_time)).collect(),
            listeners: Vec::new(),
            created_at: Utc::now(),
            last_activity: now,
            log,
            ticker: Ticker::new(timing, now),
            stopped: false,
        };

        if autostart {
            let all = Command::new("start", (0..session.teams.len() as i64).collect());
            session.apply(Action::Start, &all, now);
        }

        assert_session_invariants(&session);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn privileged(&self) -> &[Uuid] {
        &self.privileged
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn public_logs(&self) -> bool {
        self.public_logs
    }

    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn is_owner(&self, user_id: Uuid) -> bool {
        self.owner == user_id
    }

    /// Public sessions accept commands from anyone
    pub fn is_authorized(&self, user_id: Uuid) -> bool {
        self.is_public || self.privileged.contains(&user_id)
    }

    pub fn role_of(&self, user_id: Uuid) -> SessionRole {
        if self.is_owner(user_id) {
            SessionRole::Owner
        } else if self.is_authorized(user_id) {
            SessionRole::Admin
        } else {
            SessionRole::Viewer
        }
    }

    /// Authorize, parse and apply a remote command.
    ///
    /// Rejections touch no team. Out-of-range indices are skipped.
    pub fn dispatch(&mut self, caller: Uuid, command: &Command, now: Instant) -> Result<ActionOutcome> {
        if !self.is_authorized(caller) {
            return Err(Error::Unauthorized("User not authorized".into()));
        }
        let action = command.action()?;
        Ok(self.apply(action, command, now))
    }

    fn apply(&mut self, action: Action, command: &Command, now: Instant) -> ActionOutcome {
        let indices = command
            .team_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.log
            .append(LogKind::Action, format!("{}: {}", action.describe(), indices));

        let targets: Vec<usize> = command.targets(self.teams.len()).collect();
        let mut changed = false;
        for index in targets {
            let team = &mut self.teams[index];
            changed |= match action {
                Action::Start => team.start(now),
                Action::Unpause => team.resume(),
                Action::Pause => team.pause(),
                Action::Finish => team.finish(),
                Action::Rearm => {
                    team.rearm();
                    true
                }
                Action::AddTime(seconds) => team.add_time(seconds),
                Action::SetSpeed(speed) => team.set_speed(speed),
            };
        }

        let snapshot = match (changed, action) {
            (false, _) => None,
            (true, Action::Finish) => Some(SnapshotKind::Full),
            (true, _) => Some(self.ticker.command_snapshot()),
        };
        debug!(session_id = %self.id, action = %action, changed, "Applied action");

        ActionOutcome {
            action,
            changed,
            snapshot,
            message: action.message(),
        }
    }

    /// Run one heartbeat; `None` when gated, stopped or nothing changed
    pub fn heartbeat(&mut self, now: Instant) -> Option<SnapshotKind> {
        if self.stopped {
            return None;
        }
        self.ticker.heartbeat(&mut self.teams, now)
    }

    /// Current state of every team. Counts as activity.
    pub fn snapshot(&mut self, kind: SnapshotKind, now: Instant) -> Vec<TeamSnapshot> {
        self.last_activity = now;
        self.teams.iter().map(|t| TeamSnapshot::of(t, kind)).collect()
    }

    pub fn teams_config(&self) -> TeamsConfig {
        TeamsConfig {
            name: self.teams.iter().map(|t| t.name.clone()).collect(),
            base_time: self.teams.first().map(|t| t.base_time).unwrap_or(0),
        }
    }

    pub fn simplified_state(&self) -> SimplifiedState {
        SimplifiedState::summarize(self.teams.iter().map(|t| t.state))
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.id.clone(),
            alias: self.alias.clone(),
            owner: self.owner,
            listener_ids: self.listeners.iter().map(|l| l.user_id).collect(),
            created_at: self.created_at,
            privileged_user_ids: self.privileged.clone(),
            is_public: self.is_public,
            simplified_state: self.simplified_state(),
        }
    }

    /// Returns false if the user was already listening
    pub fn add_listener(&mut self, listener: Listener) -> bool {
        if self.listeners.iter().any(|l| l.user_id == listener.user_id) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    pub fn remove_listener(&mut self, user_id: Uuid) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.user_id != user_id);
        self.listeners.len() != before
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.listeners
            .iter()
            .map(|l| RosterEntry {
                user_id: l.user_id,
                alias: l.alias.clone(),
                role: self.role_of(l.user_id),
            })
            .collect()
    }

    /// Grant or revoke command privilege. Owner only, idempotent.
    ///
    /// Returns whether the privileged set changed. The owner cannot be demoted.
    pub fn modify_privilege(&mut self, caller: Uuid, target: Uuid, demote: bool) -> Result<bool> {
        if !self.is_owner(caller) {
            return Err(Error::Unauthorized("Only the owner may change privileges".into()));
        }
        let changed = if demote {
            if target == self.owner || !self.privileged.contains(&target) {
                false
            } else {
                self.privileged.retain(|id| *id != target);
                self.log
                    .append(LogKind::Privilege, format!("removed privilege from user {}", target));
                true
            }
        } else if self.privileged.contains(&target) {
            false
        } else {
            self.privileged.push(target);
            self.log
                .append(LogKind::Privilege, format!("added privilege to user {}", target));
            true
        };
        assert_session_invariants(self);
        Ok(changed)
    }

    /// Hand the session to another user, who also becomes privileged
    pub fn set_owner(&mut self, new_owner: Uuid) {
        if !self.privileged.contains(&new_owner) {
            self.privileged.push(new_owner);
        }
        self.log
            .append(LogKind::Owner, format!("owner changed from {} to {}", self.owner, new_owner));
        self.owner = new_owner;
        assert_session_invariants(self);
    }

    /// Stop ticking. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.log.append(LogKind::Terminated, "session terminated");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// No listeners and no activity for longer than `timeout`
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.listeners.is_empty() && now.saturating_duration_since(self.last_activity) > timeout
    }
}
