//! Client-side session mirror
//!
//! Keeps a local copy of every team, advances it on the same eighths-of-a-
//! heartbeat schedule as the server, and merges incoming snapshots. A command
//! issued locally is applied at once and locks the fields it predicts, so a
//! snapshot still carrying the pre-command state cannot undo it. Locks lapse
//! after the lock window and the server's values win again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chronos_core::{
    Action, Command, HeartbeatGate, SessionRole, Team, TeamSnapshot, TeamState, TeamsConfig,
    TimingConfig,
};
use tracing::debug;
use uuid::Uuid;

use crate::client::ClientEvent;

/// Fields a local prediction can lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockedField {
    State,
    Speed,
    TimeLeft,
}

impl LockedField {
    pub const ALL: [LockedField; 3] = [LockedField::State, LockedField::Speed, LockedField::TimeLeft];
}

/// Per team and field lock expiries
#[derive(Debug, Clone)]
pub struct FieldLocks {
    window: Duration,
    expiries: HashMap<(usize, LockedField), Instant>,
}

impl FieldLocks {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expiries: HashMap::new(),
        }
    }

    /// Lock every predicted field of `index` for one window from `now`
    pub fn lock(&mut self, index: usize, now: Instant) {
        for field in LockedField::ALL {
            self.lock_field(index, field, now);
        }
    }

    pub fn lock_field(&mut self, index: usize, field: LockedField, now: Instant) {
        self.expiries.insert((index, field), now + self.window);
    }

    pub fn is_locked(&self, index: usize, field: LockedField, now: Instant) -> bool {
        self.expiries
            .get(&(index, field))
            .is_some_and(|expiry| now < *expiry)
    }

    /// Drop expired locks
    pub fn purge(&mut self, now: Instant) {
        self.expiries.retain(|_, expiry| now < *expiry);
    }

    pub fn clear(&mut self) {
        self.expiries.clear();
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

/// Local view of one session
#[derive(Debug, Clone)]
pub struct Mirror {
    user_id: Option<Uuid>,
    session_id: Option<String>,
    alias: String,
    role: SessionRole,
    teams: Vec<Team>,
    gate: HeartbeatGate,
    locks: FieldLocks,
    ended: bool,
}

impl Mirror {
    pub fn new(timing: &TimingConfig, now: Instant) -> Self {
        Self {
            user_id: None,
            session_id: None,
            alias: String::new(),
            role: SessionRole::Viewer,
            teams: Vec::new(),
            gate: HeartbeatGate::new(timing.heartbeat_guard(), now),
            locks: FieldLocks::new(timing.lock_window()),
            ended: false,
        }
    }

    /// Set the user whose roster entry decides the local role
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub fn locks(&self) -> &FieldLocks {
        &self.locks
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Rebuild the team list from the session's configuration
    pub fn apply_config(&mut self, config: &TeamsConfig) {
        self.teams = config
            .name
            .iter()
            .map(|name| Team::new(name.clone(), config.base_time))
            .collect();
        self.locks.clear();
    }

    /// Merge an authoritative snapshot.
    ///
    /// Absent fields keep their local value. Locked fields keep the local
    /// prediction. Entries beyond the local team list are ignored.
    pub fn apply_snapshot(&mut self, snapshots: &[TeamSnapshot], now: Instant) {
        for (index, (team, snapshot)) in self.teams.iter_mut().zip(snapshots).enumerate() {
            let unlocked = |field| !self.locks.is_locked(index, field, now);

            team.name = snapshot.name.clone();
            if let Some(state) = snapshot.state.filter(|_| unlocked(LockedField::State)) {
                team.state = state;
            }
            if let Some(speed) = snapshot.speed.filter(|_| unlocked(LockedField::Speed)) {
                team.speed = speed;
            }
            if let Some(time_left) = snapshot.time_left.filter(|_| unlocked(LockedField::TimeLeft)) {
                team.time_left = time_left;
            }
            if snapshot.start_time.is_some() {
                team.start_time = snapshot.start_time;
            }
            if snapshot.finish_time.is_some() {
                team.finish_time = snapshot.finish_time;
            }
            if let Some(base_time) = snapshot.base_time {
                team.base_time = base_time;
            }
            if let Some(value) = snapshot.time_added {
                team.time_added = value;
            }
            if let Some(value) = snapshot.time_subtracted {
                team.time_subtracted = value;
            }
            if let Some(value) = snapshot.time_paused {
                team.time_paused = value;
            }
            if let Some(value) = snapshot.time_running {
                team.time_running = value;
            }
            if let Some(value) = snapshot.final_drift {
                team.final_drift = value;
            }
        }
    }

    /// Apply a command locally before the server confirms it.
    ///
    /// Only controllers predict. Every addressed team is locked for one
    /// window. Returns whether any team changed.
    pub fn predict(&mut self, command: &Command, now: Instant) -> bool {
        if !self.role.can_control() {
            return false;
        }
        let action = match command.action() {
            Ok(action) => action,
            Err(e) => {
                debug!(error = %e, "Not predicting invalid command");
                return false;
            }
        };

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
            self.locks.lock(index, now);
        }
        changed
    }

    /// Local heartbeat. Running teams that reach zero finish here without
    /// waiting for the server. Returns whether anything moved.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(counter) = self.gate.poll(now) else {
            return false;
        };
        self.locks.purge(now);

        let mut updated = false;
        for team in self.teams.iter_mut() {
            if !HeartbeatGate::is_eligible(counter, team.speed) {
                continue;
            }
            updated |= team.advance();
            if team.state == TeamState::Running && team.time_left <= 0.0 {
                team.time_left = 0.0;
                updated |= team.finish();
            }
        }
        updated
    }

    fn is_current(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    /// Forget the current session. Returns its id.
    pub fn leave(&mut self) -> Option<String> {
        self.alias.clear();
        self.role = SessionRole::Viewer;
        self.teams.clear();
        self.locks.clear();
        self.ended = false;
        self.session_id.take()
    }

    /// Feed a client event. Returns whether the mirror changed.
    ///
    /// Peer actions are informational and never touch local state.
    pub fn handle_event(&mut self, event: &ClientEvent, now: Instant) -> bool {
        match event {
            ClientEvent::Identified { user_id, .. } => {
                self.user_id = Some(*user_id);
                false
            }
            ClientEvent::Joined(info) => {
                // A live session is only replaced after leaving it
                if self.session_id.is_some() && !self.ended && !self.is_current(&info.session_id) {
                    return false;
                }
                self.session_id = Some(info.session_id.clone());
                self.alias = info.alias.clone();
                self.role = info.role;
                self.ended = false;
                self.apply_config(&info.config);
                self.apply_snapshot(&info.state, now);
                true
            }
            ClientEvent::Tick { session_id, teams } | ClientEvent::FullTick { session_id, teams }
                if self.is_current(session_id) =>
            {
                self.apply_snapshot(teams, now);
                true
            }
            ClientEvent::Users { session_id, users } if self.is_current(session_id) => {
                match users.iter().find(|u| Some(u.user_id) == self.user_id) {
                    Some(me) if me.role != self.role => {
                        self.role = me.role;
                        true
                    }
                    _ => false,
                }
            }
            ClientEvent::SessionEnded { session_id, .. } if self.is_current(session_id) => {
                self.ended = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JoinInfo;
    use chronos_core::{RosterEntry, SnapshotKind, Speed};

    const SESSION: &str = "abc123";

    fn joined(user_id: Uuid, role: SessionRole, names: &[&str], base_time: u64) -> ClientEvent {
        joined_to(SESSION, user_id, role, names, base_time)
    }

    fn joined_to(
        session_id: &str,
        user_id: Uuid,
        role: SessionRole,
        names: &[&str],
        base_time: u64,
    ) -> ClientEvent {
        let teams: Vec<Team> = names.iter().map(|n| Team::new(*n, base_time)).collect();
        ClientEvent::Joined(JoinInfo {
            session_id: session_id.into(),
            alias: "Finals".into(),
            role,
            users: vec![RosterEntry {
                user_id,
                alias: "me".into(),
                role,
            }],
            config: TeamsConfig {
                name: names.iter().map(|n| n.to_string()).collect(),
                base_time,
            },
            state: teams.iter().map(|t| TeamSnapshot::of(t, SnapshotKind::Full)).collect(),
        })
    }

    fn mirror(role: SessionRole, now: Instant) -> Mirror {
        let user_id = Uuid::new_v4();
        let mut mirror = Mirror::new(&TimingConfig::default(), now).with_user(user_id);
        assert!(mirror.handle_event(&joined(user_id, role, &["A", "B"], 300), now));
        mirror
    }

    fn partial(state: TeamState, time_left: f64) -> TeamSnapshot {
        TeamSnapshot {
            name: "A".into(),
            state: Some(state),
            time_left: Some(time_left),
            speed: Some(Speed::Normal),
            ..Default::default()
        }
    }

    #[test]
    fn test_join_builds_teams() {
        let t0 = Instant::now();
        let mirror = mirror(SessionRole::Viewer, t0);
        assert_eq!(mirror.session_id(), Some(SESSION));
        assert_eq!(mirror.alias(), "Finals");
        assert_eq!(mirror.teams().len(), 2);
        assert_eq!(mirror.teams()[1].time_left, 300.0);
    }

    #[test]
    fn test_lock_window_protects_prediction() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);

        assert!(mirror.predict(&Command::new("start", vec![0]), t0));
        assert_eq!(mirror.teams()[0].state, TeamState::Running);

        // Stale snapshot inside the window
        mirror.apply_snapshot(&[partial(TeamState::Ready, 300.0)], t0 + Duration::from_millis(200));
        assert_eq!(mirror.teams()[0].state, TeamState::Running);

        // After the window the server wins
        mirror.apply_snapshot(&[partial(TeamState::Ready, 300.0)], t0 + Duration::from_millis(600));
        assert_eq!(mirror.teams()[0].state, TeamState::Ready);
    }

    #[test]
    fn test_unlocked_fields_still_merge() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Admin, t0);
        mirror.predict(&Command::new("start", vec![0]), t0);

        let snapshot = TeamSnapshot {
            time_running: Some(12.0),
            ..partial(TeamState::Ready, 250.0)
        };
        mirror.apply_snapshot(&[snapshot], t0 + Duration::from_millis(100));
        let team = &mirror.teams()[0];
        assert_eq!(team.time_left, 300.0);
        assert_eq!(team.time_running, 12.0);
    }

    #[test]
    fn test_other_teams_are_not_locked() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);
        mirror.predict(&Command::new("start", vec![0]), t0);

        let b = TeamSnapshot {
            name: "B".into(),
            ..partial(TeamState::Paused, 10.0)
        };
        mirror.apply_snapshot(&[partial(TeamState::Ready, 300.0), b], t0);
        assert_eq!(mirror.teams()[1].state, TeamState::Paused);
        assert_eq!(mirror.teams()[1].time_left, 10.0);
        assert!(mirror.locks().is_locked(0, LockedField::Speed, t0));
        assert!(!mirror.locks().is_locked(1, LockedField::State, t0));
    }

    #[test]
    fn test_viewer_does_not_predict() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Viewer, t0);
        assert!(!mirror.predict(&Command::new("start", vec![0]), t0));
        assert_eq!(mirror.teams()[0].state, TeamState::Ready);
        assert!(mirror.locks().is_empty());
    }

    #[test]
    fn test_invalid_command_is_not_predicted() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);
        assert!(!mirror.predict(&Command::new("add:0", vec![0]), t0));
        assert!(mirror.locks().is_empty());
    }

    #[test]
    fn test_local_tick_counts_down_and_finishes() {
        let t0 = Instant::now();
        let beat = Duration::from_millis(250);
        let mut mirror = mirror(SessionRole::Owner, t0);
        mirror.predict(&Command::new("add:-298", vec![0]), t0);
        mirror.predict(&Command::new("start", vec![0]), t0);
        assert_eq!(mirror.teams()[0].time_left, 2.0);

        for i in 1..=4 {
            mirror.tick(t0 + beat * i);
        }
        assert_eq!(mirror.teams()[0].time_left, 1.0);

        for i in 5..=8 {
            mirror.tick(t0 + beat * i);
        }
        let team = &mirror.teams()[0];
        assert_eq!(team.state, TeamState::Finished);
        assert_eq!(team.time_left, 0.0);
        assert!(team.finish_time.is_some());
        assert!(mirror.locks().is_empty());
    }

    #[test]
    fn test_add_time_to_zero_does_not_finish() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);
        mirror.predict(&Command::new("add:-500", vec![1]), t0);
        let team = &mirror.teams()[1];
        assert_eq!(team.time_left, 0.0);
        assert_eq!(team.time_subtracted, 300.0);
        assert_eq!(team.state, TeamState::Ready);
    }

    #[test]
    fn test_roster_updates_own_role() {
        let t0 = Instant::now();
        let user_id = Uuid::new_v4();
        let mut mirror = Mirror::new(&TimingConfig::default(), t0);
        let identified = ClientEvent::Identified {
            user_id,
            alias: "me".into(),
            role: chronos_core::UserRole::User,
        };
        assert!(!mirror.handle_event(&identified, t0));
        assert_eq!(mirror.user_id(), Some(user_id));
        mirror.handle_event(&joined(user_id, SessionRole::Viewer, &["A"], 60), t0);

        let users = vec![
            RosterEntry {
                user_id: Uuid::new_v4(),
                alias: "owner".into(),
                role: SessionRole::Owner,
            },
            RosterEntry {
                user_id,
                alias: "me".into(),
                role: SessionRole::Admin,
            },
        ];
        let event = ClientEvent::Users {
            session_id: SESSION.into(),
            users,
        };
        assert!(mirror.handle_event(&event, t0));
        assert_eq!(mirror.role(), SessionRole::Admin);
        assert!(mirror.predict(&Command::new("start", vec![0]), t0));
    }

    #[test]
    fn test_events_for_other_sessions_are_ignored() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Viewer, t0);
        let event = ClientEvent::FullTick {
            session_id: "other".into(),
            teams: vec![partial(TeamState::Finished, 0.0)],
        };
        assert!(!mirror.handle_event(&event, t0));
        assert_eq!(mirror.teams()[0].state, TeamState::Ready);
    }

    #[test]
    fn test_peer_action_does_not_touch_state() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);
        let event = ClientEvent::PeerAction {
            session_id: SESSION.into(),
            command: Command::new("start", vec![0, 1]),
        };
        assert!(!mirror.handle_event(&event, t0));
        assert!(mirror.teams().iter().all(|t| t.state == TeamState::Ready));
    }

    #[test]
    fn test_session_end() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Viewer, t0);
        let event = ClientEvent::SessionEnded {
            session_id: SESSION.into(),
            message: "bye".into(),
        };
        assert!(mirror.handle_event(&event, t0));
        assert!(mirror.is_ended());
    }

    #[test]
    fn test_rejoin_after_session_end() {
        let t0 = Instant::now();
        let user_id = Uuid::new_v4();
        let mut mirror = Mirror::new(&TimingConfig::default(), t0).with_user(user_id);
        mirror.handle_event(&joined_to("first", user_id, SessionRole::Owner, &["A"], 60), t0);

        // Another session while this one is live is ignored
        let second = joined_to("second", user_id, SessionRole::Viewer, &["X", "Y", "Z"], 120);
        assert!(!mirror.handle_event(&second, t0));
        assert_eq!(mirror.session_id(), Some("first"));

        let ended = ClientEvent::SessionEnded {
            session_id: "first".into(),
            message: "bye".into(),
        };
        assert!(mirror.handle_event(&ended, t0));
        assert!(mirror.handle_event(&second, t0));
        assert_eq!(mirror.session_id(), Some("second"));
        assert_eq!(mirror.teams().len(), 3);
        assert_eq!(mirror.role(), SessionRole::Viewer);
        assert!(!mirror.is_ended());
    }

    #[test]
    fn test_leave_resets_mirror() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Owner, t0);
        mirror.predict(&Command::new("start", vec![0]), t0);

        assert_eq!(mirror.leave().as_deref(), Some(SESSION));
        assert_eq!(mirror.session_id(), None);
        assert!(mirror.teams().is_empty());
        assert!(mirror.locks().is_empty());
        assert_eq!(mirror.role(), SessionRole::Viewer);

        let user_id = mirror.user_id().unwrap();
        let other = joined_to("other", user_id, SessionRole::Admin, &["C"], 30);
        assert!(mirror.handle_event(&other, t0));
        assert_eq!(mirror.teams()[0].time_left, 30.0);
    }

    #[test]
    fn test_extra_snapshot_entries_are_ignored() {
        let t0 = Instant::now();
        let mut mirror = mirror(SessionRole::Viewer, t0);
        let snapshots = vec![
            partial(TeamState::Running, 100.0),
            partial(TeamState::Running, 100.0),
            partial(TeamState::Running, 100.0),
        ];
        mirror.apply_snapshot(&snapshots, t0);
        assert_eq!(mirror.teams().len(), 2);
        assert_eq!(mirror.teams()[1].time_left, 100.0);
    }
}
