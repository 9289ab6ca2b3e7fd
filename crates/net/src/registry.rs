//! Session registry
//!
//! Owns every live session. Each session sits behind its own mutex together
//! with its publish bus, and is driven by one heartbeat task. Commands and
//! heartbeats for a session take the same lock, so they apply in some serial
//! order; different sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chronos_core::{
    generate_session_id, ActionOutcome, Command, Error as CoreError, Identity, Listener,
    NewSession, Session, SessionDescriptor, SnapshotKind, TeamSnapshot, TimingConfig,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{SessionBus, SessionEvent};
use crate::error::Result;
use crate::protocol::JoinInfo;

/// Clock used for all session timing. Follows tokio's clock so paused-time
/// tests stay deterministic.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// One heartbeat step over a locked session
type Beat = fn(&mut Session, Instant) -> Option<SnapshotKind>;

fn not_found() -> CoreError {
    CoreError::NotFound("Session not found".into())
}

/// One live session and its fan-out
struct SessionSlot {
    session: Mutex<Session>,
    bus: SessionBus,
    stop_tx: broadcast::Sender<()>,
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    timing: TimingConfig,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared handle to the set of live sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(timing: TimingConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                timing,
                shutdown_tx,
            }),
        }
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.inner.timing
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found().into())
    }

    async fn slots(&self) -> Vec<Arc<SessionSlot>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    /// Register a new session and start its heartbeat. Returns the session id.
    pub async fn create_session(&self, params: NewSession) -> String {
        self.create_with_beat(params, Session::heartbeat).await
    }

    async fn create_with_beat(&self, params: NewSession, beat: Beat) -> String {
        let owner = params.owner;
        let (session_id, slot) = {
            let mut sessions = self.inner.sessions.write().await;
            let mut id = generate_session_id();
            while sessions.contains_key(&id) {
                id = generate_session_id();
            }

            let session = Session::with_id(id.clone(), params, &self.inner.timing, now());
            let (stop_tx, _) = broadcast::channel(1);
            let slot = Arc::new(SessionSlot {
                session: Mutex::new(session),
                bus: SessionBus::new(),
                stop_tx,
            });
            sessions.insert(id.clone(), slot.clone());
            (id, slot)
        };

        self.spawn_heartbeat(&session_id, slot, beat);
        info!(session_id = %session_id, owner = %owner, "Session created");
        session_id
    }

    fn spawn_heartbeat(&self, session_id: &str, slot: Arc<SessionSlot>, beat: Beat) {
        let stop_rx = slot.stop_tx.subscribe();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let poll = self.inner.timing.poll();
        let handle = tokio::spawn(heartbeat_task(slot, poll, beat, stop_rx, shutdown_rx));

        // A panicking session only takes down its own task
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(session_id = %session_id, "Heartbeat task panicked");
                }
            }
        });
    }

    /// Authorize and apply a command, then publish the result.
    ///
    /// `origin` identifies the issuing connection so it can skip its own
    /// peer-action echo.
    pub async fn dispatch_action(
        &self,
        session_id: &str,
        caller: Uuid,
        command: &Command,
        origin: Option<Uuid>,
    ) -> Result<ActionOutcome> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        if session.is_stopped() {
            return Err(not_found().into());
        }

        let now = now();
        let outcome = session.dispatch(caller, command, now)?;
        if let Some(kind) = outcome.snapshot {
            let teams = session.snapshot(kind, now);
            slot.bus.publish(SessionEvent::Snapshot {
                kind,
                teams: Arc::new(teams),
            });
        }
        if outcome.changed {
            slot.bus.publish(SessionEvent::PeerAction {
                origin,
                command: command.clone(),
            });
        }
        debug!(session_id = %session_id, user_id = %caller, verb = %command.verb, changed = outcome.changed, "Action dispatched");
        Ok(outcome)
    }

    /// Subscribe to a session and add the caller as a listener
    pub async fn join(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<(JoinInfo, broadcast::Receiver<SessionEvent>)> {
        let slot = self.slot(session_id).await?;
        let rx = slot.bus.subscribe();

        let mut session = slot.session.lock().await;
        if session.is_stopped() {
            return Err(not_found().into());
        }
        session.add_listener(Listener {
            user_id: identity.user_id,
            alias: identity.alias.clone(),
        });

        let users = session.roster();
        let info = JoinInfo {
            session_id: session.id().to_string(),
            alias: session.alias().to_string(),
            role: session.role_of(identity.user_id),
            users: users.clone(),
            config: session.teams_config(),
            state: session.snapshot(SnapshotKind::Full, now()),
        };
        slot.bus.publish(SessionEvent::Roster(Arc::new(users)));

        debug!(session_id = %session_id, user_id = %identity.user_id, "Listener joined");
        Ok((info, rx))
    }

    /// Returns false if the user was already listening
    pub async fn add_listener(&self, session_id: &str, listener: Listener) -> Result<bool> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let added = session.add_listener(listener);
        if added {
            slot.bus.publish(SessionEvent::Roster(Arc::new(session.roster())));
        }
        Ok(added)
    }

    /// Remove a listener from one session
    pub async fn leave(&self, session_id: &str, user_id: Uuid) -> Result<bool> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let removed = session.remove_listener(user_id);
        if removed {
            slot.bus.publish(SessionEvent::Roster(Arc::new(session.roster())));
        }
        Ok(removed)
    }

    /// Remove a listener from every session. Returns the affected session ids.
    pub async fn remove_listener(&self, user_id: Uuid) -> Vec<String> {
        let mut affected = Vec::new();
        for slot in self.slots().await {
            let mut session = slot.session.lock().await;
            if session.remove_listener(user_id) {
                slot.bus.publish(SessionEvent::Roster(Arc::new(session.roster())));
                affected.push(session.id().to_string());
            }
        }
        affected
    }

    /// Grant or revoke privilege. Owner only.
    pub async fn modify_privilege(
        &self,
        session_id: &str,
        caller: Uuid,
        target: Uuid,
        demote: bool,
    ) -> Result<bool> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        let changed = session.modify_privilege(caller, target, demote)?;
        if changed {
            slot.bus.publish(SessionEvent::Roster(Arc::new(session.roster())));
            info!(session_id = %session_id, target = %target, demote, "Privilege changed");
        }
        Ok(changed)
    }

    /// Transfer ownership. Allowed for the owner or a global admin.
    pub async fn set_owner(&self, session_id: &str, caller: &Identity, new_owner: Uuid) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        if !session.is_owner(caller.user_id) && !caller.is_admin() {
            return Err(CoreError::Unauthorized("Only the owner may transfer the session".into()).into());
        }
        session.set_owner(new_owner);
        slot.bus.publish(SessionEvent::Roster(Arc::new(session.roster())));
        info!(session_id = %session_id, owner = %new_owner, "Owner changed");
        Ok(())
    }

    /// Stop, notify and remove a session.
    ///
    /// Returns false if the session was already gone or being killed.
    pub async fn kill_session(&self, session_id: &str, reason: &str) -> bool {
        self.kill_session_if(session_id, reason, |_| true).await
    }

    /// Kill only if `condition` still holds under the session lock
    async fn kill_session_if(
        &self,
        session_id: &str,
        reason: &str,
        condition: impl FnOnce(&Session) -> bool,
    ) -> bool {
        let slot = match self.slot(session_id).await {
            Ok(slot) => slot,
            Err(_) => return false,
        };

        let stopped = {
            let mut session = slot.session.lock().await;
            if !condition(&session) {
                return false;
            }
            let stopped = session.stop();
            if stopped {
                slot.bus.publish(SessionEvent::Terminated {
                    reason: reason.to_string(),
                });
            }
            stopped
        };
        let _ = slot.stop_tx.send(());

        let mut sessions = self.inner.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            sessions.remove(session_id);
        }

        if stopped {
            info!(session_id = %session_id, reason = %reason, "Session killed");
        }
        stopped
    }

    /// Kill on behalf of a user. Owner or global admin only.
    pub async fn kill_session_as(&self, session_id: &str, caller: &Identity) -> Result<()> {
        let slot = self.slot(session_id).await?;
        {
            let session = slot.session.lock().await;
            if !session.is_owner(caller.user_id) && !caller.is_admin() {
                return Err(CoreError::Unauthorized("Only the owner may end the session".into()).into());
            }
        }
        self.kill_session(session_id, "Session ended by owner").await;
        Ok(())
    }

    /// Audit log as newline-joined lines. Access control is the caller's job.
    pub async fn get_log(&self, session_id: &str) -> Result<String> {
        let slot = self.slot(session_id).await?;
        let session = slot.session.lock().await;
        Ok(session.log().render())
    }

    /// Public logs, or a user allowed to command the session
    pub async fn can_read_log(&self, session_id: &str, user_id: Uuid) -> Result<bool> {
        let slot = self.slot(session_id).await?;
        let session = slot.session.lock().await;
        Ok(session.public_logs() || session.is_authorized(user_id))
    }

    pub async fn snapshot(&self, session_id: &str, kind: SnapshotKind) -> Result<Vec<TeamSnapshot>> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.session.lock().await;
        Ok(session.snapshot(kind, now()))
    }

    pub async fn descriptor(&self, session_id: &str) -> Result<SessionDescriptor> {
        let slot = self.slot(session_id).await?;
        let session = slot.session.lock().await;
        Ok(session.descriptor())
    }

    /// Every live session, oldest first
    pub async fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let mut descriptors = Vec::new();
        for slot in self.slots().await {
            descriptors.push(slot.session.lock().await.descriptor());
        }
        descriptors.sort_by_key(|d| d.created_at);
        descriptors
    }

    pub async fn sessions_owned_by(&self, user_id: Uuid) -> Vec<SessionDescriptor> {
        self.list_sessions()
            .await
            .into_iter()
            .filter(|d| d.owner == user_id)
            .collect()
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<SessionEvent>> {
        Ok(self.slot(session_id).await?.bus.subscribe())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Kill every session with no listeners and no activity for `timeout`
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let scanned_at = now();
        let mut idle = Vec::new();
        for slot in self.slots().await {
            let session = slot.session.lock().await;
            if session.is_idle(scanned_at, timeout) {
                idle.push(session.id().to_string());
            }
        }

        let mut killed = Vec::new();
        for session_id in idle {
            let still_idle = |session: &Session| session.is_idle(now(), timeout);
            if self
                .kill_session_if(&session_id, "Session closed for inactivity", still_idle)
                .await
            {
                warn!(session_id = %session_id, "Idle session killed");
                killed.push(session_id);
            }
        }
        killed
    }

    /// Run [`Self::sweep_idle`] every `every` until shutdown
    pub fn spawn_idle_sweep(&self, timeout: Duration, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let killed = registry.sweep_idle(timeout).await;
                        debug!(killed = killed.len(), "Idle sweep finished");
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Idle sweep shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Kill every session and stop background tasks
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        for session_id in ids {
            self.kill_session(&session_id, "Server shutting down").await;
        }
        let _ = self.inner.shutdown_tx.send(());
        info!("Registry shut down");
    }
}

/// Drive one session's heartbeat until it is stopped
async fn heartbeat_task(
    slot: Arc<SessionSlot>,
    poll: Duration,
    beat: Beat,
    mut stop_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut session = slot.session.lock().await;
                if session.is_stopped() {
                    break;
                }
                let now = now();
                if let Some(kind) = beat(&mut *session, now) {
                    let teams = session.snapshot(kind, now);
                    slot.bus.publish(SessionEvent::Snapshot {
                        kind,
                        teams: Arc::new(teams),
                    });
                }
            }
            _ = stop_rx.recv() => break,
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("Heartbeat task stopped");
}
