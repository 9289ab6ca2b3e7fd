//! Client that keeps a [`Mirror`] in step with the server
//!
//! Every event pulled through [`MirroredClient::next_event`] is merged into
//! the mirror before it is returned. A background task runs the local
//! heartbeat at the poll period, and commands are predicted locally before
//! they go out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chronos_core::{Command, TimingConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::client::{Client, ClientEvent};
use crate::error::{Error, Result};
use crate::mirror::Mirror;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// A [`Client`] driving a local [`Mirror`] of the joined session
pub struct MirroredClient {
    client: Client,
    mirror: Arc<Mutex<Mirror>>,
    ticker: JoinHandle<()>,
}

impl MirroredClient {
    /// Connect, identify and start the local heartbeat
    pub async fn connect(
        addr: SocketAddr,
        credential: impl Into<String>,
        timing: &TimingConfig,
    ) -> Result<Self> {
        let client = Client::connect(addr, credential).await?;
        Ok(Self::new(client, timing))
    }

    pub fn new(client: Client, timing: &TimingConfig) -> Self {
        let mirror = Arc::new(Mutex::new(Mirror::new(timing, now())));
        let ticker = tokio::spawn(tick_task(mirror.clone(), timing.poll()));
        Self {
            client,
            mirror,
            ticker,
        }
    }

    /// The underlying client, for requests that do not touch the mirror
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Copy of the current local view
    pub async fn mirror(&self) -> Mirror {
        self.mirror.lock().await.clone()
    }

    /// Next server event, already merged into the mirror
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let event = self.client.next_event().await?;
        self.mirror.lock().await.handle_event(&event, now());
        Some(event)
    }

    /// Join `session_id`, leaving the session currently mirrored
    pub async fn join(&self, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();
        let previous = {
            let mut mirror = self.mirror.lock().await;
            if mirror.session_id() == Some(session_id.as_str()) {
                None
            } else {
                let live = !mirror.is_ended();
                mirror.leave().filter(|_| live)
            }
        };
        if let Some(previous) = previous {
            self.client.leave(previous).await?;
        }
        self.client.join(session_id).await
    }

    pub async fn leave(&self) -> Result<()> {
        let session_id = self.mirror.lock().await.leave().ok_or(Error::NotJoined)?;
        self.client.leave(session_id).await
    }

    /// Apply `command` to the mirror, then send it to the joined session
    pub async fn send_action(&self, command: Command) -> Result<()> {
        let session_id = {
            let mut mirror = self.mirror.lock().await;
            let session_id = match mirror.session_id() {
                Some(id) if !mirror.is_ended() => id.to_string(),
                _ => return Err(Error::NotJoined),
            };
            let changed = mirror.predict(&command, now());
            debug!(session_id = %session_id, verb = %command.verb, changed, "Predicted command");
            session_id
        };
        self.client.send_action(session_id, command).await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

impl Drop for MirroredClient {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// Advance the mirror every `poll`; the mirror's gate keeps the cadence
async fn tick_task(mirror: Arc<Mutex<Mirror>>, poll: Duration) {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        mirror.lock().await.tick(now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::LockedField;
    use crate::protocol::{CreateSessionRequest, JoinInfo};
    use crate::registry::SessionRegistry;
    use crate::server::Server;
    use chronos_core::{
        CredentialDirectory, SessionRole, SnapshotKind, Team, TeamSnapshot, TeamState, TeamsConfig,
        UserRole,
    };

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for<T>(
        client: &mut MirroredClient,
        mut pick: impl FnMut(ClientEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = client.next_event().await.expect("connection closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn two_teams() -> CreateSessionRequest {
        CreateSessionRequest {
            teams: vec!["A".into(), "B".into()],
            initial_time: 300,
            autostart: false,
            is_public: false,
            alias: None,
            private_logs: false,
        }
    }

    async fn create(client: &mut MirroredClient) -> String {
        client.client().create_session(two_teams()).await.unwrap();
        wait_for(client, |e| match e {
            ClientEvent::SessionCreated { session_id } => Some(session_id),
            _ => None,
        })
        .await
    }

    #[tokio::test]
    async fn test_prediction_survives_echo() {
        let directory = Arc::new(CredentialDirectory::new());
        let registry = SessionRegistry::new(TimingConfig::default());
        let server = Server::start(0, registry, directory.clone()).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.addr().port()));
        let (token, identity) = directory.issue("owner", UserRole::User);

        let mut owner = MirroredClient::connect(addr, token, &TimingConfig::default())
            .await
            .unwrap();
        let session_id = create(&mut owner).await;
        assert!(matches!(
            owner.send_action(Command::new("start", vec![0])).await,
            Err(Error::NotJoined)
        ));

        owner.join(&session_id).await.unwrap();
        wait_for(&mut owner, |e| matches!(e, ClientEvent::Joined(_)).then_some(())).await;
        let mirror = owner.mirror().await;
        assert_eq!(mirror.user_id(), Some(identity.user_id));
        assert_eq!(mirror.role(), SessionRole::Owner);

        // Applied locally before the server answers
        owner.send_action(Command::new("start", vec![0])).await.unwrap();
        let mirror = owner.mirror().await;
        assert_eq!(mirror.teams()[0].state, TeamState::Running);
        assert!(mirror.locks().is_locked(0, LockedField::State, now()));

        let teams = wait_for(&mut owner, |e| match e {
            ClientEvent::FullTick { teams, .. } => Some(teams),
            _ => None,
        })
        .await;
        assert_eq!(teams[0].state, Some(TeamState::Running));
        let mirror = owner.mirror().await;
        assert_eq!(mirror.teams()[0].state, TeamState::Running);
        assert_eq!(mirror.teams()[1].state, TeamState::Ready);

        // Once the session ends a new one can be followed
        owner.client().kill_session(&session_id).await.unwrap();
        wait_for(&mut owner, |e| matches!(e, ClientEvent::SessionEnded { .. }).then_some(())).await;
        assert!(owner.mirror().await.is_ended());

        let next_id = create(&mut owner).await;
        owner.join(&next_id).await.unwrap();
        wait_for(&mut owner, |e| matches!(e, ClientEvent::Joined(_)).then_some(())).await;
        let mirror = owner.mirror().await;
        assert_eq!(mirror.session_id(), Some(next_id.as_str()));
        assert!(!mirror.is_ended());
        assert!(mirror.teams().iter().all(|t| t.state == TeamState::Ready));

        owner.disconnect().await;
        server.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_heartbeat_runs() {
        let timing = TimingConfig::default();
        let user_id = uuid::Uuid::new_v4();
        let mirror = Arc::new(Mutex::new(Mirror::new(&timing, now()).with_user(user_id)));

        let team = Team::new("A", 300);
        let joined = ClientEvent::Joined(JoinInfo {
            session_id: "abc123".into(),
            alias: "Heats".into(),
            role: SessionRole::Owner,
            users: Vec::new(),
            config: TeamsConfig {
                name: vec!["A".into()],
                base_time: 300,
            },
            state: vec![TeamSnapshot::of(&team, SnapshotKind::Full)],
        });
        {
            let mut mirror = mirror.lock().await;
            mirror.handle_event(&joined, now());
            assert!(mirror.predict(&Command::new("start", vec![0]), now()));
        }

        let ticker = tokio::spawn(tick_task(mirror.clone(), timing.poll()));
        tokio::time::sleep(Duration::from_millis(1010)).await;
        assert_eq!(mirror.lock().await.teams()[0].time_left, 299.0);
        ticker.abort();
    }
}
