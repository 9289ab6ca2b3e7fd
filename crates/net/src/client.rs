//! TCP client for controllers and viewers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chronos_core::{Command, RosterEntry, SessionDescriptor, TeamSnapshot, UserRole};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{CreateSessionRequest, JoinInfo, Message};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Event received from the server
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Credential accepted
    Identified {
        user_id: Uuid,
        alias: String,
        role: UserRole,
    },
    /// Credential refused
    Rejected { reason: String },
    Joined(JoinInfo),
    SessionCreated { session_id: String },
    /// A request succeeded
    Ack { message: String },
    /// Partial snapshot
    Tick {
        session_id: String,
        teams: Vec<TeamSnapshot>,
    },
    /// Full snapshot
    FullTick {
        session_id: String,
        teams: Vec<TeamSnapshot>,
    },
    Users {
        session_id: String,
        users: Vec<RosterEntry>,
    },
    /// Another controller's command, for notification only
    PeerAction { session_id: String, command: Command },
    SessionEnded { session_id: String, message: String },
    Log { session_id: String, log: String },
    Sessions { sessions: Vec<SessionDescriptor> },
    /// A request failed
    Error { message: String },
    /// Round trip of the last ping
    Latency(Duration),
    /// Connection lost
    Disconnected,
}

/// Client handle for network operations
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

struct ClientState {
    connection: ConnectionState,
    user_id: Option<Uuid>,
    ping_sent: Option<Instant>,
    latency: Option<Duration>,
}

enum ClientCommand {
    Send(Message),
    Disconnect,
}

impl Client {
    /// Connect and identify with an opaque credential
    pub async fn connect(addr: SocketAddr, credential: impl Into<String>) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = tokio::io::split(stream);

        write_frame(
            &mut writer,
            &Message::Identify {
                credential: credential.into(),
            },
        )
        .await?;

        let state = Arc::new(RwLock::new(ClientState {
            connection: ConnectionState::Connecting,
            user_id: None,
            ping_sent: None,
            latency: None,
        }));

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        // Spawn connection handler
        tokio::spawn(connection_task(reader, writer, state.clone(), event_tx, cmd_rx));

        Ok(Client {
            state,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next server event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn join(&self, session_id: impl Into<String>) -> Result<()> {
        self.send(Message::Join {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn leave(&self, session_id: impl Into<String>) -> Result<()> {
        self.send(Message::Leave {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn send_action(&self, session_id: impl Into<String>, command: Command) -> Result<()> {
        self.send(Message::Action {
            session_id: session_id.into(),
            command,
        })
        .await
    }

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<()> {
        self.send(Message::CreateSession(request)).await
    }

    pub async fn kill_session(&self, session_id: impl Into<String>) -> Result<()> {
        self.send(Message::KillSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn update_role(&self, session_id: impl Into<String>, user_id: Uuid, demote: bool) -> Result<()> {
        self.send(Message::UpdateRole {
            session_id: session_id.into(),
            user_id,
            demote,
        })
        .await
    }

    pub async fn set_owner(&self, session_id: impl Into<String>, user_id: Uuid) -> Result<()> {
        self.send(Message::SetOwner {
            session_id: session_id.into(),
            user_id,
        })
        .await
    }

    pub async fn get_log(&self, session_id: impl Into<String>) -> Result<()> {
        self.send(Message::GetLog {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<()> {
        self.send(Message::ListSessions).await
    }

    /// Send a ping; the round trip arrives as [`ClientEvent::Latency`]
    pub async fn ping(&self) -> Result<()> {
        self.state.write().await.ping_sent = Some(Instant::now());
        self.send(Message::Ping).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Our user id once identified
    pub async fn user_id(&self) -> Option<Uuid> {
        self.state.read().await.user_id
    }

    /// Last measured round trip
    pub async fn latency(&self) -> Option<Duration> {
        self.state.read().await.latency
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    // Wait for identify response
    match read_frame::<Message, _>(&mut reader).await {
        Ok(Message::Identified { user_id, alias, role }) => {
            {
                let mut s = state.write().await;
                s.connection = ConnectionState::Connected;
                s.user_id = Some(user_id);
            }
            let _ = event_tx
                .send(ClientEvent::Identified { user_id, alias, role })
                .await;
            info!(user_id = %user_id, "Identified with server");
        }
        Ok(Message::Rejected { reason }) => {
            state.write().await.connection = ConnectionState::Disconnected;
            warn!(reason = %reason, "Identify rejected");
            let _ = event_tx.send(ClientEvent::Rejected { reason }).await;
            return;
        }
        Ok(_) => {
            warn!("Unexpected first message");
            state.write().await.connection = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to read identify response");
            state.write().await.connection = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
    }

    // Main loop - handle incoming messages and outgoing commands
    loop {
        tokio::select! {
            // Incoming message from server
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        if let Some(event) = handle_server_message(msg, &state).await {
                            if event_tx.send(event).await.is_err() {
                                debug!("Event receiver dropped");
                                break;
                            }
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // Outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    state.write().await.connection = ConnectionState::Disconnected;
    let _ = event_tx.send(ClientEvent::Disconnected).await;
    info!("Disconnected from server");
}

/// Map a server message to an event
async fn handle_server_message(msg: Message, state: &Arc<RwLock<ClientState>>) -> Option<ClientEvent> {
    let event = match msg {
        Message::Joined(info) => ClientEvent::Joined(info),
        Message::SessionCreated { session_id } => ClientEvent::SessionCreated { session_id },
        Message::Ack { message } => ClientEvent::Ack { message },
        Message::Tick { session_id, teams } => ClientEvent::Tick { session_id, teams },
        Message::FullTick { session_id, teams } => ClientEvent::FullTick { session_id, teams },
        Message::Users { session_id, users } => ClientEvent::Users { session_id, users },
        Message::PeerAction { session_id, command } => {
            debug!(session_id = %session_id, verb = %command.verb, "Peer action");
            ClientEvent::PeerAction { session_id, command }
        }
        Message::SessionEnded { session_id, message } => {
            info!(session_id = %session_id, "Session ended");
            ClientEvent::SessionEnded { session_id, message }
        }
        Message::Log { session_id, log } => ClientEvent::Log { session_id, log },
        Message::Sessions { sessions } => ClientEvent::Sessions { sessions },
        Message::Error { message } => ClientEvent::Error { message },
        Message::Pong => {
            let mut s = state.write().await;
            let sent = s.ping_sent.take()?;
            let latency = sent.elapsed();
            s.latency = Some(latency);
            ClientEvent::Latency(latency)
        }
        _ => {
            debug!("Ignoring unexpected message");
            return None;
        }
    };
    Some(event)
}
