//! TCP server exposing the session registry
//!
//! Every connection starts with an `Identify` frame. After that the client
//! may create, join and command sessions. Each joined session gets a
//! forwarder task that turns bus events into frames for this connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chronos_core::{Identity, IdentityProvider, NewSession};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::SessionEvent;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{CreateSessionRequest, Message};
use crate::registry::SessionRegistry;

/// Maximum number of simultaneous connections
const MAX_CONNECTIONS: usize = 256;

/// Outgoing frames buffered per connection
const OUTBOX_CAPACITY: usize = 64;

/// Server state shared across tasks
struct ServerState {
    /// Identified connections by connection id
    peers: HashMap<Uuid, Identity>,
}

/// Everything a connection handler needs
struct Context {
    registry: SessionRegistry,
    identities: Arc<dyn IdentityProvider>,
    state: RwLock<ServerState>,
}

/// Server handle
pub struct Server {
    addr: SocketAddr,
    context: Arc<Context>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start a server on the given port (0 picks a free one)
    pub async fn start(
        port: u16,
        registry: SessionRegistry,
        identities: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let context = Arc::new(Context {
            registry,
            identities,
            state: RwLock::new(ServerState {
                peers: HashMap::new(),
            }),
        });

        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(listener, context.clone(), shutdown_tx.clone(), shutdown_rx));

        Ok(Server {
            addr: bound_addr,
            context,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.context.registry
    }

    /// Number of identified connections
    pub async fn connection_count(&self) -> usize {
        self.context.state.read().await.peers.len()
    }

    /// Stop accepting and drop every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    context: Arc<Context>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let context = context.clone();
                        let shutdown_rx = shutdown_tx.subscribe();
                        tokio::spawn(handle_connection(stream, addr, context, shutdown_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Per-connection state owned by the read loop
struct Connection {
    id: Uuid,
    identity: Identity,
    tx: mpsc::Sender<Message>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, msg: Message) {
        if self.tx.send(msg).await.is_err() {
            debug!(connection = %self.id, "Failed to queue message");
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<Context>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // First message must be Identify
    let identity = match handle_identify(&mut reader, &context).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Identify failed");
            let reason = match e {
                Error::Rejected(reason) => reason,
                other => other.to_string(),
            };
            let _ = write_frame(&mut writer, &Message::Rejected { reason }).await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    {
        let mut s = context.state.write().await;
        s.peers.insert(connection_id, identity.clone());
    }
    info!(addr = %addr, user_id = %identity.user_id, alias = %identity.alias, "Client identified");

    // Spawn writer task
    let (msg_tx, msg_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    let mut conn = Connection {
        id: connection_id,
        identity,
        tx: msg_tx,
        forwarders: HashMap::new(),
    };
    conn.send(Message::Identified {
        user_id: conn.identity.user_id,
        alias: conn.identity.alias.clone(),
        role: conn.identity.role,
    })
    .await;

    // Read loop
    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => handle_message(msg, &mut conn, &context).await,
                    Err(Error::ConnectionClosed) => {
                        debug!(user_id = %conn.identity.user_id, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(user_id = %conn.identity.user_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(user_id = %conn.identity.user_id, "Closing connection for shutdown");
                break;
            }
        }
    }

    // Cleanup
    for (_, forwarder) in conn.forwarders.drain() {
        forwarder.abort();
    }
    let left = context.registry.remove_listener(conn.identity.user_id).await;
    let peer = context.state.write().await.peers.remove(&connection_id);
    drop(conn);
    // Let queued frames drain before the socket closes
    let _ = writer_handle.await;

    let alias = peer.map(|identity| identity.alias).unwrap_or_default();
    info!(connection = %connection_id, alias = %alias, sessions_left = left.len(), "Client disconnected");
}

/// Resolve the first frame to an identity
async fn handle_identify(reader: &mut ReadHalf<TcpStream>, context: &Context) -> Result<Identity> {
    let msg: Message = read_frame(reader).await?;

    match msg {
        Message::Identify { credential } => {
            let identity = context
                .identities
                .identify(&credential)
                .map_err(|e| Error::Rejected(e.to_string()))?;

            // Check capacity
            if context.state.read().await.peers.len() >= MAX_CONNECTIONS {
                return Err(Error::ServerFull);
            }
            Ok(identity)
        }
        _ => Err(Error::Protocol("Expected Identify".into())),
    }
}

/// Writer task - sends messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Turn a registry result into a reply frame
fn reply<T>(result: Result<T>, ok: impl FnOnce(T) -> Message) -> Message {
    match result {
        Ok(value) => ok(value),
        Err(e) => Message::error(e.to_string()),
    }
}

/// Handle an incoming message
async fn handle_message(msg: Message, conn: &mut Connection, context: &Context) {
    let registry = &context.registry;
    let caller = conn.identity.user_id;

    let response = match msg {
        Message::Join { session_id } => match registry.join(&session_id, &conn.identity).await {
            Ok((info, rx)) => {
                // Joined goes out before any event the forwarder relays
                conn.send(Message::Joined(info)).await;
                let forwarder = tokio::spawn(forward_events(
                    session_id.clone(),
                    conn.id,
                    rx,
                    conn.tx.clone(),
                ));
                if let Some(previous) = conn.forwarders.insert(session_id, forwarder) {
                    previous.abort();
                }
                return;
            }
            Err(e) => {
                warn!(user_id = %caller, error = %e, "Join rejected");
                Message::error(e.to_string())
            }
        },
        Message::Leave { session_id } => {
            if let Some(forwarder) = conn.forwarders.remove(&session_id) {
                forwarder.abort();
            }
            reply(registry.leave(&session_id, caller).await, |_| Message::Ack {
                message: "Left session".into(),
            })
        }
        Message::Action { session_id, command } => reply(
            registry
                .dispatch_action(&session_id, caller, &command, Some(conn.id))
                .await,
            |outcome| Message::Ack {
                message: outcome.message.to_string(),
            },
        ),
        Message::CreateSession(request) => match validate_create(request, caller) {
            Ok(params) => {
                let session_id = registry.create_session(params).await;
                Message::SessionCreated { session_id }
            }
            Err(reason) => Message::error(reason),
        },
        Message::KillSession { session_id } => {
            reply(registry.kill_session_as(&session_id, &conn.identity).await, |_| {
                Message::Ack {
                    message: "Session ended".into(),
                }
            })
        }
        Message::UpdateRole {
            session_id,
            user_id,
            demote,
        } => reply(
            registry.modify_privilege(&session_id, caller, user_id, demote).await,
            |changed| Message::Ack {
                message: if changed { "Role updated" } else { "Role unchanged" }.into(),
            },
        ),
        Message::SetOwner { session_id, user_id } => reply(
            registry.set_owner(&session_id, &conn.identity, user_id).await,
            |_| Message::Ack {
                message: "Owner changed".into(),
            },
        ),
        Message::GetLog { session_id } => match registry.can_read_log(&session_id, caller).await {
            Ok(true) => reply(registry.get_log(&session_id).await, |log| Message::Log {
                session_id,
                log,
            }),
            Ok(false) => Message::error("Logs are private"),
            Err(e) => Message::error(e.to_string()),
        },
        Message::ListSessions => {
            let sessions = if conn.identity.is_admin() {
                registry.list_sessions().await
            } else {
                registry.sessions_owned_by(caller).await
            };
            Message::Sessions { sessions }
        }
        Message::Ping => Message::Pong,
        Message::Identify { .. } => Message::error("Already identified"),
        _ => {
            debug!(user_id = %caller, "Ignoring unexpected message type");
            return;
        }
    };

    conn.send(response).await;
}

/// Check a create request and turn it into session parameters
fn validate_create(request: CreateSessionRequest, owner: Uuid) -> std::result::Result<NewSession, String> {
    let teams: Vec<String> = request
        .teams
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    if teams.is_empty() {
        return Err("At least one team is required".into());
    }
    if request.initial_time == 0 {
        return Err("Initial time must be positive".into());
    }

    let mut params = NewSession::new(owner, teams, request.initial_time)
        .autostart(request.autostart)
        .public(request.is_public)
        .public_logs(!request.private_logs);
    if let Some(alias) = request.alias {
        params = params.with_alias(alias);
    }
    Ok(params)
}

/// Relay one session's bus events to a connection
async fn forward_events(
    session_id: String,
    connection_id: Uuid,
    mut rx: broadcast::Receiver<SessionEvent>,
    tx: mpsc::Sender<Message>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(session_id = %session_id, skipped, "Subscriber lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let (msg, last) = match event {
            SessionEvent::Snapshot { kind, teams } => {
                let teams = teams.as_ref().clone();
                let session_id = session_id.clone();
                let msg = match kind {
                    chronos_core::SnapshotKind::Partial => Message::Tick { session_id, teams },
                    chronos_core::SnapshotKind::Full => Message::FullTick { session_id, teams },
                };
                (msg, false)
            }
            SessionEvent::Roster(users) => (
                Message::Users {
                    session_id: session_id.clone(),
                    users: users.as_ref().clone(),
                },
                false,
            ),
            SessionEvent::PeerAction { origin, .. } if origin == Some(connection_id) => continue,
            SessionEvent::PeerAction { command, .. } => (
                Message::PeerAction {
                    session_id: session_id.clone(),
                    command,
                },
                false,
            ),
            SessionEvent::Terminated { reason } => (
                Message::SessionEnded {
                    session_id: session_id.clone(),
                    message: reason,
                },
                true,
            ),
        };

        if tx.send(msg).await.is_err() || last {
            break;
        }
    }
}
