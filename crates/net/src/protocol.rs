//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.

use chronos_core::{
    Command, RosterEntry, SessionDescriptor, SessionRole, TeamSnapshot, TeamsConfig, UserRole,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a listener receives when joining a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInfo {
    pub session_id: String,
    pub alias: String,
    pub role: SessionRole,
    pub users: Vec<RosterEntry>,
    pub config: TeamsConfig,
    /// Full snapshot taken at join time
    pub state: Vec<TeamSnapshot>,
}

/// Parameters of a `CreateSession` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub teams: Vec<String>,
    /// Seconds
    pub initial_time: u64,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub private_logs: bool,
}

/// Network protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // Client -> server
    /// First frame of every connection
    Identify { credential: String },

    /// Subscribe to a session
    Join { session_id: String },

    /// Unsubscribe from a session
    Leave { session_id: String },

    /// Dispatch a timer command
    Action { session_id: String, command: Command },

    CreateSession(CreateSessionRequest),

    /// Owner or global admin only
    KillSession { session_id: String },

    /// Grant or revoke command privilege
    UpdateRole {
        session_id: String,
        user_id: Uuid,
        demote: bool,
    },

    /// Transfer ownership
    SetOwner { session_id: String, user_id: Uuid },

    GetLog { session_id: String },

    /// Sessions owned by the caller, or all of them for a global admin
    ListSessions,

    Ping,

    // Server -> client
    /// Identify accepted
    Identified {
        user_id: Uuid,
        alias: String,
        role: UserRole,
    },

    /// Identify refused; the server closes the connection
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

    /// Roster changed
    Users {
        session_id: String,
        users: Vec<RosterEntry>,
    },

    /// Another controller changed the session
    PeerAction { session_id: String, command: Command },

    SessionEnded { session_id: String, message: String },

    Log { session_id: String, log: String },

    Sessions { sessions: Vec<SessionDescriptor> },

    /// A request failed
    Error { message: String },

    Pong,
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }
}
