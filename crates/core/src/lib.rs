//! Chronos Core Library
//!
//! Team timers, the session heartbeat, action parsing and access control for
//! the Chronos countdown service. Everything here is synchronous and takes
//! time as an explicit `Instant`; the `chronos-net` crate drives it.

pub mod action;
pub mod config;
pub mod error;
pub mod identity;
pub mod invariants;
pub mod log;
pub mod models;
pub mod session;
pub mod snapshot;
pub mod ticker;

pub use action::{Action, Command};
pub use config::TimingConfig;
pub use error::{Error, Result};
pub use identity::{CredentialDirectory, Identity, IdentityProvider};
pub use log::{AuditLog, LogEntry, LogKind};
pub use models::*;
pub use session::{generate_session_id, ActionOutcome, Listener, NewSession, Session};
pub use snapshot::{
    RosterEntry, SessionDescriptor, SimplifiedState, SnapshotKind, TeamSnapshot, TeamsConfig,
};
pub use ticker::{HeartbeatGate, SnapshotCadence, Ticker, TICK_CYCLE};
