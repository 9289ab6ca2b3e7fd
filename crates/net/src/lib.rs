//! Chronos Network Library
//!
//! Hosts timer sessions and streams their state to connected clients.
//!
//! # Architecture
//!
//! - **Registry**: owns live sessions, one heartbeat task each
//! - **Bus**: per-session fan-out of snapshots, roster and lifecycle events
//! - **Server**: accepts TCP connections and relays bus events
//! - **Client**: connects to a server and surfaces events
//! - **Mirror**: client-side copy of a session with optimistic prediction
//! - **MirroredClient**: a client that drives a mirror from server events
//! - **Protocol**: length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let registry = SessionRegistry::new(TimingConfig::default());
//! let server = Server::start(4500, registry, Arc::new(directory)).await?;
//!
//! let mut client = MirroredClient::connect(addr, token, &TimingConfig::default()).await?;
//! client.join("k3x9qa").await?;
//! client.send_action(Command::new("start", vec![0])).await?;
//! while let Some(event) = client.next_event().await {
//!     let teams = client.mirror().await.teams().to_vec();
//! }
//! ```

pub mod bus;
pub mod client;
pub mod error;
mod frame;
pub mod mirror;
pub mod mirrored;
pub mod protocol;
pub mod registry;
pub mod server;

pub use bus::{SessionBus, SessionEvent, Topic};
pub use client::{Client, ClientEvent, ConnectionState};
pub use error::{Error, Result};
pub use mirror::{FieldLocks, LockedField, Mirror};
pub use mirrored::MirroredClient;
pub use protocol::{CreateSessionRequest, JoinInfo, Message};
pub use registry::SessionRegistry;
pub use server::Server;

/// Default port for Chronos servers
pub const DEFAULT_PORT: u16 = 4500;
