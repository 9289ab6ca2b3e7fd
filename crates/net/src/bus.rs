//! Per-session publish channel
//!
//! Publishing never waits on subscribers. A subscriber that falls more than
//! [`BUS_CAPACITY`] events behind skips ahead and sees `Lagged`.

use std::fmt;
use std::sync::Arc;

use chronos_core::{Command, RosterEntry, SnapshotKind, TeamSnapshot};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events buffered per subscriber
pub const BUS_CAPACITY: usize = 256;

/// Publish topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SnapshotPartial,
    SnapshotFull,
    Roster,
    Terminated,
    PeerAction,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topic::SnapshotPartial => "snapshot-partial",
            Topic::SnapshotFull => "snapshot-full",
            Topic::Roster => "roster",
            Topic::Terminated => "terminated",
            Topic::PeerAction => "peer-action",
        })
    }
}

/// One published payload
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Snapshot {
        kind: SnapshotKind,
        teams: Arc<Vec<TeamSnapshot>>,
    },
    Roster(Arc<Vec<RosterEntry>>),
    /// `origin` is the connection that issued the command, if any
    PeerAction {
        origin: Option<Uuid>,
        command: Command,
    },
    Terminated {
        reason: String,
    },
}

impl SessionEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SessionEvent::Snapshot {
                kind: SnapshotKind::Partial,
                ..
            } => Topic::SnapshotPartial,
            SessionEvent::Snapshot {
                kind: SnapshotKind::Full,
                ..
            } => Topic::SnapshotFull,
            SessionEvent::Roster(_) => Topic::Roster,
            SessionEvent::PeerAction { .. } => Topic::PeerAction,
            SessionEvent::Terminated { .. } => Topic::Terminated,
        }
    }
}

/// Fan-out channel for one session
#[derive(Debug, Clone)]
pub struct SessionBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Returns the number of subscribers the event was queued for
    pub fn publish(&self, event: SessionEvent) -> usize {
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}
