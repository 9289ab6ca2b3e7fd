//! Append-only audit log of a session

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Category of an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Created,
    Action,
    Privilege,
    Owner,
    Terminated,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Created => "created",
            LogKind::Action => "action",
            LogKind::Privilege => "privilege",
            LogKind::Owner => "owner",
            LogKind::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub detail: String,
}

impl LogEntry {
    /// `[2024-05-01T10:00:00.000Z] action: started teams: 0, 1`
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind.as_str(),
            self.detail
        )
    }
}

/// Ordered audit entries. There is no way to remove or edit one.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, kind: LogKind, detail: impl Into<String>) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newline-joined text export
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(LogEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut log = AuditLog::new();
        log.append(LogKind::Created, "created chrono");
        log.append(LogKind::Action, "paused teams: 0");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].kind, LogKind::Created);
        assert_eq!(log.entries()[1].detail, "paused teams: 0");
    }

    #[test]
    fn test_render() {
        let mut log = AuditLog::new();
        log.append(LogKind::Action, "started teams: 0, 1");
        log.append(LogKind::Privilege, "added privilege");
        let text = log.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] action: started teams: 0, 1"));
        assert!(lines[0].contains('Z'));
    }
}
