//! Role models

use serde::{Deserialize, Serialize};

/// Role of a user inside one session, in priority order (highest to lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionRole {
    /// Created the session - full control
    Owner = 3,
    /// Privileged - may issue commands
    Admin = 2,
    /// Read-only subscriber
    Viewer = 1,
}

impl SessionRole {
    /// Can this role issue timer commands?
    pub fn can_control(&self) -> bool {
        *self >= SessionRole::Admin
    }
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionRole::Owner => "owner",
            SessionRole::Admin => "admin",
            SessionRole::Viewer => "viewer",
        };
        f.write_str(name)
    }
}

/// Process-wide role assigned by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    /// May kill or re-own any session
    Admin,
}
