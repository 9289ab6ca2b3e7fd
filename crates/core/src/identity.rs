//! Identity provider contract
//!
//! Credentials are opaque to the rest of the system: an [`IdentityProvider`]
//! turns one into an [`Identity`] and that result is trusted as is.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::UserRole;

/// Bytes of randomness in an issued token
const TOKEN_BYTES: usize = 24;

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub alias: String,
    pub role: UserRole,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Resolves opaque credentials
pub trait IdentityProvider: Send + Sync {
    /// Fails with [`Error::InvalidCredential`] for unknown credentials
    fn identify(&self, credential: &str) -> Result<Identity>;
}

/// In-memory credential directory
#[derive(Debug, Default)]
pub struct CredentialDirectory {
    by_token: RwLock<HashMap<String, Identity>>,
}

impl CredentialDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh user and return their token
    pub fn issue(&self, alias: impl Into<String>, role: UserRole) -> (String, Identity) {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let identity = self.register(token.clone(), alias, role);
        (token, identity)
    }

    /// Register a fresh user under a known token
    pub fn register(&self, token: impl Into<String>, alias: impl Into<String>, role: UserRole) -> Identity {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            alias: alias.into(),
            role,
        };
        self.insert(token, identity.clone());
        identity
    }

    /// Register a known token, replacing any previous holder
    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        if let Ok(mut map) = self.by_token.write() {
            map.insert(token.into(), identity);
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.by_token
            .write()
            .map(|mut map| map.remove(token).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_token.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityProvider for CredentialDirectory {
    fn identify(&self, credential: &str) -> Result<Identity> {
        let map = self.by_token.read().map_err(|_| Error::InvalidCredential)?;
        map.get(credential).cloned().ok_or(Error::InvalidCredential)
    }
}
