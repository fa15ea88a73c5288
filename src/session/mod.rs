//! Opaque session tokens over a pluggable key-value backend.
//!
//! Two backends implement [`SessionBackend`]:
//! - [`SqliteBackend`]: persistent, expiry enforced inside the store
//! - [`MemoryBackend`]: process-local map with lazy expiry on read
//!
//! Keys are namespaced (`session:`, `reset:`) and carry a SHA-256 digest
//! of the token, never the token itself. Values are JSON.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::auth::permissions::{Principal, Role};
use crate::auth::password::generate_token;
use crate::config::SessionConfig;
use crate::error::{IdentityError, IdentityResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Key namespace for sessions.
pub const SESSION_NAMESPACE: &str = "session:";

/// Arbitrary data attached to a session (role, display name, ...).
pub type SessionPayload = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Persistent,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Memory => "memory",
        }
    }
}

/// Namespaced key-value storage with per-key expiry.
///
/// `get` and `scan_prefix` never return expired entries. How expiry is
/// enforced is up to the backend.
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert or overwrite `key`, expiring at `expires_at`.
    fn put(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Overwrite a live entry in place. Never creates one: returns `false`
    /// when `key` is absent or expired.
    fn touch(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Remove a live entry and return its value in one step. Of several
    /// concurrent callers, at most one gets `Some`.
    fn take(&self, key: &str) -> Result<Option<Value>>;

    /// All live entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Proactively drop expired entries. Returns how many were removed.
    fn sweep_expired(&self) -> Result<u64>;
}

/// A live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub payload: SessionPayload,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Principal for Session {
    fn principal_id(&self) -> &str {
        &self.user_id
    }

    fn role(&self) -> Role {
        self.payload
            .get("role")
            .and_then(Value::as_str)
            .map(Role::from_str_lossy)
            .unwrap_or(Role::Unknown)
    }

    fn is_admin(&self) -> bool {
        self.payload.get("is_admin").and_then(Value::as_bool) == Some(true)
            || self.role() == Role::Administrator
    }
}

/// Digest-based storage key for a token in the given namespace.
pub fn namespaced_key(namespace: &str, token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{namespace}{}", hex::encode(digest))
}

/// Absolute expiry `ttl` from now, saturating far in the future.
pub fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Session lifecycle on top of a [`SessionBackend`].
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Pick a backend from configuration.
    ///
    /// A persistent store that is not configured or cannot be opened
    /// downgrades to memory when `fallback_to_memory` is set, and is a
    /// [`IdentityError::BackendUnavailable`] otherwise.
    pub fn from_config(config: &SessionConfig) -> IdentityResult<Self> {
        if !config.persistent {
            tracing::info!(backend = "memory", "Session store initialized");
            return Ok(Self::in_memory());
        }

        let opened = match config.resolved_database_path() {
            Some(path) => SqliteBackend::open(&path),
            None => Err(anyhow::anyhow!("no session database path could be resolved")),
        };

        match opened {
            Ok(backend) => {
                tracing::info!(backend = "persistent", "Session store initialized");
                Ok(Self::new(Arc::new(backend)))
            }
            Err(e) if config.fallback_to_memory => {
                tracing::warn!(
                    "Persistent session store unavailable, falling back to in-process sessions: {e:#}"
                );
                Ok(Self::in_memory())
            }
            Err(e) => {
                tracing::error!("Persistent session store unavailable and fallback disabled: {e:#}");
                Err(IdentityError::BackendUnavailable(e.to_string()))
            }
        }
    }

    pub fn backend(&self) -> Arc<dyn SessionBackend> {
        Arc::clone(&self.backend)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Issue a new session and return its token.
    pub fn create(
        &self,
        user_id: &str,
        payload: SessionPayload,
        ttl: Duration,
    ) -> IdentityResult<String> {
        let token = generate_token()?;
        let session = Session {
            user_id: user_id.to_string(),
            payload,
            created_at: Utc::now(),
            expires_at: expiry_after(ttl),
        };
        self.write(&token, &session)?;
        tracing::debug!(user_id, backend = self.backend_kind().as_str(), "Session created");
        Ok(token)
    }

    pub fn get(&self, token: &str) -> IdentityResult<Option<Session>> {
        if token.is_empty() {
            return Ok(None);
        }
        let key = namespaced_key(SESSION_NAMESPACE, token);
        let Some(value) = self.backend.get(&key).map_err(IdentityError::backend)? else {
            return Ok(None);
        };
        match serde_json::from_value::<Session>(value) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!("Discarding unreadable session record: {e}");
                self.backend.delete(&key).map_err(IdentityError::backend)?;
                Ok(None)
            }
        }
    }

    /// Owning user id of a live session.
    pub fn validate(&self, token: &str) -> IdentityResult<Option<String>> {
        Ok(self.get(token)?.map(|s| s.user_id))
    }

    /// Push the expiry of a live session to `ttl` from now.
    ///
    /// Returns `false` when the session is gone, including when it was
    /// destroyed after being read here. A destroyed session is never
    /// brought back.
    pub fn extend(&self, token: &str, ttl: Duration) -> IdentityResult<bool> {
        let Some(mut session) = self.get(token)? else {
            return Ok(false);
        };
        session.expires_at = expiry_after(ttl);
        let value = serde_json::to_value(&session)
            .map_err(|e| IdentityError::backend(anyhow::Error::new(e)))?;
        self.backend
            .touch(
                &namespaced_key(SESSION_NAMESPACE, token),
                &value,
                session.expires_at,
            )
            .map_err(IdentityError::backend)
    }

    pub fn destroy(&self, token: &str) -> IdentityResult<bool> {
        if token.is_empty() {
            return Ok(false);
        }
        self.backend
            .delete(&namespaced_key(SESSION_NAMESPACE, token))
            .map_err(IdentityError::backend)
    }

    /// Remove every live session owned by `user_id`.
    pub fn destroy_all_for_user(&self, user_id: &str) -> IdentityResult<u64> {
        let entries = self
            .backend
            .scan_prefix(SESSION_NAMESPACE)
            .map_err(IdentityError::backend)?;

        let mut removed = 0;
        for (key, value) in entries {
            let owner = value.get("user_id").and_then(Value::as_str);
            if owner == Some(user_id) && self.backend.delete(&key).map_err(IdentityError::backend)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop stale entries. A no-op on backends that expire natively.
    pub fn sweep_expired(&self) -> IdentityResult<u64> {
        self.backend.sweep_expired().map_err(IdentityError::backend)
    }

    fn write(&self, token: &str, session: &Session) -> IdentityResult<()> {
        let value = serde_json::to_value(session)
            .map_err(|e| IdentityError::backend(anyhow::Error::new(e)))?;
        self.backend
            .put(
                &namespaced_key(SESSION_NAMESPACE, token),
                &value,
                session.expires_at,
            )
            .map_err(IdentityError::backend)
    }
}
