//! Single-use password-reset tokens.
//!
//! Tokens live in the same backend as sessions under the `reset:`
//! namespace: process memory with the fallback backend, durable with the
//! persistent one. A token past its window is deleted the moment it is
//! looked up.

use super::password::generate_reset_token;
use crate::error::{IdentityError, IdentityResult};
use crate::session::{expiry_after, namespaced_key, SessionBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Key namespace for reset tokens.
pub const RESET_NAMESPACE: &str = "reset:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetToken {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ResetTokenStore {
    backend: Arc<dyn SessionBackend>,
    ttl: Duration,
}

impl ResetTokenStore {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `user_id`, valid for the configured window.
    pub fn issue(&self, user_id: &str) -> IdentityResult<String> {
        let token = generate_reset_token()?;
        let record = ResetToken {
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            expires_at: expiry_after(self.ttl),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| IdentityError::backend(anyhow::Error::new(e)))?;
        self.backend
            .put(&namespaced_key(RESET_NAMESPACE, &token), &value, record.expires_at)
            .map_err(IdentityError::backend)?;
        Ok(token)
    }

    /// Resolve a token without consuming it. Expired or unreadable tokens
    /// are deleted and reported as absent.
    pub fn lookup(&self, token: &str) -> IdentityResult<Option<ResetToken>> {
        if token.is_empty() {
            return Ok(None);
        }
        let key = namespaced_key(RESET_NAMESPACE, token);
        let Some(value) = self.backend.get(&key).map_err(IdentityError::backend)? else {
            return Ok(None);
        };

        match serde_json::from_value::<ResetToken>(value) {
            Ok(record) if record.expires_at > Utc::now() => Ok(Some(record)),
            Ok(_) => {
                self.backend.delete(&key).map_err(IdentityError::backend)?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable reset token record: {e}");
                self.backend.delete(&key).map_err(IdentityError::backend)?;
                Ok(None)
            }
        }
    }

    /// Consume a token and return its record. Only one caller can ever
    /// receive a given token's record; expired or unreadable records are
    /// dropped and reported as absent.
    pub fn take(&self, token: &str) -> IdentityResult<Option<ResetToken>> {
        if token.is_empty() {
            return Ok(None);
        }
        let key = namespaced_key(RESET_NAMESPACE, token);
        let Some(value) = self.backend.take(&key).map_err(IdentityError::backend)? else {
            return Ok(None);
        };

        match serde_json::from_value::<ResetToken>(value) {
            Ok(record) if record.expires_at > Utc::now() => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!("Discarding unreadable reset token record: {e}");
                Ok(None)
            }
        }
    }

    /// Delete a token. Returns whether a live token was removed.
    pub fn consume(&self, token: &str) -> IdentityResult<bool> {
        self.backend
            .delete(&namespaced_key(RESET_NAMESPACE, token))
            .map_err(IdentityError::backend)
    }

    /// Number of live reset tokens.
    pub fn live_count(&self) -> IdentityResult<usize> {
        Ok(self
            .backend
            .scan_prefix(RESET_NAMESPACE)
            .map_err(IdentityError::backend)?
            .len())
    }
}
