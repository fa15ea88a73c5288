//! Error model for the identity core.
//!
//! Storage adapters speak `anyhow`; everything that crosses the
//! [`IdentityService`](crate::auth::IdentityService) boundary is translated
//! into an [`IdentityError`] with a machine-readable [`ErrorKind`] and a short
//! message that is safe to show to the person at the keyboard.

use serde::{Deserialize, Serialize};

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: bad email shape, weak password, empty credentials.
    Validation,
    /// Unknown user, session, or token.
    NotFound,
    /// Login rejected. Deliberately carries no reason.
    InvalidCredentials,
    /// Hashing or token generation failed.
    Security,
    /// Session store or user repository unreachable.
    BackendUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Security => "security",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("security failure: {0}")]
    Security(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl IdentityError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security(message.into())
    }

    /// Wrap a storage failure. The full chain is logged here and the
    /// returned error only carries the top-level context.
    pub fn backend(err: anyhow::Error) -> Self {
        tracing::warn!("Identity backend failure: {err:#}");
        Self::BackendUnavailable(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::Security(_) => ErrorKind::Security,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
        }
    }

    /// Short message suitable for the presentation layer.
    ///
    /// Security and backend failures collapse to generic text so internal
    /// details never reach the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::NotFound(msg) => msg.clone(),
            Self::InvalidCredentials => "Invalid username or password".into(),
            Self::Security(_) => "A security error occurred. Please try again.".into(),
            Self::BackendUnavailable(_) => "Service temporarily unavailable".into(),
        }
    }
}

pub type IdentityResult<T> = Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(IdentityError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(IdentityError::not_found("User not found").kind(), ErrorKind::NotFound);
        assert_eq!(
            IdentityError::InvalidCredentials.kind(),
            ErrorKind::InvalidCredentials
        );
        assert_eq!(IdentityError::security("rng").kind(), ErrorKind::Security);
        assert_eq!(
            IdentityError::backend(anyhow::anyhow!("disk gone")).kind(),
            ErrorKind::BackendUnavailable
        );
    }

    #[test]
    fn user_message_hides_internals() {
        let err = IdentityError::backend(anyhow::anyhow!("sqlite: database is locked"));
        assert!(!err.user_message().contains("sqlite"));

        let err = IdentityError::security("argon2 params rejected");
        assert!(!err.user_message().contains("argon2"));

        let err = IdentityError::validation("Username is already taken");
        assert_eq!(err.user_message(), "Username is already taken");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
        assert_eq!(ErrorKind::InvalidCredentials.as_str(), "invalid_credentials");
    }
}
