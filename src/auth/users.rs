//! User records and the repository seam.
//!
//! The identity core does not own user storage. It talks to any
//! [`UserRepository`]; this module ships an in-memory implementation, and
//! [`super::store`] a SQLite one.

use super::permissions::{Principal, Role};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A stored user. Never serialized directly: use [`UserProfile`] for
/// anything that leaves the process.
#[derive(Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub must_change_password: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("full_name", &self.full_name)
            .field("role", &self.role)
            .field("is_active", &self.is_active)
            .field("must_change_password", &self.must_change_password)
            .field("last_login", &self.last_login)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Principal for User {
    fn principal_id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> Role {
        self.role
    }
}

/// Fields supplied at registration. The repository assigns id and
/// creation time.
#[derive(Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub role: Role,
}

/// External-facing view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub must_change_password: bool,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            role: user.role,
            is_active: user.is_active,
            must_change_password: user.must_change_password,
            last_login: user.last_login,
        }
    }
}

/// Uniqueness violation raised by [`UserRepository::create`] when another
/// writer won the race after the service's own checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UserConflict {
    #[error("username already exists")]
    Username,
    #[error("email already exists")]
    Email,
}

/// User-record storage consumed by the identity service.
///
/// Lookups by username and email are case-insensitive. `create` must be
/// atomic: either the whole record is written or nothing is.
pub trait UserRepository: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    /// Insert a new user. Fails with [`UserConflict`] on a duplicate.
    fn create(&self, new_user: NewUser) -> Result<User>;

    /// Replace a stored record wholesale.
    fn update(&self, user: &User) -> Result<()>;

    /// Set `last_login` and nothing else.
    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Swap the password hash only if it still equals `expected`. Returns
    /// whether the swap happened.
    fn replace_password_hash(&self, id: &str, expected: &str, replacement: &str) -> Result<bool>;

    /// Write a new password hash together with the must-change flag.
    fn set_credentials(&self, id: &str, password_hash: &str, must_change: bool) -> Result<()>;

    fn set_must_change_password(&self, id: &str, required: bool) -> Result<()>;
}

/// Process-local repository.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: Mutex<HashMap<String, User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }
}

impl UserRepository for MemoryUserRepository {
    fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let users = self.users.lock();
        Ok(users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username.trim()))
            .cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let users = self.users.lock();
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.lock().get(id).cloned())
    }

    fn create(&self, new_user: NewUser) -> Result<User> {
        let mut users = self.users.lock();
        if users
            .values()
            .any(|u| u.username.eq_ignore_ascii_case(&new_user.username))
        {
            return Err(UserConflict::Username.into());
        }
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&new_user.email))
        {
            return Err(UserConflict::Email.into());
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: new_user.username,
            email: new_user.email,
            password_hash: new_user.password_hash,
            full_name: new_user.full_name,
            role: new_user.role,
            is_active: true,
            must_change_password: false,
            last_login: None,
            created_at: Utc::now(),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn update(&self, user: &User) -> Result<()> {
        self.modify(&user.id, |slot| *slot = user.clone())
    }

    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(id, |user| user.last_login = Some(at))
    }

    fn replace_password_hash(&self, id: &str, expected: &str, replacement: &str) -> Result<bool> {
        let mut users = self.users.lock();
        match users.get_mut(id) {
            Some(user) if user.password_hash == expected => {
                user.password_hash = replacement.to_string();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("User {id} does not exist"),
        }
    }

    fn set_credentials(&self, id: &str, password_hash: &str, must_change: bool) -> Result<()> {
        self.modify(id, |user| {
            user.password_hash = password_hash.to_string();
            user.must_change_password = must_change;
        })
    }

    fn set_must_change_password(&self, id: &str, required: bool) -> Result<()> {
        self.modify(id, |user| user.must_change_password = required)
    }
}

impl MemoryUserRepository {
    fn modify(&self, id: &str, change: impl FnOnce(&mut User)) -> Result<()> {
        match self.users.lock().get_mut(id) {
            Some(user) => {
                change(user);
                Ok(())
            }
            None => bail!("User {id} does not exist"),
        }
    }
}
