//! Identity service: login, registration, credential changes, password
//! reset, and permission checks.
//!
//! Every public operation returns [`IdentityResult`]; repository and
//! session-store failures are translated to [`IdentityError`] here and never
//! escape raw. Any credential change is written first and followed by
//! revocation of all the user's sessions, so a caller that sees `Ok` cannot
//! hold a session minted under the old credentials.

use super::password::{self, validate_strength, PasswordPolicy};
use super::permissions::{self, Permission, Resource, Role};
use super::reset::ResetTokenStore;
use super::users::{NewUser, User, UserConflict, UserProfile, UserRepository};
use crate::config::IdentityConfig;
use crate::error::{IdentityError, IdentityResult};
use crate::session::{Session, SessionPayload, SessionStore};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const MAX_USERNAME_CHARS: usize = 64;

const USERNAME_TAKEN: &str = "Username is already taken";
const EMAIL_TAKEN: &str = "Email is already registered";
const INVALID_RESET_TOKEN: &str = "Invalid or expired reset token";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("email regex")
});

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("username regex"));

pub fn is_email_shaped(value: &str) -> bool {
    EMAIL_RE.is_match(value)
}

/// Successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub token: String,
    pub user: UserProfile,
}

/// Input for [`IdentityService::register`].
#[derive(Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
    pub role: Role,
}

impl Registration {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            full_name: None,
            role: Role::Student,
        }
    }

    pub fn full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

pub struct IdentityService {
    users: Arc<dyn UserRepository>,
    sessions: SessionStore,
    reset_tokens: ResetTokenStore,
    passwords: PasswordPolicy,
    session_ttl: Duration,
}

impl IdentityService {
    /// Build the service on an existing session store. Reset tokens share
    /// the session store's backend.
    pub fn new(
        config: &IdentityConfig,
        users: Arc<dyn UserRepository>,
        sessions: SessionStore,
    ) -> IdentityResult<Self> {
        let passwords = PasswordPolicy::new(&config.password)?;
        let reset_tokens = ResetTokenStore::new(sessions.backend(), config.reset.ttl());
        Ok(Self {
            users,
            sessions,
            reset_tokens,
            passwords,
            session_ttl: config.sessions.ttl(),
        })
    }

    /// Build the service, selecting the session backend from `config`.
    pub fn from_config(
        config: &IdentityConfig,
        users: Arc<dyn UserRepository>,
    ) -> IdentityResult<Self> {
        let sessions = SessionStore::from_config(&config.sessions)?;
        Self::new(config, users, sessions)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn reset_tokens(&self) -> &ResetTokenStore {
        &self.reset_tokens
    }

    pub fn passwords(&self) -> &PasswordPolicy {
        &self.passwords
    }

    // ── Authentication ──────────────────────────────────────────────

    /// Authenticate by username or email and open a session.
    ///
    /// Unknown user, inactive account, and wrong password all produce
    /// [`IdentityError::InvalidCredentials`].
    pub fn login(&self, identifier: &str, password: &str) -> IdentityResult<LoginOutcome> {
        let identifier = identifier.trim();
        if identifier.is_empty() || password.is_empty() {
            return Err(IdentityError::validation(
                "Username/email and password are required",
            ));
        }

        let found = self.find_for_login(identifier)?;

        let Some(mut user) = found else {
            // Spend the same effort as a real check so timing reveals nothing.
            self.passwords.dummy_verify(password);
            tracing::info!("Login rejected");
            return Err(IdentityError::InvalidCredentials);
        };

        let verified = match self.passwords.verify(password, &user.password_hash) {
            Ok(verified) => verified,
            Err(e) => {
                tracing::error!(user_id = %user.id, "Stored password hash unusable: {e}");
                false
            }
        };
        if !verified || !user.is_active {
            tracing::info!("Login rejected");
            return Err(IdentityError::InvalidCredentials);
        }

        if self.passwords.needs_rehash(&user.password_hash) {
            self.upgrade_hash(&mut user, password)?;
        }
        let now = Utc::now();
        self.users
            .record_login(&user.id, now)
            .map_err(IdentityError::backend)?;
        user.last_login = Some(now);

        let token = self
            .sessions
            .create(&user.id, session_payload(&user), self.session_ttl)?;

        // A credential change that committed after our read has either
        // already revoked this session or is visible now.
        let current = self
            .users
            .find_by_id(&user.id)
            .map_err(IdentityError::backend)?;
        let unchanged = current
            .as_ref()
            .is_some_and(|c| c.is_active && c.password_hash == user.password_hash);
        if !unchanged {
            self.sessions.destroy(&token)?;
            tracing::info!(user_id = %user.id, "Login rejected: credentials changed mid-login");
            return Err(IdentityError::InvalidCredentials);
        }
        tracing::info!(user_id = %user.id, "Login succeeded");

        Ok(LoginOutcome {
            token,
            user: UserProfile::from(&user),
        })
    }

    /// Create an account. Returns the new user id.
    pub fn register(&self, registration: Registration) -> IdentityResult<String> {
        let username = registration.username.trim();
        let email = registration.email.trim();

        if username.is_empty() {
            return Err(IdentityError::validation("Username is required"));
        }
        if username.chars().count() > MAX_USERNAME_CHARS {
            return Err(IdentityError::validation(format!(
                "Username must be at most {MAX_USERNAME_CHARS} characters"
            )));
        }
        if !USERNAME_RE.is_match(username) {
            return Err(IdentityError::validation(
                "Username may only contain letters, digits, '.', '_' and '-'",
            ));
        }
        if !is_email_shaped(email) {
            return Err(IdentityError::validation("Invalid email address"));
        }

        let report = validate_strength(&registration.password);
        if !report.is_strong() {
            return Err(IdentityError::validation(report.message()));
        }

        if self
            .users
            .find_by_username(username)
            .map_err(IdentityError::backend)?
            .is_some()
        {
            return Err(IdentityError::validation(USERNAME_TAKEN));
        }
        if self
            .users
            .find_by_email(email)
            .map_err(IdentityError::backend)?
            .is_some()
        {
            return Err(IdentityError::validation(EMAIL_TAKEN));
        }

        let password_hash = self.passwords.hash(&registration.password)?;
        let created = self.users.create(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            full_name: registration
                .full_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            role: registration.role,
        });

        match created {
            Ok(user) => {
                tracing::info!(user_id = %user.id, role = user.role.as_str(), "User registered");
                Ok(user.id)
            }
            Err(e) => match e.downcast_ref::<UserConflict>() {
                Some(UserConflict::Username) => Err(IdentityError::validation(USERNAME_TAKEN)),
                Some(UserConflict::Email) => Err(IdentityError::validation(EMAIL_TAKEN)),
                None => Err(IdentityError::backend(e)),
            },
        }
    }

    pub fn logout(&self, token: &str) -> IdentityResult<bool> {
        let destroyed = self.sessions.destroy(token)?;
        if destroyed {
            tracing::info!("Session closed");
        }
        Ok(destroyed)
    }

    /// Resolve the user behind a session and refresh the session's expiry.
    pub fn current_user(&self, token: &str) -> IdentityResult<Option<UserProfile>> {
        Ok(self
            .resolve_session(token)?
            .map(|(_, user)| UserProfile::from(&user)))
    }

    // ── Credentials ─────────────────────────────────────────────────

    pub fn change_password(
        &self,
        user_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> IdentityResult<()> {
        if current_password.is_empty() || new_password.is_empty() {
            return Err(IdentityError::validation(
                "Current and new password are required",
            ));
        }
        let user = self.require_user(user_id)?;

        if !self.passwords.verify(current_password, &user.password_hash)? {
            tracing::info!(user_id, "Password change rejected: current password mismatch");
            return Err(IdentityError::validation("Current password is incorrect"));
        }

        let report = validate_strength(new_password);
        if !report.is_strong() {
            return Err(IdentityError::validation(report.message()));
        }

        let password_hash = self.passwords.hash(new_password)?;
        self.commit_credentials(&user.id, &password_hash, false, "password changed")
    }

    /// Issue a reset token for the account behind `email`.
    ///
    /// Always succeeds for unknown addresses so callers cannot probe which
    /// emails are registered; the token is `Some` only for a real account.
    /// Delivery of the token is the caller's job.
    pub fn request_password_reset(&self, email: &str) -> IdentityResult<Option<String>> {
        let email = email.trim();
        if !is_email_shaped(email) {
            return Ok(None);
        }
        let Some(user) = self
            .users
            .find_by_email(email)
            .map_err(IdentityError::backend)?
        else {
            tracing::info!("Password reset requested for unknown address");
            return Ok(None);
        };

        let token = self.reset_tokens.issue(&user.id)?;
        tracing::info!(
            user_id = %user.id,
            window_secs = self.reset_tokens.ttl().as_secs(),
            "Password reset token issued"
        );
        Ok(Some(token))
    }

    /// Set a new password using a reset token.
    ///
    /// The token is consumed on first presentation, whether or not the new
    /// password is then accepted. Concurrent resets with one token cannot
    /// both proceed.
    pub fn reset_password(&self, token: &str, new_password: &str) -> IdentityResult<()> {
        let Some(record) = self.reset_tokens.take(token)? else {
            return Err(IdentityError::not_found(INVALID_RESET_TOKEN));
        };

        let Some(user) = self
            .users
            .find_by_id(&record.user_id)
            .map_err(IdentityError::backend)?
        else {
            tracing::warn!(user_id = %record.user_id, "Reset token referenced a missing user");
            return Err(IdentityError::not_found(INVALID_RESET_TOKEN));
        };

        let report = validate_strength(new_password);
        if !report.is_strong() {
            return Err(IdentityError::validation(report.message()));
        }

        let password_hash = self.passwords.hash(new_password)?;
        self.commit_credentials(&user.id, &password_hash, false, "password reset")
    }

    /// Replace a user's password with a generated one and return it.
    /// The user must change it at next login.
    pub fn generate_temporary_password(&self, user_id: &str) -> IdentityResult<String> {
        let user = self.require_user(user_id)?;
        let temporary = password::generate_temporary_password();
        let password_hash = self.passwords.hash(&temporary)?;
        self.commit_credentials(&user.id, &password_hash, true, "temporary password issued")?;
        Ok(temporary)
    }

    /// Set or clear the must-change-password flag. Setting it revokes all
    /// of the user's sessions.
    pub fn require_password_change_on_next_login(
        &self,
        user_id: &str,
        required: bool,
    ) -> IdentityResult<()> {
        let user = self.require_user(user_id)?;
        self.users
            .set_must_change_password(&user.id, required)
            .map_err(IdentityError::backend)?;
        if required {
            let revoked = self.sessions.destroy_all_for_user(&user.id)?;
            tracing::info!(user_id = %user.id, revoked, "Password change required at next login");
        }
        Ok(())
    }

    // ── Authorization ───────────────────────────────────────────────

    /// Whether the session behind `token` holds `permission`. Absent,
    /// expired, or unreadable sessions yield `false`, as do sessions of
    /// users who were removed or deactivated after logging in.
    pub fn check_permission(&self, token: &str, permission: Permission) -> bool {
        match self.touch_session(token) {
            Some(session) => permissions::has_permission(&session, permission),
            None => false,
        }
    }

    /// Whether the session behind `token` may act on `resource` under
    /// `permission`, either by role or by owning it.
    pub fn check_access<R: Resource + ?Sized>(
        &self,
        token: &str,
        resource: Option<&R>,
        permission: Permission,
    ) -> bool {
        match self.touch_session(token) {
            Some(session) => permissions::has_access(&session, resource, permission),
            None => false,
        }
    }

    /// Drop expired sessions and reset tokens from backends that need it.
    pub fn sweep_expired(&self) -> IdentityResult<u64> {
        let removed = self.sessions.sweep_expired()?;
        if removed > 0 {
            tracing::info!(removed, "Swept expired identity entries");
        }
        Ok(removed)
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Email-shaped identifiers try the email index first, then fall back
    /// to the username index.
    fn find_for_login(&self, identifier: &str) -> IdentityResult<Option<User>> {
        if is_email_shaped(identifier) {
            if let Some(user) = self
                .users
                .find_by_email(identifier)
                .map_err(IdentityError::backend)?
            {
                return Ok(Some(user));
            }
        }
        self.users
            .find_by_username(identifier)
            .map_err(IdentityError::backend)
    }

    fn require_user(&self, user_id: &str) -> IdentityResult<User> {
        self.users
            .find_by_id(user_id)
            .map_err(IdentityError::backend)?
            .ok_or_else(|| IdentityError::not_found("User not found"))
    }

    /// Replace a hash in an outdated format. The swap is conditional so a
    /// password changed since `user` was read is never overwritten.
    fn upgrade_hash(&self, user: &mut User, password: &str) -> IdentityResult<()> {
        let upgraded = match self.passwords.hash(password) {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(user_id = %user.id, "Password rehash skipped: {e}");
                return Ok(());
            }
        };
        let swapped = self
            .users
            .replace_password_hash(&user.id, &user.password_hash, &upgraded)
            .map_err(IdentityError::backend)?;
        if swapped {
            tracing::info!(user_id = %user.id, "Upgraded stored password hash");
            user.password_hash = upgraded;
            return Ok(());
        }

        // Someone else rewrote the hash. Adopt it if it still matches this
        // password (a concurrent upgrade); otherwise keep the stale one so the
        // post-login check rejects.
        if let Some(current) = self
            .users
            .find_by_id(&user.id)
            .map_err(IdentityError::backend)?
        {
            if self
                .passwords
                .verify(password, &current.password_hash)
                .unwrap_or(false)
            {
                user.password_hash = current.password_hash;
            }
        }
        Ok(())
    }

    /// Persist a credential change, then revoke every session of the user.
    fn commit_credentials(
        &self,
        user_id: &str,
        password_hash: &str,
        must_change: bool,
        reason: &str,
    ) -> IdentityResult<()> {
        self.users
            .set_credentials(user_id, password_hash, must_change)
            .map_err(IdentityError::backend)?;
        let revoked = self.sessions.destroy_all_for_user(user_id)?;
        tracing::info!(user_id, revoked, "Credentials updated: {reason}");
        Ok(())
    }

    /// Resolve a live session of an active user and slide its expiry
    /// forward. Sessions whose user was removed or deactivated are
    /// destroyed.
    fn resolve_session(&self, token: &str) -> IdentityResult<Option<(Session, User)>> {
        let Some(session) = self.sessions.get(token)? else {
            return Ok(None);
        };
        let user = self
            .users
            .find_by_id(&session.user_id)
            .map_err(IdentityError::backend)?;
        let Some(user) = user.filter(|u| u.is_active) else {
            self.sessions.destroy(token)?;
            return Ok(None);
        };
        if !self.sessions.extend(token, self.session_ttl)? {
            // Revoked between the read and the refresh.
            return Ok(None);
        }
        Ok(Some((session, user)))
    }

    fn touch_session(&self, token: &str) -> Option<Session> {
        match self.resolve_session(token) {
            Ok(resolved) => resolved.map(|(session, _)| session),
            Err(e) => {
                tracing::warn!("Session lookup failed during authorization: {e}");
                None
            }
        }
    }
}

fn session_payload(user: &User) -> SessionPayload {
    let mut payload = SessionPayload::new();
    payload.insert("role".into(), json!(user.role.as_str()));
    payload.insert("username".into(), json!(user.username));
    payload.insert(
        "display_name".into(),
        json!(user.full_name.as_deref().unwrap_or(&user.username)),
    );
    payload.insert(
        "is_admin".into(),
        json!(user.role == Role::Administrator),
    );
    payload.insert(
        "must_change_password".into(),
        json!(user.must_change_password),
    );
    payload
}
