//! Authentication and authorization.
//!
//! Provides:
//! - Password policy: strength rules, argon2id hashing, temporary passwords
//! - Static role → permission table with ownership checks
//! - User repositories (in-memory and SQLite)
//! - Single-use password-reset tokens
//! - [`IdentityService`], which ties the above to the session store
//!
//! ## Design Decisions
//! - Sessions use opaque random tokens with server-side SHA-256 hashed
//!   lookup. No JWTs.
//! - Stored hashes are PHC strings. The older iterated SHA-256 format is
//!   still verified and transparently upgraded on the next login.

pub mod password;
pub mod permissions;
pub mod reset;
pub mod service;
pub mod store;
pub mod users;

pub use password::{validate_strength, PasswordPolicy, StrengthReport};
pub use permissions::{has_access, has_permission, Permission, Principal, Resource, Role};
pub use reset::{ResetToken, ResetTokenStore};
pub use service::{IdentityService, LoginOutcome, Registration};
pub use store::SqliteUserRepository;
pub use users::{MemoryUserRepository, NewUser, User, UserProfile, UserRepository};
