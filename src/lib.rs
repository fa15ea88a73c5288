//! StudyHall identity core: password policy, role permissions, session
//! storage, and the identity service that orchestrates them.

pub mod auth;
pub mod config;
pub mod error;
pub mod session;

pub use auth::{IdentityService, LoginOutcome, Permission, Registration, Role};
pub use config::IdentityConfig;
pub use error::{ErrorKind, IdentityError, IdentityResult};
pub use session::{BackendKind, Session, SessionBackend, SessionStore};
