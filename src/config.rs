//! Identity configuration, loaded from TOML.
//!
//! ```toml
//! [sessions]
//! persistent = true
//! database_path = "/var/lib/studyhall/sessions.db"
//! fallback_to_memory = true
//! ttl_secs = 86400
//!
//! [password]
//! memory_kib = 19456
//! iterations = 2
//! parallelism = 1
//!
//! [reset]
//! token_ttl_secs = 86400
//!
//! [users]
//! database_path = "/var/lib/studyhall/users.db"
//! ```

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default session lifetime: 24 hours.
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 3600;

/// Default password-reset window: 24 hours.
const DEFAULT_RESET_TTL_SECS: u64 = 24 * 3600;

const CONFIG_FILE_NAME: &str = "identity.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IdentityConfig {
    pub sessions: SessionConfig,
    pub password: PasswordConfig,
    pub reset: ResetConfig,
    pub users: UserStoreConfig,
}

/// Session backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    /// Use the SQLite-backed persistent store instead of process memory.
    pub persistent: bool,
    /// Location of the persistent store. `None` resolves to the platform
    /// data directory.
    pub database_path: Option<PathBuf>,
    /// Downgrade to the in-process store when the persistent one cannot be
    /// opened. When false, startup fails instead.
    pub fallback_to_memory: bool,
    /// Session lifetime in seconds, refreshed on each validated access.
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            database_path: None,
            fallback_to_memory: true,
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

impl SessionConfig {
    /// In-process sessions only. Used by tests and embedders without disk.
    pub fn in_memory() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| default_data_dir().map(|dir| dir.join("sessions.db")))
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        // OWASP minimum for argon2id
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl PasswordConfig {
    /// Cheap parameters for unit tests. Never use in production.
    pub fn fast_insecure() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ResetConfig {
    /// How long a password-reset token stays valid.
    pub token_ttl_secs: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: DEFAULT_RESET_TTL_SECS,
        }
    }
}

impl ResetConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Bundled SQLite user repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct UserStoreConfig {
    pub database_path: Option<PathBuf>,
}

impl UserStoreConfig {
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| default_data_dir().map(|dir| dir.join("users.db")))
    }
}

impl IdentityConfig {
    /// Load from `path`, or from the platform config directory when `path`
    /// is `None`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No identity config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// JSON schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(IdentityConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "studyhall")
}

fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}
