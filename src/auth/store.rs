//! SQLite-backed user repository.
//!
//! Tables:
//! - `users`: id, username, email, password_hash, role, flags, timestamps
//!
//! Username and email are `UNIQUE COLLATE NOCASE`, so the database enforces
//! the same uniqueness the service checks up front.

use super::permissions::Role;
use super::users::{NewUser, User, UserConflict, UserRepository};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const USER_COLUMNS: &str = "id, username, email, password_hash, full_name, role, \
     is_active, must_change_password, last_login, created_at";

/// SQLite user store.
pub struct SqliteUserRepository {
    conn: Mutex<Connection>,
}

impl SqliteUserRepository {
    /// Open (or create) the user database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create user store directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open user store {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                full_name TEXT,
                role TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                must_change_password INTEGER NOT NULL DEFAULT 0,
                last_login INTEGER,
                created_at INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Count registered users.
    pub fn user_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Run a single-row UPDATE keyed on `id`, failing if no row matched.
    fn execute_for_user(&self, id: &str, sql: &str, args: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute(sql, args)? == 0 {
            anyhow::bail!("User {id} does not exist");
        }
        Ok(())
    }

    fn find_one(&self, column: &str, value: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1");
        let user = conn
            .query_row(&sql, params![value.trim()], row_to_user)
            .optional()?;
        Ok(user)
    }
}

impl UserRepository for SqliteUserRepository {
    fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        self.find_one("username", username)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.find_one("email", email)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        self.find_one("id", id)
    }

    fn create(&self, new_user: NewUser) -> Result<User> {
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

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let username_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![user.username],
            |row| row.get(0),
        )?;
        if username_taken {
            return Err(UserConflict::Username.into());
        }
        let email_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
            params![user.email],
            |row| row.get(0),
        )?;
        if email_taken {
            return Err(UserConflict::Email.into());
        }

        let result = tx.execute(
            "INSERT INTO users (id, username, email, password_hash, full_name, role,
                                is_active, must_change_password, last_login, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.full_name,
                user.role.as_str(),
                user.is_active,
                user.must_change_password,
                user.last_login.map(|t| t.timestamp_millis()),
                user.created_at.timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let conflict = if msg.as_deref().is_some_and(|m| m.contains("email")) {
                    UserConflict::Email
                } else {
                    UserConflict::Username
                };
                return Err(conflict.into());
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        Ok(user)
    }

    fn update(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET username = ?2, email = ?3, password_hash = ?4, full_name = ?5,
                              role = ?6, is_active = ?7, must_change_password = ?8,
                              last_login = ?9
             WHERE id = ?1",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.full_name,
                user.role.as_str(),
                user.is_active,
                user.must_change_password,
                user.last_login.map(|t| t.timestamp_millis()),
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("User {} does not exist", user.id);
        }
        Ok(())
    }

    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.execute_for_user(
            id,
            "UPDATE users SET last_login = ?2 WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )
    }

    fn replace_password_hash(&self, id: &str, expected: &str, replacement: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET password_hash = ?3 WHERE id = ?1 AND password_hash = ?2",
            params![id, expected, replacement],
        )?;
        if updated > 0 {
            return Ok(true);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            anyhow::bail!("User {id} does not exist");
        }
        Ok(false)
    }

    fn set_credentials(&self, id: &str, password_hash: &str, must_change: bool) -> Result<()> {
        self.execute_for_user(
            id,
            "UPDATE users SET password_hash = ?2, must_change_password = ?3 WHERE id = ?1",
            params![id, password_hash, must_change],
        )
    }

    fn set_must_change_password(&self, id: &str, required: bool) -> Result<()> {
        self.execute_for_user(
            id,
            "UPDATE users SET must_change_password = ?2 WHERE id = ?1",
            params![id, required],
        )
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(5)?;
    let last_login: Option<i64> = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        full_name: row.get(4)?,
        role: Role::from_str_lossy(&role),
        is_active: row.get(6)?,
        must_change_password: row.get(7)?,
        last_login: last_login.and_then(DateTime::<Utc>::from_timestamp_millis),
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
