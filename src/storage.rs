// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! User and Message Storage
//!
//! The store the relay talks to for credentials, persisted ciphertext and
//! presence. Supports both in-memory (for testing) and SQLite (for production).
//!
//! Passwords are stored as Argon2id PHC strings. Usernames are unique
//! case-insensitively; the spelling used at registration is the canonical one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("username already exists")]
    DuplicateUsername,
    #[error("store unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("password hash error: {0}")]
    PasswordHash(String),
}

/// Persisted presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Parses a stored status; anything unrecognized reads as offline.
    pub fn from_stored(value: &str) -> Self {
        if value.eq_ignore_ascii_case("online") {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}

/// A registered user. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub public_key: String,
    pub status: PresenceStatus,
    /// `YYYY-MM-DD HH:MM:SS` in UTC, if the user ever disconnected.
    pub last_seen: Option<String>,
}

/// A persisted chat message. `content` is the opaque ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub recipient: String,
    pub content: String,
    pub created_at: String,
}

/// Trait for chat storage backends.
pub trait ChatStore: Send + Sync {
    /// Creates a user. Returns the new user ID.
    fn register(&self, username: &str, password: &str, public_key: &str)
        -> Result<i64, StoreError>;

    /// Checks a password. `Ok(None)` means unknown user or wrong password.
    fn verify(&self, username: &str, password: &str) -> Result<Option<User>, StoreError>;

    /// Looks a user up case-insensitively.
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Persists one routed message. Returns the message ID.
    fn create_message(
        &self,
        user_id: i64,
        username: &str,
        recipient: &str,
        ciphertext: &str,
    ) -> Result<i64, StoreError>;

    /// Messages exchanged between two users in either direction, oldest first.
    /// Usernames match case-insensitively.
    ///
    /// Not served over HTTP: the relay issues no user tokens, so there is no
    /// way to tell which of the two users is asking.
    fn get_messages_between(&self, user_a: &str, user_b: &str)
        -> Result<Vec<StoredMessage>, StoreError>;

    /// Updates a user's presence status.
    fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError>;

    /// Stamps a user's last-seen time with the current time.
    fn set_last_seen_now(&self, username: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Password Hashing
// ============================================================================

/// Hashes a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::PasswordHash(e.to_string()))
}

/// Checks a password against a stored PHC string.
///
/// Parameters are read from the stored hash. A hash that does not parse is
/// an error; a mismatch is `Ok(false)`.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, StoreError> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|e| StoreError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// A presence write recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Status(PresenceStatus),
    LastSeen,
}

struct MemoryUser {
    user: User,
    password_hash: String,
}

#[derive(Default)]
struct MemoryInner {
    /// Keyed by lowercased username.
    users: HashMap<String, MemoryUser>,
    messages: Vec<StoredMessage>,
    presence: Vec<(String, PresenceChange)>,
    next_user_id: i64,
    next_message_id: i64,
}

/// In-memory store.
///
/// Records every presence write and can be switched into failure modes so
/// that callers' error paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    unavailable: AtomicBool,
    reject_messages: AtomicBool,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// When set, only [`ChatStore::create_message`] fails.
    pub fn set_reject_messages(&self, reject: bool) {
        self.reject_messages.store(reject, Ordering::SeqCst);
    }

    /// Every presence write for a user, oldest first.
    pub fn presence_changes(&self, username: &str) -> Vec<PresenceChange> {
        let key = username.to_lowercase();
        match self.inner.lock() {
            Ok(inner) => inner
                .presence
                .iter()
                .filter(|(name, _)| *name == key)
                .map(|(_, change)| change.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of persisted messages.
    pub fn message_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.messages.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }
}

impl ChatStore for MemoryStore {
    fn register(
        &self,
        username: &str,
        password: &str,
        public_key: &str,
    ) -> Result<i64, StoreError> {
        let password_hash = hash_password(password)?;
        let mut inner = self.lock()?;
        let key = username.to_lowercase();
        if inner.users.contains_key(&key) {
            return Err(StoreError::DuplicateUsername);
        }

        inner.next_user_id += 1;
        let id = inner.next_user_id;
        inner.users.insert(
            key,
            MemoryUser {
                user: User {
                    id,
                    username: username.to_string(),
                    public_key: public_key.to_string(),
                    status: PresenceStatus::Offline,
                    last_seen: None,
                },
                password_hash,
            },
        );
        Ok(id)
    }

    fn verify(&self, username: &str, password: &str) -> Result<Option<User>, StoreError> {
        let (user, password_hash) = {
            let inner = self.lock()?;
            match inner.users.get(&username.to_lowercase()) {
                Some(entry) => (entry.user.clone(), entry.password_hash.clone()),
                None => return Ok(None),
            }
        };
        Ok(verify_password(password, &password_hash)?.then_some(user))
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .users
            .get(&username.to_lowercase())
            .map(|entry| entry.user.clone()))
    }

    fn create_message(
        &self,
        user_id: i64,
        username: &str,
        recipient: &str,
        ciphertext: &str,
    ) -> Result<i64, StoreError> {
        if self.reject_messages.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut inner = self.lock()?;
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        inner.messages.push(StoredMessage {
            id,
            user_id,
            username: username.to_string(),
            recipient: recipient.to_string(),
            content: ciphertext.to_string(),
            created_at: now_timestamp(),
        });
        Ok(id)
    }

    fn get_messages_between(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        let (a, b) = (user_a.to_lowercase(), user_b.to_lowercase());
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                let (from, to) = (m.username.to_lowercase(), m.recipient.to_lowercase());
                (from == a && to == b) || (from == b && to == a)
            })
            .cloned()
            .collect())
    }

    fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = username.to_lowercase();
        if let Some(entry) = inner.users.get_mut(&key) {
            entry.user.status = status;
        }
        inner.presence.push((key, PresenceChange::Status(status)));
        Ok(())
    }

    fn set_last_seen_now(&self, username: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = username.to_lowercase();
        let now = now_timestamp();
        if let Some(entry) = inner.users.get_mut(&key) {
            entry.user.last_seen = Some(now);
        }
        inner.presence.push((key, PresenceChange::LastSeen));
        Ok(())
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL allows readers and writers to operate concurrently
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password TEXT NOT NULL,
                public_key TEXT NOT NULL DEFAULT '',
                status TEXT DEFAULT 'offline',
                last_seen DATETIME
            )",
            [],
        )?;
        add_missing_column(&conn, "users", "status", "TEXT DEFAULT 'offline'")?;
        add_missing_column(&conn, "users", "last_seen", "DATETIME")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                username TEXT NOT NULL,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        add_missing_column(&conn, "messages", "recipient", "TEXT NOT NULL DEFAULT ''")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(username, recipient)",
            [],
        )?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Unavailable)
    }
}

/// Adds a column to an existing table if an older schema lacks it.
fn add_missing_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    if !exists {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
            [],
        )?;
    }
    Ok(())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let status: Option<String> = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        public_key: row.get(2)?,
        status: PresenceStatus::from_stored(status.as_deref().unwrap_or_default()),
        last_seen: row.get(4)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl ChatStore for SqliteStore {
    fn register(
        &self,
        username: &str,
        password: &str,
        public_key: &str,
    ) -> Result<i64, StoreError> {
        let password_hash = hash_password(password)?;
        let conn = self.conn()?;
        match conn.execute(
            "INSERT INTO users (username, password, public_key) VALUES (?1, ?2, ?3)",
            params![username, password_hash, public_key],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateUsername),
            Err(e) => Err(e.into()),
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<Option<User>, StoreError> {
        let found = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id, username, public_key, status, last_seen, password
                 FROM users WHERE username = ?1",
                params![username],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(5)?)),
            )
            .optional()?
        };
        match found {
            Some((user, password_hash)) => {
                Ok(verify_password(password, &password_hash)?.then_some(user))
            }
            None => Ok(None),
        }
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, username, public_key, status, last_seen
                 FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()?)
    }

    fn create_message(
        &self,
        user_id: i64,
        username: &str,
        recipient: &str,
        ciphertext: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (user_id, username, recipient, content) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, username, recipient, ciphertext],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_messages_between(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, username, recipient, content, created_at
             FROM messages
             WHERE (username = ?1 COLLATE NOCASE AND recipient = ?2 COLLATE NOCASE)
                OR (username = ?2 COLLATE NOCASE AND recipient = ?1 COLLATE NOCASE)
             ORDER BY created_at ASC, id ASC",
        )?;
        let messages = stmt
            .query_map(params![user_a, user_b], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    username: row.get(2)?,
                    recipient: row.get(3)?,
                    content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET status = ?1 WHERE username = ?2",
            params![status.as_str(), username],
        )?;
        Ok(())
    }

    fn set_last_seen_now(&self, username: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET last_seen = CURRENT_TIMESTAMP WHERE username = ?1",
            params![username],
        )?;
        Ok(())
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Opens a store for the configured backend.
pub fn create_store(
    backend: StorageBackend,
    database_path: &Path,
) -> Result<std::sync::Arc<dyn ChatStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(std::sync::Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            if let Some(parent) = database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            Ok(std::sync::Arc::new(SqliteStore::open(database_path)?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
