//! Session storage trait and SQLite implementation.
//!
//! Holds the authenticated profile (and bearer token) between runs so the
//! identity is known before the first request. Cleared on logout.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::types::User;
use crate::api::Result;

/// What is kept for a logged-in identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSession {
  pub user: User,
  pub token: Option<String>,
  /// When the session was written
  pub saved_at: DateTime<Utc>,
}

/// Trait for session storage backends.
pub trait SessionStorage: Send + Sync {
  /// Load the persisted session, if any.
  fn load(&self) -> Result<Option<PersistedSession>>;

  /// Replace the persisted session.
  fn save(&self, user: &User, token: Option<&str>) -> Result<()>;

  /// Forget the persisted session.
  fn clear(&self) -> Result<()>;
}

/// SQLite-based session storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> color_eyre::Result<Self> {
    use color_eyre::eyre::eyre;

    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    Self::open_at(&path)
      .map_err(|e| eyre!("Failed to open session database at {}: {}", path.display(), e))
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    Self::with_connection(Connection::open(path)?)
  }

  /// Storage that lives only as long as the process.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(SESSION_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Data directory used for the database and the log files.
  pub fn data_dir() -> color_eyre::Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| color_eyre::eyre::eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tkt"))
  }

  fn default_path() -> color_eyre::Result<PathBuf> {
    Ok(Self::data_dir()?.join("session.db"))
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Schema for the session table. A single row, keyed by a constant id.
const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    user BLOB NOT NULL,
    token TEXT,
    saved_at TEXT NOT NULL
);
"#;

impl SessionStorage for SqliteStorage {
  fn load(&self) -> Result<Option<PersistedSession>> {
    let conn = self.conn();

    let row: Option<(Vec<u8>, Option<String>, String)> = conn
      .query_row(
        "SELECT user, token, saved_at FROM session WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((user, token, saved_at)) = row else {
      return Ok(None);
    };

    let user: User = serde_json::from_slice(&user)?;
    let saved_at = DateTime::parse_from_rfc3339(&saved_at)
      .map(|dt| dt.with_timezone(&Utc))
      .unwrap_or_else(|_| Utc::now());

    Ok(Some(PersistedSession {
      user,
      token,
      saved_at,
    }))
  }

  fn save(&self, user: &User, token: Option<&str>) -> Result<()> {
    let data = serde_json::to_vec(user)?;
    self.conn().execute(
      "INSERT OR REPLACE INTO session (id, user, token, saved_at) VALUES (1, ?, ?, ?)",
      params![data, token, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.conn().execute("DELETE FROM session", [])?;
    Ok(())
  }
}
