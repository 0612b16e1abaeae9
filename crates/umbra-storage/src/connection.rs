//! The single SQLite connection behind [`crate::Database`].
//!
//! Cookie reads and writes are short statements, so every clone of a
//! [`SharedConnection`] funnels through one mutex-held connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

/// Milliseconds a statement waits on a lock held by another process.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Migrated connection shared by every clone.
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    /// Opens (creating if needed) the cookie database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = ?path.as_ref(), journal_mode = %mode, "Cookie database opened");
        Self::prepare(conn)
    }

    /// Opens a private in-memory cookie database.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive use of the connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Config("cookie database lock poisoned".to_string()))?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(conn: &SharedConnection) -> i64 {
        conn.with(|c| Ok(c.query_row("SELECT COUNT(*) FROM cookies", [], |row| row.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_clones_share_one_database() {
        let first = SharedConnection::open_in_memory().unwrap();
        let second = first.clone();
        assert_eq!(count(&first), 0);

        first
            .with(|c| {
                c.execute(
                    "INSERT INTO cookies (domain, path, name, value, created_at, updated_at)
                     VALUES ('a.test', '/', 'x', '1', 'now', 'now')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&second), 1);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = SharedConnection::open(dir.path().join("cookies.db")).unwrap();

        let mode: String = conn
            .with(|c| Ok(c.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");

        let version: i32 = conn
            .with(|c| Ok(c.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(version, crate::schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_errors_inside_with_propagate() {
        let conn = SharedConnection::open_in_memory().unwrap();
        let result = conn.with(|c| Ok(c.execute("SELECT * FROM missing_table", [])?));
        assert!(matches!(result, Err(StorageError::Database(_))));
    }
}
