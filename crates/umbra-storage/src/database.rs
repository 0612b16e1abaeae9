//! High-level database interface.

use std::path::PathBuf;

use chrono::Utc;
use directories::ProjectDirs;
use tracing::{debug, info};
use umbra_core::cookie::{
    format_timestamp, CookieKey, CookieMutation, CookieStore, CookieStoreError, StoredCookie,
};

use crate::error::{Result, StorageError};
use crate::connection::SharedConnection;
use crate::repository::CookieRepo;

/// High-level database interface for Umbra.
#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening cookie database at: {:?}", path);
        let conn = SharedConnection::open(&path)?;

        Ok(Self { conn })
    }

    /// Create an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = SharedConnection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "umbra", "umbra")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("cookies.db"))
    }

    // === Cookies ===

    /// Insert or replace a cookie.
    pub fn upsert_cookie(&self, cookie: &StoredCookie) -> Result<()> {
        self.conn
            .with(|conn| CookieRepo::upsert(conn, cookie, &format_timestamp(Utc::now())))
    }

    /// Delete a cookie by key.
    pub fn delete_cookie(&self, key: &CookieKey) -> Result<bool> {
        self.conn.with(|conn| CookieRepo::delete(conn, key))
    }

    /// Get every cookie stored under one of `domains`.
    pub fn cookies_for_domains(&self, domains: &[String]) -> Result<Vec<StoredCookie>> {
        self.conn.with(|conn| CookieRepo::for_domains(conn, domains))
    }

    /// Apply a batch of cookie mutations atomically.
    pub fn apply_cookie_batch(&self, batch: &[CookieMutation]) -> Result<()> {
        self.conn
            .with(|conn| CookieRepo::apply(conn, batch, &format_timestamp(Utc::now())))
    }

    /// Delete expired cookies. Returns the number removed.
    pub fn purge_expired_cookies(&self) -> Result<usize> {
        let purged = self
            .conn
            .with(|conn| CookieRepo::purge_expired(conn, &format_timestamp(Utc::now())))?;
        if purged > 0 {
            debug!(purged, "Purged expired cookies");
        }
        Ok(purged)
    }

    /// Count stored cookies.
    pub fn cookie_count(&self) -> Result<i64> {
        self.conn.with(CookieRepo::count)
    }

    /// Delete every cookie.
    pub fn clear_cookies(&self) -> Result<usize> {
        self.conn.with(CookieRepo::clear)
    }
}

impl CookieStore for Database {
    fn load(&self, domains: &[String]) -> std::result::Result<Vec<StoredCookie>, CookieStoreError> {
        Ok(self.cookies_for_domains(domains)?)
    }

    fn apply(&self, batch: &[CookieMutation]) -> std::result::Result<(), CookieStoreError> {
        Ok(self.apply_cookie_batch(batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(domain: &str, name: &str, expires_at: Option<&str>) -> StoredCookie {
        StoredCookie {
            domain: domain.to_string(),
            path: "/".to_string(),
            name: name.to_string(),
            value: "v".to_string(),
            expires_at: expires_at.map(str::to_string),
            secure: true,
            http_only: true,
            same_site: "Strict".to_string(),
            host_only: false,
        }
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.cookie_count().unwrap(), 0);
    }

    #[test]
    fn test_cookie_round_trip() {
        let db = Database::in_memory().unwrap();
        let row = cookie("example.com", "id", Some("2099-01-01T00:00:00Z"));
        db.upsert_cookie(&row).unwrap();

        let rows = db.cookies_for_domains(&["example.com".to_string()]).unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn test_purge_expired_cookies() {
        let db = Database::in_memory().unwrap();
        db.upsert_cookie(&cookie("a.test", "old", Some("2000-01-01T00:00:00Z")))
            .unwrap();
        db.upsert_cookie(&cookie("a.test", "session", None)).unwrap();

        assert_eq!(db.purge_expired_cookies().unwrap(), 1);
        assert_eq!(db.cookie_count().unwrap(), 1);
    }

    #[test]
    fn test_cookie_store_impl() {
        let db = Database::in_memory().unwrap();
        let store: &dyn CookieStore = &db;

        store
            .apply(&[CookieMutation::Upsert(cookie("a.test", "x", None))])
            .unwrap();
        assert_eq!(store.load(&["a.test".to_string()]).unwrap().len(), 1);

        store
            .apply(&[CookieMutation::Delete(CookieKey {
                domain: "a.test".into(),
                path: "/".into(),
                name: "x".into(),
            })])
            .unwrap();
        assert!(store.load(&["a.test".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cookies.db");

        {
            let db = Database::with_path(&path).unwrap();
            db.upsert_cookie(&cookie("a.test", "x", None)).unwrap();
        }

        let db = Database::with_path(&path).unwrap();
        assert_eq!(db.cookie_count().unwrap(), 1);
        assert_eq!(db.clear_cookies().unwrap(), 1);
    }
}
