//! Cookie repository.

use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::warn;
use umbra_core::cookie::{CookieKey, CookieMutation, StoredCookie};

use crate::error::Result;

const COLUMNS: &str =
    "domain, path, name, value, expires_at, secure, http_only, same_site, host_only";

/// Repository for cookie rows.
pub struct CookieRepo;

impl CookieRepo {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<StoredCookie> {
        Ok(StoredCookie {
            domain: row.get(0)?,
            path: row.get(1)?,
            name: row.get(2)?,
            value: row.get(3)?,
            expires_at: row.get(4)?,
            secure: row.get(5)?,
            http_only: row.get(6)?,
            same_site: row.get(7)?,
            host_only: row.get(8)?,
        })
    }

    /// Insert a cookie or replace the one with the same key.
    pub fn upsert(conn: &Connection, cookie: &StoredCookie, now: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO cookies (domain, path, name, value, expires_at, secure, http_only,
                                  same_site, host_only, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(domain, path, name) DO UPDATE SET
                value = ?4, expires_at = ?5, secure = ?6, http_only = ?7,
                same_site = ?8, host_only = ?9, updated_at = ?10",
            params![
                cookie.domain,
                cookie.path,
                cookie.name,
                cookie.value,
                cookie.expires_at,
                cookie.secure,
                cookie.http_only,
                cookie.same_site,
                cookie.host_only,
                now,
            ],
        )?;
        Ok(())
    }

    /// Delete a cookie by key.
    pub fn delete(conn: &Connection, key: &CookieKey) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM cookies WHERE domain = ?1 AND path = ?2 AND name = ?3",
            params![key.domain, key.path, key.name],
        )?;
        Ok(deleted > 0)
    }

    /// Get every cookie stored under one of `domains`.
    ///
    /// Rows that fail to decode are logged and skipped.
    pub fn for_domains(conn: &Connection, domains: &[String]) -> Result<Vec<StoredCookie>> {
        if domains.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; domains.len()].join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM cookies WHERE domain IN ({placeholders})
             ORDER BY length(path) DESC, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;

        let cookies = stmt
            .query_map(params_from_iter(domains.iter()), Self::from_row)?
            .filter_map(|row| match row {
                Ok(cookie) => Some(cookie),
                Err(e) => {
                    warn!("Skipping unreadable cookie row: {}", e);
                    None
                }
            })
            .collect();

        Ok(cookies)
    }

    /// Apply a batch of mutations inside one transaction.
    pub fn apply(conn: &Connection, batch: &[CookieMutation], now: &str) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        for mutation in batch {
            match mutation {
                CookieMutation::Upsert(cookie) => Self::upsert(&tx, cookie, now)?,
                CookieMutation::Delete(key) => {
                    Self::delete(&tx, key)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete cookies that expired at or before `now`.
    pub fn purge_expired(conn: &Connection, now: &str) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM cookies WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now],
        )?;
        Ok(deleted)
    }

    /// Count stored cookies.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM cookies", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete every cookie.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM cookies", [])?;
        Ok(deleted)
    }
}
