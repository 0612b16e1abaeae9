//! Async cookie jar over a [`CookieStore`].
//!
//! Reads run concurrently. Writes are serialized per jar so that a batch of
//! `Set-Cookie` headers from one response lands atomically with respect to
//! other writers. Store calls are synchronous and run on the blocking pool.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use umbra_core::cookie::{self, CookieChange, CookieMutation, StoredCookie};
use umbra_core::{CookieRecord, CookieStore, MemoryCookieStore, ProxyError, Result, RewriteContext};

/// Cookie jar keyed by destination, never by the relay origin.
pub struct CookieJar {
    store: Arc<dyn CookieStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar").finish_non_exhaustive()
    }
}

impl CookieJar {
    pub fn new(store: Arc<dyn CookieStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a jar backed by a [`MemoryCookieStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCookieStore::new()))
    }

    /// Returns the cookies that apply to the current URL of `ctx`.
    ///
    /// Rows that fail to decode are skipped and logged.
    pub async fn get_cookies(&self, ctx: &RewriteContext) -> Result<Vec<CookieRecord>> {
        let Some(host) = ctx.current().host_str() else {
            return Ok(Vec::new());
        };
        let domains = cookie::candidate_domains(host);
        let store = Arc::clone(&self.store);
        let rows = tokio::task::spawn_blocking(move || store.load(&domains))
            .await
            .map_err(|e| ProxyError::internal("JoinError", e.to_string()))?
            .map_err(|e| ProxyError::internal("CookieStoreError", e.to_string()))?;

        let now = Utc::now();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match CookieRecord::try_from(row) {
                Ok(record) if record.matches(ctx, now) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping corrupt cookie record"),
            }
        }
        Ok(records)
    }

    /// Serializes the applicable cookies, as a `Cookie:` header value or as
    /// the client bootstrap payload.
    pub async fn serialize(&self, ctx: &RewriteContext, for_client_bootstrap: bool) -> Result<String> {
        let records = self.get_cookies(ctx).await?;
        Ok(cookie::serialize(&records, ctx, for_client_bootstrap, Utc::now()))
    }

    /// Ingests `Set-Cookie` values received from the current URL of `ctx`.
    ///
    /// Rejected cookies are logged and skipped. Returns the number of
    /// mutations applied.
    pub async fn set_cookies(&self, headers: &[String], ctx: &RewriteContext) -> Result<usize> {
        let now = Utc::now();
        let url = ctx.current();
        let batch: Vec<CookieMutation> = headers
            .iter()
            .filter_map(|header| match cookie::parse_set_cookie(header, url, now) {
                Ok(CookieChange::Set(record)) => {
                    Some(CookieMutation::Upsert(StoredCookie::from(&record)))
                }
                Ok(CookieChange::Remove(key)) => Some(CookieMutation::Delete(key)),
                Err(reason) => {
                    debug!(url = %url, reason = ?reason, "Rejected Set-Cookie");
                    None
                }
            })
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let applied = batch.len();
        let _guard = self.write_lock.lock().await;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.apply(&batch))
            .await
            .map_err(|e| ProxyError::internal("JoinError", e.to_string()))?
            .map_err(|e| ProxyError::internal("CookieStoreError", e.to_string()))?;
        debug!(url = %url, applied, "Stored cookies");
        Ok(applied)
    }
}
