//! Application state for the relay server.

use std::sync::Arc;

use umbra_core::ConfigStore;
use umbra_proxy::{CookieJar, CookieNotifier, RelayClient, RequestInterceptor};
use umbra_storage::Database;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Active relay configuration.
    pub config: ConfigStore,
    /// Request pipeline.
    pub interceptor: Arc<RequestInterceptor>,
    /// Cookie database, when cookies are persisted.
    pub db: Option<Database>,
}

impl AppState {
    /// Creates state whose cookie jar is backed by `db`.
    pub fn new(config: ConfigStore, db: Database, relay: Arc<dyn RelayClient>) -> Self {
        let jar = Arc::new(CookieJar::new(Arc::new(db.clone())));
        let interceptor =
            RequestInterceptor::new(Arc::clone(&config), relay, jar, CookieNotifier::default());
        Self {
            config,
            interceptor: Arc::new(interceptor),
            db: Some(db),
        }
    }

    /// Creates state with an in-memory cookie jar.
    pub fn in_memory(config: ConfigStore, relay: Arc<dyn RelayClient>) -> Self {
        let interceptor = RequestInterceptor::new(
            Arc::clone(&config),
            relay,
            Arc::new(CookieJar::in_memory()),
            CookieNotifier::default(),
        );
        Self::from_interceptor(interceptor)
    }

    /// Creates state around a prepared interceptor, e.g. one with hooks.
    pub fn from_interceptor(interceptor: RequestInterceptor) -> Self {
        Self {
            config: Arc::clone(interceptor.config()),
            interceptor: Arc::new(interceptor),
            db: None,
        }
    }
}
