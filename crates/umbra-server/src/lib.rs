//! Umbra Server - HTTP front end for the relay.
//!
//! ## Endpoints
//!
//! - `ANY <prefix>...` - Proxied resources, handled by the request interceptor
//! - `GET /umbra/umbra.{bundle,client,config,handler}.js` - Client runtime
//!   scripts, at the paths set in the relay configuration
//! - `GET /umbra/encode?url=` - Relay address for a destination URL
//! - `GET /umbra/decode?url=` - Destination URL for a relay address
//! - `GET /umbra/events` - Server-sent cookie notifications
//!
//! Everything else answers 404.
//!
//! ## Example
//!
//! ```no_run
//! use umbra_core::ProxyConfig;
//! use umbra_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerConfig::default(), ProxyConfig::default())
//!         .await
//!         .unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use umbra_core::{ConfigError, ProxyConfig};
use umbra_proxy::{BareClient, RelayError};
use umbra_storage::Database;

pub use error::{ApiError, Result};
pub use handlers::MAX_REQUEST_BODY;
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// How often expired cookies are purged from the database.
pub const COOKIE_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8080).
    pub port: u16,
    /// Cookie database path (None = in-memory).
    pub db_path: Option<String>,
    /// Time allowed for the relay to answer.
    pub relay_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db_path: None,
            relay_timeout: umbra_proxy::DEFAULT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Creates a config that keeps cookies in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a config with a specific database path.
    pub fn with_db_path(path: impl Into<String>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the relay timeout.
    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] umbra_storage::StorageError),

    /// Invalid relay configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Relay client could not be created.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The relay HTTP server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
    db: Option<Database>,
}

impl Server {
    /// Creates a server for `proxy`, talking to relays over Bare.
    pub async fn new(
        config: ServerConfig,
        proxy: ProxyConfig,
    ) -> std::result::Result<Self, ServerError> {
        proxy.validate()?;

        let db = if let Some(ref path) = config.db_path {
            Database::with_path(path)?
        } else {
            Database::in_memory()?
        };
        let relay = BareClient::with_timeout(config.relay_timeout)?;

        let state = AppState::new(proxy.into_store(), db, Arc::new(relay));
        Self::with_state(config, state)
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;
        let db = state.db.clone();

        Ok(Self {
            router: build_router(state),
            addr,
            db,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Runs the server until Ctrl-C.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs the server until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting Umbra relay on {}", self.addr);

        // SO_REUSEADDR lets a restart bind while old sockets linger in TIME_WAIT
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let purge = self.db.clone().map(spawn_cookie_purge);

        let result = axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()));

        if let Some(purge) = purge {
            purge.abort();
        }
        info!("Umbra relay stopped");
        result
    }
}

/// Builds the router over `state`.
pub fn build_router(state: AppState) -> Router {
    // UI collaborators may live on another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/umbra/encode", get(handlers::encode))
        .route("/umbra/decode", get(handlers::decode))
        .route("/umbra/events", get(handlers::events))
        .layer(cors);

    let scripts = &state.config.scripts;
    let routes = [
        (&scripts.bundle, "/umbra/umbra.bundle.js", get(handlers::bundle_script)),
        (&scripts.client, "/umbra/umbra.client.js", get(handlers::client_script)),
        (&scripts.config, "/umbra/umbra.config.js", get(handlers::config_script)),
        (&scripts.handler, "/umbra/umbra.handler.js", get(handlers::handler_script)),
    ];

    let mut router = Router::new();
    let mut served = HashSet::new();
    for (src, default, handler) in routes {
        let path = script_route(src, default);
        if served.insert(path.to_string()) {
            router = router.route(path, handler);
        } else {
            warn!(path, "Runtime script path configured twice; serving the first");
        }
    }

    router.merge(api).fallback(handlers::proxy).with_state(state)
}

/// Route serving a runtime script. Absolute script URLs are served by
/// someone else, so the default path is used.
fn script_route<'a>(src: &'a str, default: &'static str) -> &'a str {
    if src.starts_with('/') && !src.starts_with("//") {
        src
    } else {
        default
    }
}

fn spawn_cookie_purge(db: Database) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COOKIE_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let db = db.clone();
            match tokio::task::spawn_blocking(move || db.purge_expired_cookies()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to purge expired cookies"),
                Err(e) => warn!(error = %e, "Cookie purge task failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AddressResponse;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request, StatusCode};
    use futures::StreamExt;
    use tower::ServiceExt;
    use umbra_core::{InterceptedRequest, ResponseBody, UrlCodec};
    use umbra_proxy::{RelayClient, RelayResponse};
    use url::Url;

    struct StaticRelay;

    #[async_trait]
    impl RelayClient for StaticRelay {
        async fn fetch(
            &self,
            _endpoint: &Url,
            request: &InterceptedRequest,
        ) -> umbra_proxy::Result<RelayResponse> {
            if request.url.host_str() == Some("nope.invalid") {
                return Err(RelayError::HostNotFound { status: None });
            }
            let mut response = RelayResponse::new(StatusCode::OK, request.url.clone());
            response.headers.insert(
                "content-type",
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            response.headers.append(
                "set-cookie",
                HeaderValue::from_static("session=abc; Path=/"),
            );
            response.body =
                ResponseBody::from("<html><head></head><body><a href=\"/next\">n</a></body></html>".to_string());
            Ok(response)
        }
    }

    fn proxy_config() -> ProxyConfig {
        ProxyConfig::default()
            .with_codec(UrlCodec::Xor)
            .with_public_origin("http://relay.local")
    }

    fn create_test_state() -> AppState {
        AppState::in_memory(proxy_config().into_store(), Arc::new(StaticRelay))
    }

    fn create_test_app() -> Router {
        build_router(create_test_state())
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn query(value: &str) -> String {
        url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }

    #[tokio::test]
    async fn test_config_script() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri("/umbra/umbra.config.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/javascript"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("self.__umbra$config = "));
        assert!(text.contains("\"codec\":\"xor\""));
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_every_injected_script_is_served() {
        let state = create_test_state();
        let scripts = state.config.scripts.clone();
        let app = build_router(state);

        for src in scripts.in_load_order() {
            let (status, content_type, body) = get_text(app.clone(), src).await;
            assert_eq!(status, StatusCode::OK, "{src}");
            assert!(content_type.starts_with("application/javascript"), "{src}");
            assert!(!body.is_empty(), "{src}");
        }

        let (_, _, handler) = get_text(app, &scripts.handler).await;
        assert!(handler.contains("self.__umbra = umbra"));
    }

    #[tokio::test]
    async fn test_scripts_follow_configured_paths() {
        let mut config = proxy_config();
        config.scripts.bundle = "/assets/b.js".to_string();
        config.scripts.client = "https://cdn.test/client.js".to_string();
        config.scripts.handler = "/assets/b.js".to_string();
        let app = build_router(AppState::in_memory(config.into_store(), Arc::new(StaticRelay)));

        let (status, _, body) = get_text(app.clone(), "/assets/b.js").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("__umbra$bundle"));

        let (status, _, body) = get_text(app.clone(), "/umbra/umbra.client.js").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("__umbra$client"));

        let (status, _, _) = get_text(app, "/umbra/umbra.bundle.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_navigation_body_renders_error_page() {
        let state = create_test_state();
        let proxied = state
            .config
            .encode_url(&Url::parse("https://origin.test/upload").unwrap());

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&proxied)
                    .header("sec-fetch-dest", "document")
                    .body(Body::from(vec![b'x'; MAX_REQUEST_BODY + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("RequestBodyError"));
        assert!(text.contains("https://origin.test/upload"));
    }

    #[tokio::test]
    async fn test_encode_then_decode() {
        let app = create_test_app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/umbra/encode?url={}", query("https://example.com/a?b=1")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let encoded: AddressResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert!(encoded.proxied.starts_with("/service/"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/umbra/decode?url={}", query(&encoded.proxied)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let decoded: AddressResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(decoded.url, "https://example.com/a?b=1");
    }

    #[tokio::test]
    async fn test_encode_rejects_non_http() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri(format!("/umbra/encode?url={}", query("javascript:alert(1)")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_decode_outside_prefix_is_bad_request() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri(format!("/umbra/decode?url={}", query("/elsewhere/x")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proxied_document_is_rewritten() {
        let state = create_test_state();
        let proxied = state
            .config
            .encode_url(&Url::parse("https://origin.test/page").unwrap());
        let next = state
            .config
            .encode_url(&Url::parse("https://origin.test/next").unwrap());

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri(&proxied)
                    .header("sec-fetch-dest", "document")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("set-cookie").is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(&format!("href=\"{next}\"")));
        assert!(text.contains("__umbra$bootstrap"));
        assert!(text.contains("\"name\":\"session\""));
    }

    #[tokio::test]
    async fn test_failed_navigation_renders_error_page() {
        let state = create_test_state();
        let proxied = state
            .config
            .encode_url(&Url::parse("https://nope.invalid/").unwrap());

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri(&proxied)
                    .header("accept", "text/html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8(body.to_vec())
            .unwrap()
            .contains("nope.invalid"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri("/favicon.ico")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn test_events_stream_cookie_updates() {
        let state = create_test_state();
        let notifier = state.interceptor.notifier().clone();

        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/umbra/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        assert_eq!(notifier.notify_cookies_updated("https://a.test/"), 1);
        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: cookies-updated"));
        assert!(text.contains("\"url\":\"https://a.test/\""));
    }

    #[tokio::test]
    async fn test_server_with_database_persists_cookies() {
        let db = Database::in_memory().unwrap();
        let state = AppState::new(proxy_config().into_store(), db.clone(), Arc::new(StaticRelay));
        let proxied = state
            .config
            .encode_url(&Url::parse("https://origin.test/page").unwrap());
        let server = Server::with_state(ServerConfig::default().with_port(0), state).unwrap();

        let response = server
            .router()
            .oneshot(Request::builder().uri(&proxied).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(db.cookie_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.db_path.is_none());
    }

    #[tokio::test]
    async fn test_server_config_with_port() {
        let config = ServerConfig::default().with_port(9000);
        assert_eq!(config.port, 9000);
    }

    #[tokio::test]
    async fn test_server_rejects_invalid_proxy_config() {
        let result = Server::new(
            ServerConfig::default(),
            ProxyConfig::default().with_prefix("no-slashes"),
        )
        .await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
