//! Relay configuration.
//!
//! A [`ProxyConfig`] is loaded once at startup and shared read-only by every
//! in-flight request through a [`ConfigStore`] handle. It owns the relay
//! addressing contract: `<prefix><codec.encode(destination)>`.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::UrlCodec;
use crate::error::{ConfigError, ProxyError, Result};
use crate::url_rewriter::UrlRewriter;

/// Default relay prefix.
pub const DEFAULT_PREFIX: &str = "/service/";

/// Default relay endpoint (a Bare server mounted on the relay origin).
pub const DEFAULT_RELAY_ENDPOINT: &str = "/bare/";

/// Shared, read-only configuration handle.
pub type ConfigStore = Arc<ProxyConfig>;

/// Extension callback invoked once per proxied request with the request's
/// URL rewriter, before any rewriting happens.
pub type ConstructHook = Arc<dyn Fn(&UrlRewriter) + Send + Sync>;

/// URLs of the client-side runtime injected into rewritten pages and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeScripts {
    /// Rewriter bundle.
    pub bundle: String,
    /// Client hooks.
    pub client: String,
    /// Generated configuration script.
    pub config: String,
    /// Page handler.
    pub handler: String,
}

impl Default for RuntimeScripts {
    fn default() -> Self {
        Self {
            bundle: "/umbra/umbra.bundle.js".to_string(),
            client: "/umbra/umbra.client.js".to_string(),
            config: "/umbra/umbra.config.js".to_string(),
            handler: "/umbra/umbra.handler.js".to_string(),
        }
    }
}

impl RuntimeScripts {
    /// Returns the scripts in load order.
    pub fn in_load_order(&self) -> [&str; 4] {
        [&self.bundle, &self.client, &self.config, &self.handler]
    }
}

/// Relay configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Path prefix every proxied URL lives under.
    pub prefix: String,
    /// Relay endpoints; one is picked uniformly at random per interceptor.
    pub relay_endpoints: Vec<String>,
    /// Codec used to embed destination URLs.
    pub codec: UrlCodec,
    /// Client runtime script URLs.
    pub scripts: RuntimeScripts,
    /// Fixed client-facing origin. Derived from the request when unset.
    pub public_origin: Option<String>,
    /// Adds `cross-origin-embedder-policy: require-corp` to responses.
    pub cross_origin_isolated: bool,
    /// Optional extension callback.
    #[serde(skip)]
    pub construct: Option<ConstructHook>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("prefix", &self.prefix)
            .field("relay_endpoints", &self.relay_endpoints)
            .field("codec", &self.codec)
            .field("scripts", &self.scripts)
            .field("public_origin", &self.public_origin)
            .field("cross_origin_isolated", &self.cross_origin_isolated)
            .field("construct", &self.construct.is_some())
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            relay_endpoints: vec![DEFAULT_RELAY_ENDPOINT.to_string()],
            codec: UrlCodec::default(),
            scripts: RuntimeScripts::default(),
            public_origin: None,
            cross_origin_isolated: false,
            construct: None,
        }
    }
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks the invariants the rest of the relay relies on.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.prefix.len() < 2 || !self.prefix.starts_with('/') || !self.prefix.ends_with('/') {
            return Err(ConfigError::InvalidPrefix(self.prefix.clone()));
        }
        if self.relay_endpoints.is_empty() {
            return Err(ConfigError::NoRelayEndpoints);
        }
        if let Some(origin) = &self.public_origin {
            let parsed =
                Url::parse(origin).map_err(|e| ConfigError::InvalidOrigin(e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidOrigin(origin.clone()));
            }
        }
        Ok(())
    }

    /// Freezes the configuration into a shared handle.
    pub fn into_store(self) -> ConfigStore {
        Arc::new(self)
    }

    /// Sets the relay prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replaces the relay endpoint pool.
    pub fn with_relay_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relay_endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the URL codec.
    pub fn with_codec(mut self, codec: UrlCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the runtime script URLs.
    pub fn with_scripts(mut self, scripts: RuntimeScripts) -> Self {
        self.scripts = scripts;
        self
    }

    /// Fixes the client-facing origin.
    pub fn with_public_origin(mut self, origin: impl Into<String>) -> Self {
        self.public_origin = Some(origin.into());
        self
    }

    /// Enables cross-origin isolation headers.
    pub fn with_cross_origin_isolation(mut self, enabled: bool) -> Self {
        self.cross_origin_isolated = enabled;
        self
    }

    /// Sets the extension construct callback.
    pub fn on_construct<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UrlRewriter) + Send + Sync + 'static,
    {
        self.construct = Some(Arc::new(callback));
        self
    }

    /// Encodes a destination URL into a relay path.
    pub fn encode_url(&self, destination: &Url) -> String {
        format!("{}{}", self.prefix, self.codec.encode(destination.as_str()))
    }

    /// Decodes a relay path (or absolute relay URL) back to its destination.
    pub fn decode_url(&self, proxied: &str) -> Result<Url> {
        let encoded = self.strip_prefix(proxied).ok_or_else(|| {
            ProxyError::MalformedProxiedUrl(format!("{proxied} is outside {}", self.prefix))
        })?;
        let decoded = self.codec.decode(encoded)?;
        let url = Url::parse(&decoded)
            .map_err(|e| ProxyError::MalformedProxiedUrl(format!("{decoded}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ProxyError::MalformedProxiedUrl(format!(
                "unsupported scheme {other}"
            ))),
        }
    }

    /// Returns the encoded part of a relay path, if it is under the prefix.
    ///
    /// Accepts both `/prefix/...` and `scheme://host/prefix/...`.
    pub fn strip_prefix<'a>(&self, proxied: &'a str) -> Option<&'a str> {
        let path = match proxied.find("://") {
            Some(idx) if !proxied.starts_with('/') => {
                let rest = &proxied[idx + 3..];
                &rest[rest.find('/')?..]
            }
            _ => proxied,
        };
        path.strip_prefix(self.prefix.as_str())
    }

    /// Whether a path is under the relay prefix.
    pub fn is_proxied_path(&self, path: &str) -> bool {
        path.starts_with(self.prefix.as_str())
    }

    /// Client-visible view of the configuration, embedded in bootstraps.
    pub fn client_view(&self) -> serde_json::Value {
        serde_json::json!({
            "prefix": self.prefix,
            "codec": self.codec.name(),
            "relayEndpoints": self.relay_endpoints,
            "scripts": self.scripts,
        })
    }

    /// JavaScript source of the generated configuration script.
    pub fn config_script(&self) -> String {
        let json = crate::body::bootstrap::script_safe_json(&self.client_view());
        format!("self.__umbra$config = {json};\n")
    }
}
