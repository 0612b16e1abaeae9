//! Mapping between real destination URLs and relay-addressable URLs.

use url::Url;

use crate::config::{ConfigStore, ProxyConfig};
use crate::error::{ProxyError, Result};

/// Per-request rewriting state.
///
/// The base URL is fixed at creation; only the current URL moves when the
/// pipeline follows a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    client_origin: Url,
    base: Url,
    current: Url,
    referrer: Option<Url>,
    navigation: bool,
}

impl RewriteContext {
    /// Creates a context for a request to `destination` made from `client_origin`.
    pub fn new(client_origin: Url, destination: Url) -> Self {
        Self {
            client_origin,
            base: destination.clone(),
            current: destination,
            referrer: None,
            navigation: false,
        }
    }

    /// Sets the real (decoded) referrer.
    pub fn with_referrer(mut self, referrer: Option<Url>) -> Self {
        self.referrer = referrer;
        self
    }

    /// Marks the request as a top-level navigation with a safe method.
    pub fn with_navigation(mut self, navigation: bool) -> Self {
        self.navigation = navigation;
        self
    }

    /// Origin the client sees (the relay's own origin).
    pub fn client_origin(&self) -> &Url {
        &self.client_origin
    }

    /// URL relative references are resolved against.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL of the resource currently being fetched.
    pub fn current(&self) -> &Url {
        &self.current
    }

    /// Real referrer, if the client sent one from inside the relay.
    pub fn referrer(&self) -> Option<&Url> {
        self.referrer.as_ref()
    }

    /// Whether this is a top-level navigation with a safe method.
    pub fn is_navigation(&self) -> bool {
        self.navigation
    }

    /// Moves the current URL after a followed redirect.
    pub fn advance(&mut self, current: Url) {
        self.current = current;
    }
}

/// Schemes that are never routed through the relay.
const PASSIVE_SCHEMES: &[&str] = &["data", "javascript", "blob", "about", "mailto", "tel", "sms"];

/// Bidirectional URL mapping bound to one configuration.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    config: ConfigStore,
}

impl UrlRewriter {
    /// Creates a rewriter for the given configuration.
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    /// The configuration this rewriter encodes with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Encodes an absolute destination URL into a relay path.
    pub fn encode(&self, real: &Url) -> String {
        self.config.encode_url(real)
    }

    /// Decodes a relay path, or an absolute URL on the client origin, back to
    /// its destination.
    pub fn decode(&self, proxied: &str, client_origin: &Url) -> Result<Url> {
        if !proxied.starts_with('/') {
            let parsed = Url::parse(proxied)
                .map_err(|e| ProxyError::MalformedProxiedUrl(format!("{proxied}: {e}")))?;
            if parsed.origin() != client_origin.origin() {
                return Err(ProxyError::MalformedProxiedUrl(format!(
                    "{proxied} is not on the relay origin"
                )));
            }
        }
        self.config.decode_url(proxied)
    }

    /// Rewrites a URL found in a document so it routes through the relay.
    ///
    /// Relative and protocol-relative references resolve against the
    /// context's base URL. URLs that cannot be fetched over HTTP (data:,
    /// javascript:, fragments, ...) are returned unchanged.
    pub fn rewrite_url(&self, raw: &str, ctx: &RewriteContext) -> String {
        self.rewrite_against(raw, ctx.base())
    }

    /// Like [`UrlRewriter::rewrite_url`] but resolves against an explicit URL.
    pub fn rewrite_against(&self, raw: &str, base: &Url) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return raw.to_string();
        }
        if let Some(scheme) = scheme_of(trimmed) {
            let scheme = scheme.to_ascii_lowercase();
            if PASSIVE_SCHEMES.contains(&scheme.as_str())
                || !matches!(scheme.as_str(), "http" | "https")
            {
                return raw.to_string();
            }
        }
        match base.join(trimmed) {
            Ok(resolved) if matches!(resolved.scheme(), "http" | "https") => self.encode(&resolved),
            _ => raw.to_string(),
        }
    }

    /// Rewrites every candidate of a `srcset` list, keeping descriptors.
    pub fn rewrite_srcset(&self, value: &str, ctx: &RewriteContext) -> String {
        value
            .split(',')
            .map(|candidate| {
                let candidate = candidate.trim();
                match candidate.split_once(char::is_whitespace) {
                    Some((url, descriptor)) => {
                        format!("{} {}", self.rewrite_url(url, ctx), descriptor.trim())
                    }
                    None => self.rewrite_url(candidate, ctx),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Resolves a possibly-proxied URL to its real form, for referrers and
    /// other values the client echoes back to the relay.
    pub fn source_url(&self, value: &str, ctx: &RewriteContext) -> Option<Url> {
        self.decode(value, ctx.client_origin()).ok()
    }
}

/// Returns the scheme of an absolute URL reference, if it has one.
fn scheme_of(value: &str) -> Option<&str> {
    let (scheme, _) = value.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        Some(scheme)
    } else {
        None
    }
}
