//! Error types for the rewriting layer.
//!
//! [`ProxyError`] is the failure taxonomy every pipeline stage reports to the
//! interceptor. The interceptor is the only place that turns one of these into
//! an error page or a bare status.

use thiserror::Error;

/// Failure taxonomy of the relay pipeline.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// A proxied URL could not be decoded back to its destination.
    #[error("malformed proxied URL: {0}")]
    MalformedProxiedUrl(String),

    /// The relay could not resolve the destination host.
    #[error("{message}")]
    HostResolution {
        /// Status reported by the relay, if any.
        status: Option<u16>,
        /// Relay-provided message.
        message: String,
    },

    /// Structured failure surfaced by the relay.
    #[error("relay error {code}: {message}")]
    RelayProtocol {
        /// Status reported by the relay, if any.
        status: Option<u16>,
        /// Machine-readable error code.
        code: String,
        /// Optional error id (which part of the request failed).
        id: Option<String>,
        /// Human-readable message.
        message: String,
        /// Raw trace text.
        trace: String,
    },

    /// Any other failure inside the pipeline.
    #[error("{name}: {message}")]
    Internal {
        /// Short error class name, shown as the error code.
        name: String,
        /// Stringified failure.
        message: String,
    },

    /// A single stored cookie could not be decoded.
    #[error("corrupt cookie record {key}: {reason}")]
    CookieStoreCorruption {
        /// `(domain, path, name)` of the record, joined for display.
        key: String,
        /// Why the record was rejected.
        reason: String,
    },
}

impl ProxyError {
    /// Creates an internal error with the given class name.
    pub fn internal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Status reported by the upstream, if the failure carries one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::HostResolution { status, .. } | Self::RelayProtocol { status, .. } => *status,
            _ => None,
        }
    }

    /// Status the client should receive for this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::MalformedProxiedUrl(_) => 400,
            other => other.upstream_status().unwrap_or(500),
        }
    }
}

/// Errors from loading or validating a [`crate::config::ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The relay prefix is not of the form `/segment/`.
    #[error("invalid prefix {0:?}: must start and end with '/'")]
    InvalidPrefix(String),

    /// No relay endpoints were configured.
    #[error("at least one relay endpoint is required")]
    NoRelayEndpoints,

    /// The public origin is not an absolute http(s) URL.
    #[error("invalid public origin: {0}")]
    InvalidOrigin(String),

    /// Unknown codec name.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error reading a config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the URL codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Percent-decoding produced invalid UTF-8.
    #[error("invalid percent-encoding")]
    PercentEncoding,

    /// Base64 payload could not be decoded.
    #[error("invalid base64: {0}")]
    Base64(String),
}

impl From<CodecError> for ProxyError {
    fn from(err: CodecError) -> Self {
        ProxyError::MalformedProxiedUrl(err.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_500() {
        let err = ProxyError::internal("TypeError", "boom");
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn status_uses_upstream_status() {
        let err = ProxyError::HostResolution {
            status: Some(502),
            message: "The specified host could not be resolved.".to_string(),
        };
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn malformed_url_is_bad_request() {
        let err = ProxyError::MalformedProxiedUrl("nope".to_string());
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn codec_error_maps_to_malformed_url() {
        let err: ProxyError = CodecError::PercentEncoding.into();
        assert!(matches!(err, ProxyError::MalformedProxiedUrl(_)));
    }
}
