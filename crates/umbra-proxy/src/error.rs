//! Error types for the relay client.

use std::time::Duration;

use thiserror::Error;
use umbra_core::ProxyError;

/// Message the relay uses when the destination host does not resolve.
pub const HOST_NOT_FOUND_MESSAGE: &str = "The specified host could not be resolved.";

/// Relay client error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay could not resolve the destination host.
    #[error("The specified host could not be resolved.")]
    HostNotFound {
        /// Status the relay answered with.
        status: Option<u16>,
    },

    /// Structured error body returned by the relay.
    #[error("relay error {code}: {message}")]
    Bare {
        status: u16,
        code: String,
        id: Option<String>,
        message: String,
        stack: Option<String>,
    },

    /// Connection to the relay failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay did not answer in time.
    #[error("relay did not respond within {0:?}")]
    Timeout(Duration),

    /// The relay answered with something that is not a Bare response.
    #[error("invalid relay response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    /// Class name shown as the error code on internal error pages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostNotFound { .. } => "HostNotFound",
            Self::Bare { .. } => "BareError",
            Self::Transport(_) => "TransportError",
            Self::Timeout(_) => "TimeoutError",
            Self::InvalidResponse(_) => "InvalidResponse",
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<RelayError> for ProxyError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::HostNotFound { status } => ProxyError::HostResolution {
                status,
                message: HOST_NOT_FOUND_MESSAGE.to_string(),
            },
            RelayError::Bare {
                status,
                code,
                id,
                message,
                stack,
            } => {
                let trace = stack.unwrap_or_else(|| format!("{code}: {message}"));
                ProxyError::RelayProtocol {
                    status: Some(status),
                    code,
                    id,
                    message,
                    trace,
                }
            }
            other => ProxyError::internal(other.name(), other.to_string()),
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
