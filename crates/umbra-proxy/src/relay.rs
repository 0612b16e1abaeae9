//! Relay client abstraction.
//!
//! The interceptor never talks to destinations directly. Every prepared
//! request is handed to a [`RelayClient`], which performs it through a relay
//! endpoint and reports the upstream status, headers, final URL and body.

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use umbra_core::{InterceptedRequest, ResponseBody};
use url::Url;

use crate::error::Result;

/// Upstream response as reported by the relay.
#[derive(Debug)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    /// URL the response was served from.
    pub final_url: Url,
    pub body: ResponseBody,
}

impl RelayResponse {
    /// Creates a response with no headers and an empty body.
    pub fn new(status: StatusCode, final_url: Url) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers: HeaderMap::new(),
            final_url,
            body: ResponseBody::Empty,
        }
    }
}

/// Performs prepared requests through a relay endpoint.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Fetches `request` through the relay at `endpoint`.
    ///
    /// A request is dispatched once; failures are reported, not retried.
    /// Redirect responses are returned to the caller unfollowed.
    async fn fetch(&self, endpoint: &Url, request: &InterceptedRequest) -> Result<RelayResponse>;
}
