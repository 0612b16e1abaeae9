//! Request and response values flowing through the interceptor.

use std::fmt;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Semantic role of a fetched resource. Drives body rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Document,
    Iframe,
    Script,
    Worker,
    Style,
    Other,
}

impl DestinationKind {
    /// Maps a `Sec-Fetch-Dest` value.
    pub fn from_fetch_dest(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "iframe" | "frame" | "embed" | "object" => Self::Iframe,
            "script" => Self::Script,
            "worker" | "sharedworker" | "serviceworker" => Self::Worker,
            "style" => Self::Style,
            _ => Self::Other,
        }
    }

    /// Infers the kind from request headers.
    ///
    /// Falls back to `Accept` when `Sec-Fetch-Dest` is missing.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
            return Self::from_fetch_dest(dest);
        }
        if accepts_html(headers) {
            Self::Document
        } else {
            Self::Other
        }
    }

    /// Whether a failure renders an HTML error page.
    pub fn is_navigation(&self) -> bool {
        matches!(self, Self::Document | Self::Iframe)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Iframe => "iframe",
            Self::Script => "script",
            Self::Worker => "worker",
            Self::Style => "style",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    #[default]
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

impl CacheMode {
    /// Derives the mode from `Cache-Control`/`Pragma` request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let directives = headers
            .get(http::header::CACHE_CONTROL)
            .or_else(|| headers.get(http::header::PRAGMA))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if directives.contains("no-store") {
            Self::NoStore
        } else if directives.contains("no-cache") {
            Self::NoCache
        } else if directives.contains("max-age=0") {
            Self::Reload
        } else {
            Self::Default
        }
    }
}

/// How upstream redirects are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Followed by the relay client; the final URL is reported.
    Follow,
    Error,
    /// Handed to the client as a rewritten `Location`.
    Manual,
}

impl RedirectMode {
    /// Navigations let the browser see redirects so its address bar moves.
    pub fn for_destination(kind: DestinationKind) -> Self {
        if kind.is_navigation() {
            Self::Manual
        } else {
            Self::Follow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Cors,
    SameOrigin,
    NoCors,
    Navigate,
}

impl RequestMode {
    /// Mode used upstream: `cors` for CORS requests, otherwise same-origin.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
            Some(mode) if mode.eq_ignore_ascii_case("cors") => Self::Cors,
            _ => Self::SameOrigin,
        }
    }
}

/// An inbound request, decoded and ready to be prepared for dispatch.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    /// Real destination URL.
    pub url: Url,
    pub headers: HeaderMap,
    /// Present only for methods that carry a body.
    pub body: Option<Bytes>,
    pub credentials: CredentialsMode,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub mode: RequestMode,
    pub destination: DestinationKind,
}

impl InterceptedRequest {
    /// Whether the method carries a request body.
    pub fn method_has_body(method: &Method) -> bool {
        !matches!(*method, Method::GET | Method::HEAD)
    }

    /// Whether the method is safe for SameSite=Lax top-level navigation.
    pub fn is_safe_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Returns a header value as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Streaming response body chunk.
pub type BodyChunk = std::result::Result<Bytes, std::io::Error>;

/// Response body stream.
pub type BodyStream = BoxStream<'static, BodyChunk>;

/// Response body: absent, buffered, or still streaming from upstream.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    /// Buffers the whole body.
    pub async fn collect(self) -> std::result::Result<Bytes, std::io::Error> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Converts the body into a stream regardless of its variant.
    pub fn into_stream(self) -> BodyStream {
        match self {
            ResponseBody::Empty => futures::stream::empty().boxed(),
            ResponseBody::Bytes(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            ResponseBody::Stream(stream) => stream,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Bytes(bytes) => bytes.is_empty(),
            ResponseBody::Stream(_) => false,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        ResponseBody::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        ResponseBody::Bytes(value)
    }
}

/// A response on its way back to the client.
#[derive(Debug)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl InterceptedResponse {
    /// Creates a response with the canonical reason phrase and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Creates a `text/html` response.
    pub fn html(status: StatusCode, html: String) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response.body = ResponseBody::from(html);
        response
    }

    /// Returns a header value as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Converts into an `http::Response`.
    pub fn into_http(self) -> http::Response<ResponseBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
