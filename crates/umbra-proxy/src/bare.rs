//! Bare v3 relay client.
//!
//! A request for `https://example.com/a` becomes a request to
//! `<endpoint>v3/` carrying the destination in `x-bare-url` and the
//! destination headers as JSON in `x-bare-headers`. The relay answers with the
//! upstream status in `x-bare-status` and the upstream headers as JSON in
//! `x-bare-headers`, split into `x-bare-headers-N` parts when long. Relay
//! failures come back as a JSON `{code, id, message, stack}` body.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use umbra_core::message::CacheMode;
use umbra_core::{InterceptedRequest, ResponseBody};
use url::Url;

use crate::error::{RelayError, Result, HOST_NOT_FOUND_MESSAGE};
use crate::relay::{RelayClient, RelayResponse};

/// Default time allowed for the relay to answer with headers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest single `x-bare-headers` value before it is split.
const MAX_HEADER_VALUE: usize = 3072;

const BARE_URL: &str = "x-bare-url";
const BARE_HEADERS: &str = "x-bare-headers";
const BARE_FORWARD_HEADERS: &str = "x-bare-forward-headers";
const BARE_STATUS: &str = "x-bare-status";
const BARE_STATUS_TEXT: &str = "x-bare-status-text";

/// Error body of a failed relay request.
#[derive(Debug, Deserialize)]
struct BareErrorBody {
    code: String,
    id: Option<String>,
    message: Option<String>,
    stack: Option<String>,
}

/// [`RelayClient`] speaking Bare v3 over HTTP.
#[derive(Debug, Clone)]
pub struct BareClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl BareClient {
    /// Creates a client with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates a client that waits at most `timeout` for response headers.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Umbra/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Performs one relay round trip. Redirects are returned as-is; the
    /// interceptor follows them so each hop gets its own cookies.
    async fn fetch_once(
        &self,
        endpoint: &Url,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
        cache: CacheMode,
    ) -> Result<RelayResponse> {
        let target = endpoint
            .join("v3/")
            .map_err(|e| RelayError::InvalidResponse(format!("bad relay endpoint {endpoint}: {e}")))?;

        let mut builder = self
            .client
            .request(method.clone(), target)
            .header(BARE_URL, url.as_str())
            .header(BARE_FORWARD_HEADERS, "[]");
        for (name, value) in split_header_value(BARE_HEADERS, &encode_headers(headers)) {
            builder = builder.header(name, value);
        }
        if matches!(cache, CacheMode::NoStore | CacheMode::Reload | CacheMode::NoCache) {
            builder = builder.header("cache-control", "no-cache");
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(RelayError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RelayError::Timeout(self.timeout)),
        };

        read_response(response, url.clone()).await
    }
}

#[async_trait]
impl RelayClient for BareClient {
    async fn fetch(&self, endpoint: &Url, request: &InterceptedRequest) -> Result<RelayResponse> {
        self.fetch_once(
            endpoint,
            &request.method,
            &request.url,
            &request.headers,
            request.body.clone(),
            request.cache,
        )
        .await
    }
}

/// Turns a relay response into the upstream response it carries.
async fn read_response(response: reqwest::Response, url: Url) -> Result<RelayResponse> {
    if !response.headers().contains_key(BARE_STATUS) {
        return Err(read_error(response).await);
    }
    let status = response
        .headers()
        .get(BARE_STATUS)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u16>().ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .ok_or_else(|| RelayError::InvalidResponse("bad x-bare-status".into()))?;
    let status_text = response
        .headers()
        .get(BARE_STATUS_TEXT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());

    let raw = join_header_value(response.headers(), BARE_HEADERS)
        .ok_or_else(|| RelayError::InvalidResponse("missing x-bare-headers".into()))?;
    let headers = decode_headers(&raw)?;

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();

    Ok(RelayResponse {
        status,
        status_text,
        headers,
        final_url: url,
        body: ResponseBody::Stream(stream),
    })
}

/// Classifies a relay failure from its error body.
async fn read_error(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => return e.into(),
    };
    classify_error(status, &text)
}

fn classify_error(status: u16, text: &str) -> RelayError {
    match serde_json::from_str::<BareErrorBody>(text) {
        Ok(body)
            if body.code == "HOST_NOT_FOUND"
                || body.message.as_deref() == Some(HOST_NOT_FOUND_MESSAGE) =>
        {
            RelayError::HostNotFound {
                status: Some(status),
            }
        }
        Ok(body) => RelayError::Bare {
            status,
            message: body.message.unwrap_or_else(|| body.code.clone()),
            code: body.code,
            id: body.id,
            stack: body.stack,
        },
        Err(_) => {
            warn!(status, "Relay answered without Bare headers or error body");
            RelayError::InvalidResponse(format!("relay answered {status} without a Bare response"))
        }
    }
}

/// Serializes headers into the `x-bare-headers` JSON object.
///
/// Repeated headers become arrays.
pub fn encode_headers(headers: &HeaderMap) -> String {
    let mut object = Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let value = if values.len() == 1 {
            values.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(values)
        };
        object.insert(name.as_str().to_string(), value);
    }
    Value::Object(object).to_string()
}

/// Parses an `x-bare-headers` JSON object into a header map.
///
/// Names or values that are not valid HTTP are dropped.
pub fn decode_headers(raw: &str) -> Result<HeaderMap> {
    let object: Map<String, Value> = serde_json::from_str(raw)
        .map_err(|e| RelayError::InvalidResponse(format!("x-bare-headers is not an object: {e}")))?;
    let mut headers = HeaderMap::new();
    for (name, value) in object {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(name = %name, "Dropping invalid upstream header name");
            continue;
        };
        let values = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for value in values {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&text) {
                headers.append(name.clone(), value);
            }
        }
    }
    Ok(headers)
}

/// Splits a long value into `<name>-N` parts, each prefixed with `;`.
pub fn split_header_value(name: &str, value: &str) -> Vec<(String, String)> {
    if value.len() <= MAX_HEADER_VALUE {
        return vec![(name.to_string(), value.to_string())];
    }
    let mut parts = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let mut cut = rest.len().min(MAX_HEADER_VALUE);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        parts.push((format!("{name}-{}", parts.len()), format!(";{chunk}")));
        rest = tail;
    }
    parts
}

/// Reassembles a value that may have been split by [`split_header_value`].
pub fn join_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    if let Some(value) = headers.get(name) {
        return Some(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let mut joined = String::new();
    let mut index = 0;
    while let Some(part) = headers.get(format!("{name}-{index}").as_str()) {
        let part = String::from_utf8_lossy(part.as_bytes());
        joined.push_str(part.strip_prefix(';').unwrap_or(&part));
        index += 1;
    }
    (index > 0).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_encode_repeated_values_as_arrays() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let json: Value = serde_json::from_str(&encode_headers(&headers)).unwrap();
        assert_eq!(json["accept"], "text/html");
        assert_eq!(json["x-multi"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn decode_keeps_repeated_set_cookie() {
        let raw = r#"{"content-type":"text/html","set-cookie":["a=1","b=2"],"bad name":"x"}"#;
        let headers = decode_headers(raw).unwrap();
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn decode_rejects_non_object() {
        assert!(matches!(
            decode_headers("[1,2]"),
            Err(RelayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn short_values_are_not_split() {
        let parts = split_header_value(BARE_HEADERS, "{}");
        assert_eq!(parts, vec![(BARE_HEADERS.to_string(), "{}".to_string())]);
    }

    #[test]
    fn long_values_split_and_join() {
        let value = format!("{{\"x\":\"{}\"}}", "v".repeat(MAX_HEADER_VALUE * 2));
        let parts = split_header_value(BARE_HEADERS, &value);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].0, "x-bare-headers-1");
        assert!(parts.iter().all(|(_, v)| v.starts_with(';')));

        let mut headers = HeaderMap::new();
        for (name, part) in parts {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(&part).unwrap(),
            );
        }
        assert_eq!(join_header_value(&headers, BARE_HEADERS).unwrap(), value);
    }

    #[test]
    fn missing_header_joins_to_none() {
        assert!(join_header_value(&HeaderMap::new(), BARE_HEADERS).is_none());
    }

    #[test]
    fn error_body_classification() {
        let host = classify_error(
            500,
            r#"{"code":"UNKNOWN","id":"error.Error","message":"The specified host could not be resolved."}"#,
        );
        assert!(matches!(host, RelayError::HostNotFound { status: Some(500) }));

        let bare = classify_error(
            400,
            r#"{"code":"INVALID_BARE_HEADER","id":"request.headers.x-bare-url","message":"Invalid URL"}"#,
        );
        match bare {
            RelayError::Bare { status, code, id, .. } => {
                assert_eq!(status, 400);
                assert_eq!(code, "INVALID_BARE_HEADER");
                assert_eq!(id.as_deref(), Some("request.headers.x-bare-url"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            classify_error(502, "<html>bad gateway</html>"),
            RelayError::InvalidResponse(_)
        ));
    }

    /// Serves every connection with a Bare-wrapped redirect and records the
    /// request heads it saw.
    async fn redirecting_relay() -> (Url, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                log.lock().unwrap().push(String::from_utf8_lossy(&buf).into_owned());
                let response = "HTTP/1.1 200 OK\r\n\
                    x-bare-status: 302\r\n\
                    x-bare-status-text: Found\r\n\
                    x-bare-headers: {\"location\":\"https://evil.test/steal\"}\r\n\
                    content-length: 0\r\n\
                    connection: close\r\n\r\n";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), seen)
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let (endpoint, seen) = redirecting_relay().await;
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("session=bank-secret"));
        let request = InterceptedRequest {
            method: Method::GET,
            url: Url::parse("https://bank.test/img.png").unwrap(),
            headers,
            body: None,
            credentials: umbra_core::message::CredentialsMode::Omit,
            cache: CacheMode::Default,
            redirect: umbra_core::message::RedirectMode::Follow,
            mode: umbra_core::message::RequestMode::NoCors,
            destination: umbra_core::DestinationKind::Other,
        };

        let response = BareClient::new().unwrap().fetch(&endpoint, &request).await.unwrap();
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.headers["location"], "https://evil.test/steal");
        assert_eq!(response.final_url.as_str(), "https://bank.test/img.png");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("GET /v3/ "));
        assert!(seen[0].contains("x-bare-url: https://bank.test/img.png"));
        assert!(!seen.iter().any(|head| head.contains("evil.test")));
    }

    #[test]
    fn client_builds() {
        assert!(BareClient::with_timeout(Duration::from_secs(1)).is_ok());
    }
}
