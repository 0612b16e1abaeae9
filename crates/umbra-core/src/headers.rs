//! Header sanitization.
//!
//! `http::HeaderMap` keys are always lower-case, so every lookup here is
//! case-insensitive and independent of insertion order.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::url_rewriter::{RewriteContext, UrlRewriter};

/// Response headers that would break framing or isolation under the relay.
pub const SECURITY_HEADERS: &[&str] = &[
    "cross-origin-embedder-policy",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
    "content-security-policy",
    "content-security-policy-report-only",
    "expect-ct",
    "feature-policy",
    "origin-isolation",
    "strict-transport-security",
    "upgrade-insecure-requests",
    "x-content-type-options",
    "x-download-options",
    "x-frame-options",
    "x-permitted-cross-domain-policies",
    "x-powered-by",
    "x-xss-protection",
];

/// Connection-scoped headers never forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static HAS_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*?((inline|attachment);\s*?)filename=").expect("valid regex")
});

static IS_ATTACHMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*?attachment").expect("valid regex"));

/// Removes every header in [`SECURITY_HEADERS`]. Other entries are untouched.
pub fn strip_security_headers(headers: &mut HeaderMap) {
    for name in SECURITY_HEADERS {
        headers.remove(*name);
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Cleans headers of an outbound request before it reaches the relay.
///
/// The relay origin's own cookies never leave the relay; the jar supplies
/// the destination's cookies instead.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    for name in [
        http::header::HOST,
        http::header::CONTENT_LENGTH,
        http::header::COOKIE,
        http::header::REFERER,
        http::header::ORIGIN,
    ] {
        headers.remove(name);
    }
}

/// Rewrites `Location` so redirects stay inside the relay.
pub fn rewrite_location(headers: &mut HeaderMap, rewriter: &UrlRewriter, ctx: &RewriteContext) {
    let Some(location) = headers
        .get(http::header::LOCATION)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };
    let rewritten = rewriter.rewrite_against(location, ctx.current());
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(http::header::LOCATION, value);
    }
}

/// Synthesizes a `filename=` parameter from the final URL when missing,
/// keeping the original disposition type.
pub fn apply_content_disposition(headers: &mut HeaderMap, final_url: &Url) {
    let current = headers
        .get(http::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if HAS_FILENAME.is_match(current) {
        return;
    }
    let kind = if IS_ATTACHMENT.is_match(current) {
        "attachment"
    } else {
        "inline"
    };
    let filename = final_url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let quoted = serde_json::to_string(filename).unwrap_or_else(|_| "\"\"".to_string());
    if let Ok(value) = HeaderValue::from_str(&format!("{kind}; filename={quoted}")) {
        headers.insert(http::header::CONTENT_DISPOSITION, value);
    }
}

/// Applies the response-side header policy in one pass.
pub fn sanitize_response_headers(
    headers: &mut HeaderMap,
    rewriter: &UrlRewriter,
    ctx: &RewriteContext,
    cross_origin_isolated: bool,
) {
    strip_hop_by_hop(headers);
    strip_security_headers(headers);
    rewrite_location(headers, rewriter, ctx);
    if cross_origin_isolated {
        headers.insert(
            "cross-origin-embedder-policy",
            HeaderValue::from_static("require-corp"),
        );
    }
}
