//! Error documents for failed navigations.
//!
//! Every interpolated value is HTML-escaped. Element ids are stable so that
//! embedding UIs can style or script the page.

use html_escape::{encode_double_quoted_attribute, encode_text};
use http::StatusCode;

use crate::error::ProxyError;
use crate::message::{DestinationKind, InterceptedResponse};

const STYLE: &str = "body{font-family:system-ui,sans-serif;margin:0;padding:48px;color:#202124;background:#fff}\
main{max-width:640px;margin:0 auto}h1{font-size:1.6em;font-weight:500}\
textarea{width:100%;min-height:8em;font-family:monospace}\
button{margin-top:16px;padding:8px 16px;border:0;border-radius:4px;background:#1a73e8;color:#fff;cursor:pointer}\
.meta{color:#5f6368}";

const RELOAD_SCRIPT: &str =
    "<script>document.getElementById(\"reload\").addEventListener(\"click\",function(){location.reload()});</script>";

/// Renders failures into client responses.
#[derive(Debug, Clone)]
pub struct ErrorPageRenderer {
    relay: String,
    relay_host: String,
}

impl ErrorPageRenderer {
    /// Creates a renderer describing the relay at `relay` (endpoint URL).
    pub fn new(relay: impl Into<String>, relay_host: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            relay_host: relay_host.into(),
        }
    }

    /// Builds the response for a failed request to `url`.
    ///
    /// Navigations get an HTML page; everything else gets a bodiless status.
    pub fn render(&self, err: &ProxyError, url: &str, kind: DestinationKind) -> InterceptedResponse {
        if !kind.is_navigation() {
            let status = match err {
                ProxyError::MalformedProxiedUrl(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return InterceptedResponse::new(status);
        }

        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let html = match err {
            ProxyError::HostResolution { .. } => self.basic_page(url),
            ProxyError::RelayProtocol {
                code,
                id,
                message,
                trace,
                ..
            } => self.detailed_page(
                "Relay Server Error",
                url,
                code,
                id.as_deref(),
                message,
                trace,
            ),
            ProxyError::MalformedProxiedUrl(detail) => self.detailed_page(
                "Invalid Address",
                url,
                "MALFORMED_PROXIED_URL",
                None,
                "The address could not be decoded.",
                detail,
            ),
            other => {
                let code = match other {
                    ProxyError::Internal { name, .. } => name.clone(),
                    _ => "CookieStoreCorruption".to_string(),
                };
                self.detailed_page(
                    "Processing Error",
                    url,
                    &code,
                    None,
                    "Internal Server Error",
                    &other.to_string(),
                )
            }
        };
        InterceptedResponse::html(status, html)
    }

    fn basic_page(&self, url: &str) -> String {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Error</title><style>{STYLE}</style></head><body><main>\
<h1 id=\"errorTitle\">This site can\u{2019}t be reached</h1>\
<p><b id=\"remoteHostname\">{host}</b>\u{2019}s server IP address could not be found.</p>\
<p class=\"meta\">Failed to load <span id=\"fetchedURL\">{url}</span></p>\
<button id=\"reload\">Reload</button></main>{RELOAD_SCRIPT}</body></html>",
            host = encode_text(&host),
            url = encode_text(url),
        )
    }

    fn detailed_page(
        &self,
        title: &str,
        url: &str,
        code: &str,
        id: Option<&str>,
        message: &str,
        trace: &str,
    ) -> String {
        let id_row = id
            .map(|id| {
                format!(
                    "<li>ID: <span id=\"errorId\">{}</span></li>",
                    encode_text(id)
                )
            })
            .unwrap_or_default();
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Error</title><style>{STYLE}</style></head><body><main>\
<h1 id=\"errorTitle\">{title}</h1>\
<p>Failed to load <b id=\"fetchedURL\">{url}</b></p>\
<p id=\"errorMessage\">{message}</p>\
<ul><li>Code: <span id=\"errorCode\">{code}</span></li>{id_row}</ul>\
<textarea id=\"errorTrace\" readonly>{trace}</textarea>\
<p class=\"meta\">Relay: <a id=\"relayServer\" href=\"{relay_href}\">{relay}</a> on <span id=\"relayHostname\">{relay_host}</span></p>\
<button id=\"reload\">Reload</button></main>{RELOAD_SCRIPT}</body></html>",
            title = encode_text(title),
            url = encode_text(url),
            message = encode_text(message),
            code = encode_text(code),
            trace = encode_text(trace),
            relay_href = encode_double_quoted_attribute(&self.relay),
            relay = encode_text(&self.relay),
            relay_host = encode_text(&self.relay_host),
        )
    }
}
