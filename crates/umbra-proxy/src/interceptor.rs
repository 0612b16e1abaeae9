//! Request interception pipeline.
//!
//! Inbound requests under the relay prefix are decoded, prepared with the
//! destination's cookies, dispatched through a relay endpoint, and their
//! responses sanitized and rewritten before returning to the client. Any
//! failure along the way ends here and is rendered by [`ErrorPageRenderer`].
//!
//! ```text
//! Request → Under prefix? ── No ──→ PassThrough
//!               │ Yes
//!               ▼
//!           Preparing ── hook "request" replaced ──→ Responding
//!               │
//!               ▼
//!          Dispatching ── relay error ──→ Failed (error page / bare status)
//!               │
//!               ▼
//!        PostProcessing ── hook "beforemod"/"response" replaced ──→ Responding
//!               │
//!               ▼
//!           Responding
//! ```

use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION,
    ORIGIN, REFERER, SET_COOKIE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{debug, error, info, warn};
use umbra_core::config::DEFAULT_RELAY_ENDPOINT;
use umbra_core::headers::{apply_content_disposition, sanitize_request_headers, sanitize_response_headers};
use umbra_core::message::{CacheMode, CredentialsMode, RedirectMode, RequestMode};
use umbra_core::{
    BodyRewriter, Bootstrap, ConfigStore, DestinationKind, ErrorPageRenderer, HookEvent,
    HookPoint, HookRegistry, InterceptedRequest, InterceptedResponse, Interception, ProxyError,
    ResponseBody, RewriteContext, UrlRewriter,
};
use url::Url;

use crate::cookie_jar::CookieJar;
use crate::endpoints::{resolve_endpoint, select_endpoint};
use crate::notify::CookieNotifier;
use crate::relay::{RelayClient, RelayResponse};

/// Redirects followed for `RedirectMode::Follow` before giving up.
pub const MAX_REDIRECTS: usize = 20;

/// Outcome of [`RequestInterceptor::handle`].
#[derive(Debug)]
pub enum RequestOrResponse {
    /// The request is not ours; forward it unchanged.
    Request(http::Request<Bytes>),
    /// The response to send to the client.
    Response(http::Response<ResponseBody>),
}

/// Pipeline states, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptState {
    PassThrough,
    Preparing,
    Dispatching,
    PostProcessing,
    Responding,
    Failed,
}

/// A pipeline failure and the URL it happened on.
struct Failure {
    error: ProxyError,
    url: String,
}

/// Intercepts relay requests and produces client responses.
pub struct RequestInterceptor {
    config: ConfigStore,
    rewriter: UrlRewriter,
    body_rewriter: BodyRewriter,
    relay: Arc<dyn RelayClient>,
    endpoint: String,
    jar: Arc<CookieJar>,
    notifier: CookieNotifier,
    hooks: HookRegistry,
}

impl std::fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("prefix", &self.config.prefix)
            .field("endpoint", &self.endpoint)
            .field("relay", &"RelayClient")
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl RequestInterceptor {
    /// Creates an interceptor, choosing one relay endpoint at random.
    pub fn new(
        config: ConfigStore,
        relay: Arc<dyn RelayClient>,
        jar: Arc<CookieJar>,
        notifier: CookieNotifier,
    ) -> Self {
        let endpoint = select_endpoint(&config.relay_endpoints)
            .unwrap_or(DEFAULT_RELAY_ENDPOINT)
            .to_string();
        info!(endpoint = %endpoint, "Relay endpoint selected");

        let rewriter = UrlRewriter::new(Arc::clone(&config));
        Self {
            body_rewriter: BodyRewriter::new(rewriter.clone()),
            rewriter,
            config,
            relay,
            endpoint,
            jar,
            notifier,
            hooks: HookRegistry::new(),
        }
    }

    /// Pins the relay endpoint instead of the random choice.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Adds a subscriber that runs before dispatch.
    pub fn on_request<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> Interception + Send + Sync + 'static,
    {
        self.hooks.subscribe(HookPoint::Request, name, callback);
        self
    }

    /// Adds a subscriber that sees the upstream response before rewriting.
    pub fn on_before_mod<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> Interception + Send + Sync + 'static,
    {
        self.hooks.subscribe(HookPoint::BeforeMod, name, callback);
        self
    }

    /// Adds a subscriber that sees the final response.
    pub fn on_response<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> Interception + Send + Sync + 'static,
    {
        self.hooks.subscribe(HookPoint::Response, name, callback);
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn rewriter(&self) -> &UrlRewriter {
        &self.rewriter
    }

    /// Relay endpoint chosen for this interceptor, possibly relative.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    pub fn notifier(&self) -> &CookieNotifier {
        &self.notifier
    }

    /// Origin the client sees the relay on.
    ///
    /// Uses the configured public origin, otherwise the `Host` header and
    /// `x-forwarded-proto`.
    pub fn client_origin<B>(&self, req: &http::Request<B>) -> Result<Url, ProxyError> {
        self.origin_from(req.headers(), req.uri())
    }

    fn origin_from(&self, headers: &HeaderMap, uri: &http::Uri) -> Result<Url, ProxyError> {
        if let Some(origin) = &self.config.public_origin {
            return Url::parse(origin)
                .map_err(|e| ProxyError::internal("InvalidOrigin", format!("{origin}: {e}")));
        }

        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))
            .unwrap_or("localhost");
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .or_else(|| uri.scheme_str())
            .unwrap_or("http");

        Url::parse(&format!("{scheme}://{host}/"))
            .map_err(|e| ProxyError::internal("InvalidOrigin", format!("{scheme}://{host}: {e}")))
    }

    /// Runs one inbound request through the pipeline.
    pub async fn handle(&self, req: http::Request<Bytes>) -> RequestOrResponse {
        if !self.config.is_proxied_path(req.uri().path()) {
            debug!(state = ?InterceptState::PassThrough, uri = %req.uri(), "Request outside relay prefix");
            return RequestOrResponse::Request(req);
        }

        let destination = DestinationKind::from_headers(req.headers());
        let client_origin = match self.client_origin(&req) {
            Ok(origin) => origin,
            Err(error) => {
                error!(state = ?InterceptState::Failed, error = %error, "Cannot determine client origin");
                let url = req.uri().to_string();
                return RequestOrResponse::Response(self.render_failure(&error, &url, destination, None));
            }
        };

        match self.process(req, &client_origin, destination).await {
            Ok(response) => {
                debug!(
                    state = ?InterceptState::Responding,
                    status = %response.status,
                    destination = %destination,
                    "Responding"
                );
                RequestOrResponse::Response(response.into_http())
            }
            Err(Failure { error, url }) => {
                error!(
                    state = ?InterceptState::Failed,
                    url = %url,
                    destination = %destination,
                    error = %error,
                    "Relay request failed"
                );
                RequestOrResponse::Response(self.render_failure(
                    &error,
                    &url,
                    destination,
                    Some(&client_origin),
                ))
            }
        }
    }

    /// Renders a failure raised before the pipeline could run, such as an
    /// unreadable request body.
    pub fn reject(
        &self,
        parts: &http::request::Parts,
        error: ProxyError,
    ) -> http::Response<ResponseBody> {
        let destination = DestinationKind::from_headers(&parts.headers);
        let client_origin = self.origin_from(&parts.headers, &parts.uri).ok();
        let url = client_origin
            .as_ref()
            .and_then(|origin| self.rewriter.decode(&parts.uri.to_string(), origin).ok())
            .map_or_else(|| parts.uri.to_string(), |url| url.to_string());

        error!(
            state = ?InterceptState::Failed,
            url = %url,
            destination = %destination,
            error = %error,
            "Request rejected"
        );
        self.render_failure(&error, &url, destination, client_origin.as_ref())
    }

    fn render_failure(
        &self,
        error: &ProxyError,
        url: &str,
        destination: DestinationKind,
        client_origin: Option<&Url>,
    ) -> http::Response<ResponseBody> {
        let relay = client_origin
            .and_then(|origin| resolve_endpoint(&self.endpoint, origin).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| self.endpoint.clone());
        let relay_host = Url::parse(&relay)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        ErrorPageRenderer::new(relay, relay_host)
            .render(error, url, destination)
            .into_http()
    }

    async fn process(
        &self,
        req: http::Request<Bytes>,
        client_origin: &Url,
        destination: DestinationKind,
    ) -> Result<InterceptedResponse, Failure> {
        let (parts, body) = req.into_parts();
        let proxied = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path(), |pq| pq.as_str())
            .to_string();

        let url = self
            .rewriter
            .decode(&proxied, client_origin)
            .map_err(|error| Failure {
                error,
                url: proxied.clone(),
            })?;
        let failed_url = url.to_string();
        let fail = |error: ProxyError| Failure {
            error,
            url: failed_url.clone(),
        };

        if let Some(construct) = &self.config.construct {
            construct(&self.rewriter);
        }
        debug!(state = ?InterceptState::Preparing, url = %url, destination = %destination, "Preparing request");

        // Request preparation
        let referrer = parts
            .headers
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(|r| self.rewriter.decode(r, client_origin).ok());
        let mode = RequestMode::from_headers(&parts.headers);
        let cache = CacheMode::from_headers(&parts.headers);
        let had_origin = parts.headers.contains_key(ORIGIN);
        let wants_event_stream = parts
            .headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/event-stream"));

        let mut headers = parts.headers;
        sanitize_request_headers(&mut headers);
        if destination != DestinationKind::Other {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }

        let top_level = destination == DestinationKind::Document
            && matches!(parts.method, Method::GET | Method::HEAD | Method::OPTIONS);
        let mut ctx = RewriteContext::new(client_origin.clone(), url.clone())
            .with_referrer(referrer.clone())
            .with_navigation(top_level);

        if let Some(referrer) = &referrer {
            if let Ok(value) = HeaderValue::from_str(referrer.as_str()) {
                headers.insert(REFERER, value);
            }
            let cross_origin = referrer.origin() != url.origin();
            if had_origin || (mode == RequestMode::Cors && cross_origin) {
                if let Ok(value) = HeaderValue::from_str(&referrer.origin().ascii_serialization()) {
                    headers.insert(ORIGIN, value);
                }
            }
        }

        self.attach_cookies(&mut headers, &ctx).await.map_err(&fail)?;

        let body = InterceptedRequest::method_has_body(&parts.method).then_some(body);
        let mut request = InterceptedRequest {
            method: parts.method,
            url: url.clone(),
            headers,
            body,
            credentials: CredentialsMode::Omit,
            cache,
            redirect: RedirectMode::for_destination(destination),
            mode,
            destination,
        };

        if let Interception::Replaced(response) = self.hooks.dispatch(
            HookPoint::Request,
            &HookEvent::Request {
                request: &request,
                ctx: &ctx,
            },
        ) {
            return Ok(response);
        }

        // Dispatch
        let endpoint = resolve_endpoint(&self.endpoint, client_origin)
            .map_err(|e| fail(ProxyError::internal("InvalidEndpoint", e.to_string())))?;
        let upstream = self
            .dispatch(&endpoint, &mut request, &mut ctx)
            .await
            .map_err(&fail)?;

        // Post-processing
        if &upstream.final_url != ctx.current() {
            ctx.advance(upstream.final_url.clone());
        }
        let mut response = InterceptedResponse {
            status: upstream.status,
            status_text: upstream.status_text,
            headers: upstream.headers,
            body: upstream.body,
        };
        debug!(
            state = ?InterceptState::PostProcessing,
            status = %response.status,
            url = %ctx.current(),
            "Processing upstream response"
        );

        if let Interception::Replaced(replacement) = self.hooks.dispatch(
            HookPoint::BeforeMod,
            &HookEvent::Response {
                request: &request,
                response: &response,
                ctx: &ctx,
            },
        ) {
            return Ok(replacement);
        }

        sanitize_response_headers(
            &mut response.headers,
            &self.rewriter,
            &ctx,
            self.config.cross_origin_isolated,
        );
        if destination == DestinationKind::Document {
            apply_content_disposition(&mut response.headers, ctx.current());
        }

        self.ingest_set_cookies(&mut response.headers, &ctx)
            .await
            .map_err(&fail)?;

        let content_type = response.header(CONTENT_TYPE.as_str()).map(str::to_string);
        let has_body = request.method != Method::HEAD
            && !response.status.is_redirection()
            && response.status != StatusCode::NO_CONTENT;
        if has_body
            && self
                .body_rewriter
                .needs_body(destination, content_type.as_deref(), ctx.current())
        {
            let raw = std::mem::replace(&mut response.body, ResponseBody::Empty)
                .collect()
                .await
                .map_err(|e| fail(ProxyError::internal("BodyReadError", e.to_string())))?;

            let mut bootstrap = Bootstrap::new(&self.config, endpoint.as_str());
            if destination.is_navigation() {
                let cookies = self.jar.serialize(&ctx, true).await.map_err(&fail)?;
                bootstrap = bootstrap
                    .with_cookies(cookies)
                    .with_referrer(referrer.as_ref().map(Url::to_string));
            }

            let rewritten = self.body_rewriter.rewrite_or_passthrough(
                destination,
                raw,
                content_type.as_deref(),
                &ctx,
                &bootstrap,
            );
            response.headers.remove(CONTENT_LENGTH);
            response.body = ResponseBody::Bytes(rewritten);
        }

        if wants_event_stream {
            response
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        }

        if let Interception::Replaced(replacement) = self.hooks.dispatch(
            HookPoint::Response,
            &HookEvent::Response {
                request: &request,
                response: &response,
                ctx: &ctx,
            },
        ) {
            return Ok(replacement);
        }

        Ok(response)
    }

    /// Sends `request` through the relay, following redirects in
    /// [`RedirectMode::Follow`].
    ///
    /// Every hop gets the jar's cookies for its own URL and has its
    /// `Set-Cookie` headers ingested. Crossing origins drops
    /// `authorization` and taints `origin` to `null`.
    async fn dispatch(
        &self,
        endpoint: &Url,
        request: &mut InterceptedRequest,
        ctx: &mut RewriteContext,
    ) -> Result<RelayResponse, ProxyError> {
        for _ in 0..=MAX_REDIRECTS {
            debug!(state = ?InterceptState::Dispatching, endpoint = %endpoint, url = %request.url, "Dispatching to relay");
            let mut upstream = self.relay.fetch(endpoint, request).await?;

            if request.redirect == RedirectMode::Manual || !is_redirect(upstream.status) {
                return Ok(upstream);
            }
            let Some(location) = upstream
                .headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(upstream);
            };
            if request.redirect == RedirectMode::Error {
                return Err(ProxyError::internal(
                    "UnexpectedRedirect",
                    format!("{} redirected to {location}", request.url),
                ));
            }

            let next = request.url.join(&location).map_err(|e| {
                ProxyError::internal("InvalidRedirect", format!("{location}: {e}"))
            })?;
            self.ingest_set_cookies(&mut upstream.headers, ctx).await?;

            if upstream.status == StatusCode::SEE_OTHER
                || (matches!(upstream.status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && request.method == Method::POST)
            {
                request.method = Method::GET;
                request.body = None;
                request.headers.remove(CONTENT_TYPE);
                request.headers.remove(CONTENT_LENGTH);
            }
            if next.origin() != request.url.origin() {
                request.headers.remove(AUTHORIZATION);
                if request.headers.contains_key(ORIGIN) {
                    request.headers.insert(ORIGIN, HeaderValue::from_static("null"));
                }
            }

            debug!(from = %request.url, to = %next, status = %upstream.status, "Following redirect");
            ctx.advance(next.clone());
            request.url = next;
            self.attach_cookies(&mut request.headers, ctx).await?;
        }

        Err(ProxyError::internal(
            "TooManyRedirects",
            format!("more than {MAX_REDIRECTS} redirects"),
        ))
    }

    /// Replaces the `Cookie` header with the jar's cookies for the context's
    /// current URL.
    async fn attach_cookies(
        &self,
        headers: &mut HeaderMap,
        ctx: &RewriteContext,
    ) -> Result<(), ProxyError> {
        headers.remove(COOKIE);
        let cookie_header = self.jar.serialize(ctx, false).await?;
        if cookie_header.is_empty() {
            return Ok(());
        }
        match HeaderValue::from_str(&cookie_header) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(_) => warn!(url = %ctx.current(), "Stored cookies are not a valid header value"),
        }
        Ok(())
    }

    /// Moves `Set-Cookie` headers into the jar, notifying runtimes on change.
    async fn ingest_set_cookies(
        &self,
        headers: &mut HeaderMap,
        ctx: &RewriteContext,
    ) -> Result<(), ProxyError> {
        let set_cookies: Vec<String> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        headers.remove(SET_COOKIE);
        if set_cookies.is_empty() {
            return Ok(());
        }
        let applied = self.jar.set_cookies(&set_cookies, ctx).await?;
        if applied > 0 {
            self.notifier.notify_cookies_updated(ctx.current().as_str());
        }
        Ok(())
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}
