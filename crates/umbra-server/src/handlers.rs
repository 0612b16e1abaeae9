//! Route handlers.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;
use umbra_core::{ProxyError, ResponseBody};
use umbra_proxy::{ClientMessage, RequestOrResponse};
use url::Url;

use crate::error::{ApiError, Result};
use crate::models::{AddressQuery, AddressResponse};
use crate::state::AppState;

/// Largest request body forwarded to the relay.
pub const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Any request not matched by another route.
///
/// Requests under the relay prefix go through the interceptor; everything
/// else is a 404.
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            let error = ProxyError::internal("RequestBodyError", e.to_string());
            return into_response(state.interceptor.reject(&parts, error));
        }
    };

    match state
        .interceptor
        .handle(axum::http::Request::from_parts(parts, body))
        .await
    {
        RequestOrResponse::Response(response) => into_response(response),
        RequestOrResponse::Request(req) => {
            ApiError::NotFound(req.uri().path().to_string()).into_response()
        }
    }
}

fn into_response(response: axum::http::Response<ResponseBody>) -> Response {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, into_body(body))
}

fn into_body(body: ResponseBody) -> Body {
    match body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Bytes(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    }
}

const BUNDLE_SCRIPT: &str = include_str!("../assets/umbra.bundle.js");
const CLIENT_SCRIPT: &str = include_str!("../assets/umbra.client.js");
const HANDLER_SCRIPT: &str = include_str!("../assets/umbra.handler.js");

fn javascript(source: impl Into<Body>) -> Response {
    (
        [(CONTENT_TYPE, "application/javascript; charset=utf-8")],
        source.into(),
    )
        .into_response()
}

/// GET config script - `self.__umbra$config = {...};`
pub async fn config_script(State(state): State<AppState>) -> Response {
    javascript(state.config.config_script())
}

/// GET bundle script - URL codecs and address helpers.
pub async fn bundle_script() -> Response {
    javascript(BUNDLE_SCRIPT)
}

/// GET client script - request hooks.
pub async fn client_script() -> Response {
    javascript(CLIENT_SCRIPT)
}

/// GET handler script - runtime entry point.
pub async fn handler_script() -> Response {
    javascript(HANDLER_SCRIPT)
}

/// GET /umbra/encode - Relay address for a destination URL.
pub async fn encode(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> Result<Json<AddressResponse>> {
    let url = Url::parse(&query.url)
        .map_err(|e| ApiError::BadRequest(format!("invalid URL {}: {e}", query.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::BadRequest(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }

    let proxied = state.config.encode_url(&url);
    debug!(url = %url, proxied = %proxied, "Encoded address");
    Ok(Json(AddressResponse {
        url: url.to_string(),
        proxied,
    }))
}

/// GET /umbra/decode - Destination URL for a relay address.
pub async fn decode(
    State(state): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> Result<Json<AddressResponse>> {
    let url = state.config.decode_url(&query.url)?;
    Ok(Json(AddressResponse {
        url: url.to_string(),
        proxied: query.url,
    }))
}

/// GET /umbra/events - Server-sent stream of client notifications.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.interceptor.notifier().subscribe()).filter_map(
        |message| match message {
            Ok(message) => Some(Ok(to_event(&message))),
            Err(e) => {
                debug!(error = %e, "Event subscriber lagged");
                None
            }
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event(message: &ClientMessage) -> Event {
    let name = match message {
        ClientMessage::CookiesUpdated { .. } => "cookies-updated",
    };
    let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}
