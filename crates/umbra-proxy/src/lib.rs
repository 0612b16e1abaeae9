//! Umbra Proxy - request interception and relay transport.
//!
//! This crate drives a request from the client to the destination and back:
//!
//! - [`RequestInterceptor`] decodes the relay address, attaches the
//!   destination's cookies, follows redirects hop by hop, runs extension
//!   hooks and routes failures to error pages
//! - [`BareClient`] performs one upstream fetch through a Bare v3 relay
//! - [`CookieJar`] stores cookies per destination over any
//!   [`umbra_core::CookieStore`]
//! - [`CookieNotifier`] broadcasts cookie changes to connected client runtimes
//!
//! ## Architecture
//!
//! ```text
//! Client Request → RequestInterceptor → Under prefix?
//!                                           │
//!                         ┌─────────────────┴─────────────────┐
//!                         │ No                                │ Yes
//!                         ▼                                   ▼
//!                    PassThrough                     Decode + Cookies + Hooks
//!                                                            │
//!                                                            ▼
//!                                                   RelayClient (Bare v3)
//!                                                            │
//!                                           ┌────────────────┴────────────────┐
//!                                           │ Ok                              │ Err
//!                                           ▼                                 ▼
//!                                Sanitize + Set-Cookie + Rewrite         Error Page
//! ```

mod bare;
mod cookie_jar;
mod endpoints;
mod error;
mod interceptor;
mod notify;
mod relay;

pub use bare::{BareClient, DEFAULT_TIMEOUT};
pub use cookie_jar::CookieJar;
pub use endpoints::{resolve_endpoint, select_endpoint, select_endpoint_with};
pub use error::{RelayError, Result, HOST_NOT_FOUND_MESSAGE};
pub use interceptor::{InterceptState, RequestInterceptor, RequestOrResponse, MAX_REDIRECTS};
pub use notify::{ClientMessage, CookieNotifier};
pub use relay::{RelayClient, RelayResponse};
