//! Umbra Core - URL rewriting, cookies and error pages for the relay.
//!
//! This crate holds the synchronous logic of the Umbra web relay:
//!
//! - Configuration and the relay addressing contract (`<prefix><encode(url)>`)
//! - URL codecs
//! - URL rewriting between real and relay-addressable URLs
//! - Header sanitization
//! - Cookie parsing, scoping and serialization
//! - Body rewriting for documents, stylesheets and scripts
//! - Error pages
//! - Extension hooks
//!
//! # Example
//!
//! ```
//! use umbra_core::{ProxyConfig, UrlCodec};
//! use url::Url;
//!
//! let config = ProxyConfig::default().with_codec(UrlCodec::Base64);
//! let url = Url::parse("https://example.com/").unwrap();
//! let proxied = config.encode_url(&url);
//! assert_eq!(config.decode_url(&proxied).unwrap(), url);
//! ```

pub mod body;
pub mod codec;
pub mod config;
pub mod cookie;
pub mod error;
pub mod error_page;
pub mod headers;
pub mod hooks;
pub mod message;
pub mod url_rewriter;

pub use body::{Bootstrap, BodyRewriter};
pub use codec::UrlCodec;
pub use config::{ConfigStore, ProxyConfig, RuntimeScripts};
pub use cookie::{CookieRecord, CookieStore, MemoryCookieStore, SameSite};
pub use error::{ConfigError, ProxyError, Result};
pub use error_page::ErrorPageRenderer;
pub use hooks::{HookEvent, HookPoint, HookRegistry, Interception};
pub use message::{DestinationKind, InterceptedRequest, InterceptedResponse, ResponseBody};
pub use url_rewriter::{RewriteContext, UrlRewriter};

/// Crate version, shown in relay diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
