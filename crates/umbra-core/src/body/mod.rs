//! Destination-dispatched body rewriting.

pub mod bootstrap;
pub mod css;
pub mod html;
pub mod js;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub use bootstrap::{Bootstrap, BOOTSTRAP_MARKER};

use crate::message::DestinationKind;
use crate::url_rewriter::{RewriteContext, UrlRewriter};

/// A body that could not be rewritten.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("body is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// Whether a response should be treated as HTML.
///
/// Without a content type the MIME type is guessed from the URL path,
/// falling back to HTML.
pub fn is_html(content_type: Option<&str>, url: &Url) -> bool {
    let essence = match content_type {
        Some(ct) => ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase(),
        None => mime_guess::from_path(url.path())
            .first()
            .map_or_else(|| "text/html".to_string(), |m| m.essence_str().to_string()),
    };
    essence == "text/html"
}

/// Rewrites response bodies according to their destination kind.
#[derive(Debug, Clone)]
pub struct BodyRewriter {
    rewriter: UrlRewriter,
}

impl BodyRewriter {
    pub fn new(rewriter: UrlRewriter) -> Self {
        Self { rewriter }
    }

    /// Whether the body of this response needs buffering and rewriting.
    pub fn needs_body(&self, kind: DestinationKind, content_type: Option<&str>, url: &Url) -> bool {
        match kind {
            DestinationKind::Document | DestinationKind::Iframe => is_html(content_type, url),
            DestinationKind::Script | DestinationKind::Worker | DestinationKind::Style => true,
            DestinationKind::Other => false,
        }
    }

    /// Rewrites a buffered body. `None` means the body passes through.
    pub fn rewrite(
        &self,
        kind: DestinationKind,
        body: &[u8],
        content_type: Option<&str>,
        ctx: &RewriteContext,
        bootstrap: &Bootstrap,
    ) -> Result<Option<String>, RewriteError> {
        let rewritten = match kind {
            DestinationKind::Document | DestinationKind::Iframe => {
                if !is_html(content_type, ctx.current()) {
                    return Ok(None);
                }
                let text = std::str::from_utf8(body)?;
                html::rewrite(text, &self.rewriter, ctx, &bootstrap.html())
            }
            DestinationKind::Script | DestinationKind::Worker => {
                let text = std::str::from_utf8(body)?;
                if text.contains(BOOTSTRAP_MARKER) {
                    return Ok(None);
                }
                format!("{}{}", bootstrap.worker(), js::rewrite(text, &self.rewriter, ctx))
            }
            DestinationKind::Style => {
                let text = std::str::from_utf8(body)?;
                css::rewrite(text, &self.rewriter, ctx)
            }
            DestinationKind::Other => return Ok(None),
        };
        Ok(Some(rewritten))
    }

    /// Like [`BodyRewriter::rewrite`], but a failure yields the original body.
    pub fn rewrite_or_passthrough(
        &self,
        kind: DestinationKind,
        body: Bytes,
        content_type: Option<&str>,
        ctx: &RewriteContext,
        bootstrap: &Bootstrap,
    ) -> Bytes {
        match self.rewrite(kind, &body, content_type, ctx, bootstrap) {
            Ok(Some(rewritten)) => Bytes::from(rewritten),
            Ok(None) => body,
            Err(e) => {
                warn!(
                    url = %ctx.current(),
                    destination = %kind,
                    error = %e,
                    "Body rewrite failed, passing original body through"
                );
                body
            }
        }
    }
}
