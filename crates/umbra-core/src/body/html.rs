//! HTML rewriting.
//!
//! A tokenizing pass over tags, comments and raw-text elements. Only
//! attributes that carry URLs are re-serialized; everything else is copied
//! through byte for byte.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::bootstrap::BOOTSTRAP_MARKER;
use super::{css, js};
use crate::url_rewriter::{RewriteContext, UrlRewriter};

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<!--.*?-->|<![^>]*>|</[a-zA-Z][^>]*>|<[a-zA-Z][\w:-]*(?:\s+[^\s"'>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'>]+))?)*\s*/?>"#,
    )
    .expect("valid regex")
});

static TAG_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<([a-zA-Z][\w:-]*)").expect("valid regex"));

static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("valid regex")
});

static SCRIPT_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</script\s*>").expect("valid regex"));
static STYLE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</style\s*>").expect("valid regex"));

static REFRESH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^(\s*\d*\s*[;,]\s*url\s*=\s*['"]?)([^'"]*)(['"]?.*)$"#).expect("valid regex"));

static HEAD_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^<head[\s>/]").expect("valid regex"));
static HTML_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^<html[\s>/]").expect("valid regex"));

/// Attributes holding a single URL.
const URL_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "action",
    "formaction",
    "poster",
    "background",
    "data",
    "cite",
    "longdesc",
    "manifest",
    "icon",
    "xlink:href",
];

/// Attributes holding candidate lists.
const SRCSET_ATTRIBUTES: &[&str] = &["srcset", "imagesrcset"];

/// Attributes renamed so the browser ignores them.
const NEUTRALIZED_ATTRIBUTES: &[&str] = &["integrity", "nonce"];

struct Attribute<'a> {
    raw: &'a str,
    name: &'a str,
    value: Option<&'a str>,
}

fn parse_attributes(tag_body: &str) -> Vec<Attribute<'_>> {
    ATTR.captures_iter(tag_body)
        .filter_map(|caps| {
            let raw = caps.get(0)?.as_str();
            let name = caps.get(1)?.as_str();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str());
            Some(Attribute { raw, name, value })
        })
        .collect()
}

fn attr_value<'a>(attrs: &'a [Attribute<'a>], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(name))
        .and_then(|a| a.value)
}

fn push_attribute(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&html_escape::encode_double_quoted_attribute(value));
    out.push('"');
}

enum RawText {
    None,
    Script { rewrite: bool },
    Style,
}

/// Whether a `<script type=...>` holds JavaScript.
fn is_javascript_type(kind: Option<&str>) -> bool {
    match kind.map(|k| k.trim().to_ascii_lowercase()) {
        None => true,
        Some(k) => matches!(
            k.as_str(),
            "" | "module" | "text/javascript" | "application/javascript" | "text/ecmascript"
        ),
    }
}

/// Rewrites one start tag. Returns `None` when the tag must be dropped.
fn rewrite_start_tag(
    tag: &str,
    rewriter: &UrlRewriter,
    ctx: &RewriteContext,
) -> Option<(String, RawText)> {
    let name = TAG_NAME.captures(tag)?.get(1)?.as_str();
    let lower = name.to_ascii_lowercase();
    let self_closing = tag.trim_end_matches('>').trim_end().ends_with('/');
    let body_start = 1 + name.len();
    let body_end = tag.len() - if self_closing { 2 } else { 1 };
    let body = tag.get(body_start..body_end.max(body_start)).unwrap_or("");
    let attrs = parse_attributes(body);

    let http_equiv = attr_value(&attrs, "http-equiv").map(|v| v.trim().to_ascii_lowercase());
    if lower == "meta" && http_equiv.as_deref().is_some_and(|v| v.starts_with("content-security-policy")) {
        return None;
    }

    let mut out = String::with_capacity(tag.len() + 32);
    out.push('<');
    out.push_str(name);
    for attr in &attrs {
        let attr_name = attr.name.to_ascii_lowercase();
        let decoded = attr.value.map(|v| html_escape::decode_html_entities(v).into_owned());
        match (attr_name.as_str(), decoded) {
            (n, Some(value)) if URL_ATTRIBUTES.contains(&n) => {
                push_attribute(&mut out, attr.name, &rewriter.rewrite_url(&value, ctx));
            }
            (n, Some(value)) if SRCSET_ATTRIBUTES.contains(&n) => {
                push_attribute(&mut out, attr.name, &rewriter.rewrite_srcset(&value, ctx));
            }
            ("style", Some(value)) => {
                push_attribute(&mut out, attr.name, &css::rewrite(&value, rewriter, ctx));
            }
            ("content", Some(value)) if http_equiv.as_deref() == Some("refresh") => {
                let rewritten = REFRESH_URL.replace(&value, |caps: &Captures<'_>| {
                    format!("{}{}{}", &caps[1], rewriter.rewrite_url(&caps[2], ctx), &caps[3])
                });
                push_attribute(&mut out, attr.name, &rewritten);
            }
            (n, _) if NEUTRALIZED_ATTRIBUTES.contains(&n) => {
                out.push_str(" data-umbra-");
                out.push_str(attr.raw);
            }
            _ => {
                out.push(' ');
                out.push_str(attr.raw);
            }
        }
    }
    if self_closing {
        out.push_str(" /");
    }
    out.push('>');

    let raw_text = match lower.as_str() {
        _ if self_closing => RawText::None,
        "script" => RawText::Script {
            rewrite: is_javascript_type(attr_value(&attrs, "type")),
        },
        "style" => RawText::Style,
        _ => RawText::None,
    };
    Some((out, raw_text))
}

/// Rewrites a document and injects `bootstrap` into its head.
///
/// A document that already carries the bootstrap marker is returned as-is.
pub fn rewrite(html: &str, rewriter: &UrlRewriter, ctx: &RewriteContext, bootstrap: &str) -> String {
    if html.contains(BOOTSTRAP_MARKER) {
        return html.to_string();
    }

    let mut out = String::with_capacity(html.len() + bootstrap.len() + 256);
    let mut head_insert: Option<usize> = None;
    let mut html_insert: Option<usize> = None;
    let mut pos = 0;

    while let Some(token) = TOKEN.find_at(html, pos) {
        out.push_str(&html[pos..token.start()]);
        pos = token.end();
        let text = token.as_str();

        if text.starts_with("<!") || text.starts_with("</") {
            out.push_str(text);
            continue;
        }
        let Some((tag, raw_text)) = rewrite_start_tag(text, rewriter, ctx) else {
            continue;
        };
        out.push_str(&tag);
        if head_insert.is_none() && HEAD_OPEN.is_match(text) {
            head_insert = Some(out.len());
        } else if html_insert.is_none() && HTML_OPEN.is_match(text) {
            html_insert = Some(out.len());
        }

        let end_re = match raw_text {
            RawText::None => continue,
            RawText::Script { .. } => &*SCRIPT_END,
            RawText::Style => &*STYLE_END,
        };
        let content_end = end_re.find_at(html, pos).map_or(html.len(), |m| m.start());
        let content = &html[pos..content_end];
        match raw_text {
            RawText::Script { rewrite: true } => out.push_str(&js::rewrite(content, rewriter, ctx)),
            RawText::Style => out.push_str(&css::rewrite(content, rewriter, ctx)),
            _ => out.push_str(content),
        }
        pos = content_end;
    }
    out.push_str(&html[pos..]);

    match head_insert.or(html_insert) {
        Some(at) => out.insert_str(at, bootstrap),
        None => out.insert_str(0, bootstrap),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::codec::UrlCodec;
    use url::Url;

    const BOOT: &str = "<script data-umbra-bootstrap>self.__umbra$bootstrap = {};</script>";

    fn setup(codec: UrlCodec) -> (UrlRewriter, RewriteContext) {
        (
            UrlRewriter::new(ProxyConfig::default().with_codec(codec).into_store()),
            RewriteContext::new(
                Url::parse("http://relay.local/").unwrap(),
                Url::parse("https://origin/page").unwrap(),
            ),
        )
    }

    fn img_src(html: &str) -> String {
        let re = Regex::new(r#"<img src="([^"]*)""#).unwrap();
        re.captures(html).unwrap()[1].to_string()
    }

    #[test]
    fn rewrites_img_and_injects_once() {
        let (rw, ctx) = setup(UrlCodec::Xor);
        let doc = r#"<html><head></head><body><img src="/a.png"></body></html>"#;

        let once = rewrite(doc, &rw, &ctx, BOOT);
        let src = html_escape::decode_html_entities(&img_src(&once)).into_owned();
        let decoded = rw.decode(&src, ctx.client_origin()).unwrap();
        assert_eq!(decoded.as_str(), "https://origin/a.png");
        assert!(once.starts_with(&format!("<html><head>{BOOT}</head>")));

        let twice = rewrite(&once, &rw, &ctx, BOOT);
        assert_eq!(twice, once);
        assert_eq!(twice.matches(BOOTSTRAP_MARKER).count(), 1);
    }

    #[test]
    fn injects_without_head() {
        let (rw, ctx) = setup(UrlCodec::None);
        assert_eq!(
            rewrite("<html><body>x</body></html>", &rw, &ctx, BOOT),
            format!("<html>{BOOT}<body>x</body></html>")
        );
        assert_eq!(rewrite("plain", &rw, &ctx, BOOT), format!("{BOOT}plain"));
    }

    #[test]
    fn rewrites_url_attributes_and_keeps_others() {
        let (rw, ctx) = setup(UrlCodec::None);
        let doc = r#"<a href='/x' class=nav data-id="7">go</a><form action="submit"></form>"#;
        let out = rewrite(doc, &rw, &ctx, "");
        assert_eq!(
            out,
            r#"<a href="/service/https://origin/x" class=nav data-id="7">go</a><form action="/service/https://origin/submit"></form>"#
        );
    }

    #[test]
    fn rewrites_srcset_and_style() {
        let (rw, ctx) = setup(UrlCodec::None);
        let doc = r#"<img srcset="a.png 1x, b.png 2x" style="background:url(c.png)">"#;
        let out = rewrite(doc, &rw, &ctx, "");
        assert!(out.contains(r#"srcset="/service/https://origin/a.png 1x, /service/https://origin/b.png 2x""#));
        assert!(out.contains(r#"style="background:url(/service/https://origin/c.png)""#));
    }

    #[test]
    fn neutralizes_integrity_and_drops_csp_meta() {
        let (rw, ctx) = setup(UrlCodec::None);
        let doc = r#"<meta http-equiv="Content-Security-Policy" content="default-src 'self'"><script src="/s.js" integrity="sha384-abc"></script>"#;
        let out = rewrite(doc, &rw, &ctx, "");
        assert!(!out.to_ascii_lowercase().contains("content-security-policy"));
        assert!(out.contains(r#"data-umbra-integrity="sha384-abc""#));
        assert!(out.contains(r#"src="/service/https://origin/s.js""#));
    }

    #[test]
    fn rewrites_meta_refresh() {
        let (rw, ctx) = setup(UrlCodec::None);
        let out = rewrite(
            r#"<meta http-equiv="refresh" content="5; url=/next">"#,
            &rw,
            &ctx,
            "",
        );
        assert!(out.contains(r#"content="5; url=/service/https://origin/next""#));
    }

    #[test]
    fn rewrites_inline_style_and_module_scripts() {
        let (rw, ctx) = setup(UrlCodec::None);
        let doc = concat!(
            "<style>@import 'theme.css';</style>",
            "<script type=\"module\">import x from './x.js';</script>",
            "<script type=\"application/json\">{\"u\": \"./x.js\"}</script>",
        );
        let out = rewrite(doc, &rw, &ctx, "");
        assert!(out.contains("@import '/service/https://origin/theme.css'"));
        assert!(out.contains("from '/service/https://origin/x.js'"));
        assert!(out.contains("{\"u\": \"./x.js\"}"));
    }

    #[test]
    fn comments_and_entities_survive() {
        let (rw, ctx) = setup(UrlCodec::None);
        let doc = r#"<!-- <img src="/hidden.png"> --><a href="/q?a=1&amp;b=2">q</a>"#;
        let out = rewrite(doc, &rw, &ctx, "");
        assert!(out.starts_with(r#"<!-- <img src="/hidden.png"> -->"#));
        assert!(out.contains(r#"href="/service/https://origin/q?a=1&amp;b=2""#));
    }
}
