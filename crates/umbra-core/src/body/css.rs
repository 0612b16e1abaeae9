//! Stylesheet rewriting: `url(...)` and `@import` references.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::url_rewriter::{RewriteContext, UrlRewriter};

static URL_FN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).expect("valid regex")
});

static IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

/// Rewrites every URL reference in a stylesheet; other text is unchanged.
pub fn rewrite(css: &str, rewriter: &UrlRewriter, ctx: &RewriteContext) -> String {
    let css = URL_FN.replace_all(css, |caps: &Captures<'_>| {
        let (quote, url) = quoted(caps);
        let rewritten = escape(&rewriter.rewrite_url(url, ctx), quote);
        format!("url({quote}{rewritten}{quote})")
    });
    IMPORT
        .replace_all(&css, |caps: &Captures<'_>| {
            let (quote, url) = quoted(caps);
            let rewritten = escape(&rewriter.rewrite_url(url, ctx), quote);
            format!("@import {quote}{rewritten}{quote}")
        })
        .into_owned()
}

/// Backslash-escapes whatever would end a quoted string or an unquoted
/// `url(` token.
fn escape(url: &str, quote: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        let special = match quote {
            "" => matches!(c, '(' | ')' | '\'' | '"' | '\\') || c.is_whitespace(),
            _ => c == '\\' || quote.starts_with(c),
        };
        if c == '\n' {
            out.push_str("\\a ");
            continue;
        }
        if special {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn quoted<'a>(caps: &Captures<'a>) -> (&'static str, &'a str) {
    if let Some(m) = caps.get(1) {
        ("\"", m.as_str())
    } else if let Some(m) = caps.get(2) {
        ("'", m.as_str())
    } else {
        ("", caps.get(3).map_or("", |m| m.as_str()))
    }
}
