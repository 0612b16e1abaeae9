//! Script rewriting: module specifiers and `importScripts` literals.
//!
//! Only specifiers that are URLs (relative, root-relative or absolute http)
//! are routed through the relay. Bare module names are left for import maps.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::url_rewriter::{RewriteContext, UrlRewriter};

static FROM_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bfrom\s*(?:"([^"\n]+)"|'([^'\n]+)')"#).expect("valid regex")
});

static SIDE_EFFECT_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bimport\s*(?:"([^"\n]+)"|'([^'\n]+)')"#).expect("valid regex")
});

static DYNAMIC_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bimport\s*\(\s*(?:"([^"\n]+)"|'([^'\n]+)')\s*\)"#).expect("valid regex")
});

static IMPORT_SCRIPTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bimportScripts\s*\(([^)]*)\)").expect("valid regex"));

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"\n]*)"|'([^'\n]*)'"#).expect("valid regex"));

fn is_url_specifier(spec: &str) -> bool {
    spec.starts_with("./")
        || spec.starts_with("../")
        || spec.starts_with('/')
        || spec.starts_with("http://")
        || spec.starts_with("https://")
}

fn literal(
    caps: &Captures<'_>,
    first: usize,
    rewriter: &UrlRewriter,
    ctx: &RewriteContext,
) -> Option<String> {
    let (quote, spec) = match (caps.get(first), caps.get(first + 1)) {
        (Some(m), _) => ('"', m.as_str()),
        (None, Some(m)) => ('\'', m.as_str()),
        _ => return None,
    };
    if !is_url_specifier(spec) {
        return None;
    }
    Some(quote_literal(&rewriter.rewrite_url(spec, ctx), quote))
}

/// Wraps `value` in `quote`, escaping it as a JS string literal.
fn quote_literal(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Replaces the quoted specifier inside a match, keeping the surrounding text.
fn replace_specifier(
    re: &Regex,
    source: &str,
    rewriter: &UrlRewriter,
    ctx: &RewriteContext,
) -> String {
    re.replace_all(source, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let Some(rewritten) = literal(caps, 1, rewriter, ctx) else {
            return whole.to_string();
        };
        let spec = caps.get(1).or_else(|| caps.get(2)).map_or(0..0, |m| m.range());
        let start = spec.start - caps.get(0).map_or(0, |m| m.start()) - 1;
        let end = start + spec.len() + 2;
        format!("{}{}{}", &whole[..start], rewritten, &whole[end..])
    })
    .into_owned()
}

/// Rewrites URL-bearing literals in a script body.
pub fn rewrite(source: &str, rewriter: &UrlRewriter, ctx: &RewriteContext) -> String {
    let out = replace_specifier(&FROM_CLAUSE, source, rewriter, ctx);
    let out = replace_specifier(&SIDE_EFFECT_IMPORT, &out, rewriter, ctx);
    let out = replace_specifier(&DYNAMIC_IMPORT, &out, rewriter, ctx);
    IMPORT_SCRIPTS
        .replace_all(&out, |caps: &Captures<'_>| {
            let args = STRING_LITERAL.replace_all(&caps[1], |lit: &Captures<'_>| {
                let (quote, value) = match lit.get(1) {
                    Some(m) => ('"', m.as_str()),
                    None => ('\'', lit.get(2).map_or("", |m| m.as_str())),
                };
                quote_literal(&rewriter.rewrite_url(value, ctx), quote)
            });
            format!("importScripts({args})")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UrlCodec;
    use crate::config::ProxyConfig;
    use url::Url;

    fn run(js: &str) -> String {
        let rw = UrlRewriter::new(ProxyConfig::default().with_codec(UrlCodec::None).into_store());
        let ctx = RewriteContext::new(
            Url::parse("http://relay.local/").unwrap(),
            Url::parse("https://origin.test/js/app.js").unwrap(),
        );
        rewrite(js, &rw, &ctx)
    }

    #[test]
    fn rewrites_static_imports() {
        assert_eq!(
            run(r#"import { a } from "./a.js"; export * from '../b.js';"#),
            r#"import { a } from "/service/https://origin.test/js/a.js"; export * from '/service/https://origin.test/b.js';"#
        );
    }

    #[test]
    fn rewrites_side_effect_and_dynamic_imports() {
        assert_eq!(
            run(r#"import "/polyfill.js"; const m = await import( 'https://cdn.test/m.js' );"#),
            r#"import "/service/https://origin.test/polyfill.js"; const m = await import( '/service/https://cdn.test/m.js' );"#
        );
    }

    #[test]
    fn leaves_bare_specifiers() {
        let js = r#"import React from "react"; import("lodash");"#;
        assert_eq!(run(js), js);
    }

    #[test]
    fn xor_output_keeps_literals_intact() {
        let rw = UrlRewriter::new(ProxyConfig::default().into_store());
        let ctx = RewriteContext::new(
            Url::parse("http://relay.local/").unwrap(),
            Url::parse("https://origin.test/js/app.js").unwrap(),
        );
        let out = rewrite(
            "import x from './a%20b+c.js'; importScripts('w+1.js');",
            &rw,
            &ctx,
        );

        let literals: Vec<&str> = out.split('\'').skip(1).step_by(2).collect();
        assert_eq!(literals.len(), 2);
        assert_eq!(
            rw.decode(literals[0], ctx.client_origin()).unwrap().as_str(),
            "https://origin.test/js/a%20b+c.js"
        );
        assert_eq!(
            rw.decode(literals[1], ctx.client_origin()).unwrap().as_str(),
            "https://origin.test/js/w+1.js"
        );
        assert!(out.ends_with("');"));
    }

    #[test]
    fn literals_are_escaped_for_their_quote() {
        assert_eq!(quote_literal("/it's", '\''), r"'/it\'s'");
        assert_eq!(quote_literal("/it's", '"'), r#""/it's""#);
        assert_eq!(quote_literal("/a\\b", '"'), r#""/a\\b""#);
    }

    #[test]
    fn rewrites_import_scripts_arguments() {
        assert_eq!(
            run(r#"importScripts("a.js", 'https://cdn.test/b.js');"#),
            r#"importScripts("/service/https://origin.test/js/a.js", '/service/https://cdn.test/b.js');"#
        );
    }
}
