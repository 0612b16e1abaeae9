//! Cookie model scoped by the real destination origin.
//!
//! Parsing follows RFC 6265 with the browser-era additions (SameSite,
//! `__Secure-`/`__Host-` prefixes). Storage sits behind [`CookieStore`] so
//! the async jar can run over SQLite or memory alike.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::ProxyError;
use crate::url_rewriter::RewriteContext;

/// SameSite attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(format!("unknown SameSite value {other:?}")),
        }
    }
}

/// A stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    /// Lower-case host or domain, without a leading dot.
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Set without a `Domain` attribute; matches the exact host only.
    pub host_only: bool,
}

impl CookieRecord {
    /// Storage key `(domain, path, name)`.
    pub fn key(&self) -> CookieKey {
        CookieKey {
            domain: self.domain.clone(),
            path: self.path.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether the cookie would be sent to `url`, ignoring SameSite.
    pub fn matches_url(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        !self.is_expired(now)
            && (!self.secure || url.scheme() == "https")
            && domain_matches(&host.to_ascii_lowercase(), &self.domain, self.host_only)
            && path_matches(url.path(), &self.path)
    }

    /// Full send policy for the request described by `ctx`.
    pub fn matches(&self, ctx: &RewriteContext, now: DateTime<Utc>) -> bool {
        if !self.matches_url(ctx.current(), now) {
            return false;
        }
        let cross_site = ctx
            .referrer()
            .is_some_and(|referrer| !is_same_site(referrer, ctx.current()));
        match self.same_site {
            SameSite::None => true,
            SameSite::Lax => !cross_site || ctx.is_navigation(),
            SameSite::Strict => !cross_site,
        }
    }
}

/// Primary key of a stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CookieKey {
    pub domain: String,
    pub path: String,
    pub name: String,
}

impl fmt::Display for CookieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.domain, self.path, self.name)
    }
}

/// Outcome of parsing one `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    Set(CookieRecord),
    /// `Max-Age<=0` or an `Expires` in the past.
    Remove(CookieKey),
}

/// Why a `Set-Cookie` header was ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieRejected {
    #[error("missing name-value pair")]
    MissingPair,
    #[error("empty cookie name")]
    EmptyName,
    #[error("URL has no host")]
    NoHost,
    #[error("domain {domain} does not match host {host}")]
    DomainMismatch { domain: String, host: String },
    #[error("Secure cookie set from an insecure origin")]
    InsecureOrigin,
    #[error("SameSite=None requires Secure")]
    SameSiteNoneWithoutSecure,
    #[error("cookie prefix {0} requirements not met")]
    Prefix(&'static str),
}

/// Parses one `Set-Cookie` header value received from `url`.
pub fn parse_set_cookie(
    header: &str,
    url: &Url,
    now: DateTime<Utc>,
) -> Result<CookieChange, CookieRejected> {
    let mut parts = header.split(';');
    let pair = parts.next().unwrap_or("");
    let (name, value) = pair.split_once('=').ok_or(CookieRejected::MissingPair)?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() {
        return Err(CookieRejected::EmptyName);
    }

    let host = url
        .host_str()
        .ok_or(CookieRejected::NoHost)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    let mut domain_attr: Option<String> = None;
    let mut path_attr: Option<String> = None;
    let mut max_age: Option<i64> = None;
    let mut expires_attr: Option<DateTime<Utc>> = None;
    let mut secure = false;
    let mut http_only = false;
    let mut same_site = SameSite::default();

    for attr in parts {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" => {
                let domain = val.trim_start_matches('.').to_ascii_lowercase();
                if !domain.is_empty() {
                    domain_attr = Some(domain);
                }
            }
            "path" if val.starts_with('/') => path_attr = Some(val.to_string()),
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    max_age = Some(secs);
                }
            }
            "expires" => {
                if let Some(date) = parse_cookie_date(val) {
                    expires_attr = Some(date);
                }
            }
            "secure" => secure = true,
            "httponly" => http_only = true,
            "samesite" => same_site = val.parse().unwrap_or_default(),
            _ => {}
        }
    }

    let (domain, host_only) = match domain_attr {
        Some(domain) => {
            let is_ip = host.parse::<IpAddr>().is_ok();
            if !domain_matches(&host, &domain, false) || (is_ip && domain != host) {
                return Err(CookieRejected::DomainMismatch { domain, host });
            }
            (domain, is_ip)
        }
        None => (host, true),
    };
    let path = path_attr.unwrap_or_else(|| default_path(url));

    if secure && url.scheme() != "https" {
        return Err(CookieRejected::InsecureOrigin);
    }
    if same_site == SameSite::None && !secure {
        return Err(CookieRejected::SameSiteNoneWithoutSecure);
    }
    if name.starts_with("__Secure-") && !secure {
        return Err(CookieRejected::Prefix("__Secure-"));
    }
    if name.starts_with("__Host-") && !(secure && host_only && path == "/") {
        return Err(CookieRejected::Prefix("__Host-"));
    }

    let expires = match max_age {
        Some(secs) if secs <= 0 => None,
        Some(secs) => Some(now + Duration::seconds(secs.min(400 * 24 * 3600))),
        None => expires_attr,
    };
    let removed = matches!(max_age, Some(secs) if secs <= 0)
        || (max_age.is_none() && expires.is_some_and(|e| e <= now));

    let record = CookieRecord {
        name: name.to_string(),
        value: value.to_string(),
        domain,
        path,
        expires,
        secure,
        http_only,
        same_site,
        host_only,
    };
    if removed {
        Ok(CookieChange::Remove(record.key()))
    } else {
        Ok(CookieChange::Set(record))
    }
}

/// Parses the date formats servers actually send in `Expires`.
pub fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// RFC 6265 §5.1.4 default path.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// RFC 6265 §5.1.3 domain matching.
pub fn domain_matches(host: &str, domain: &str, host_only: bool) -> bool {
    if host == domain {
        return true;
    }
    !host_only
        && host.parse::<IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 §5.1.4 path matching.
pub fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Candidate storage domains for a host: the host and each parent domain.
pub fn candidate_domains(host: &str) -> Vec<String> {
    let host = host.to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return vec![host];
    }
    let mut domains = vec![host.clone()];
    let mut rest = host.as_str();
    while let Some((_, parent)) = rest.split_once('.') {
        if parent.is_empty() {
            break;
        }
        domains.push(parent.to_string());
        rest = parent;
    }
    domains
}

/// Approximates "same site" as scheme plus the last two host labels.
pub fn is_same_site(a: &Url, b: &Url) -> bool {
    fn site(url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        if host.parse::<IpAddr>().is_ok() {
            return Some(host);
        }
        let labels: Vec<&str> = host.rsplitn(3, '.').collect();
        Some(match labels.as_slice() {
            [tld, sld, ..] => format!("{sld}.{tld}"),
            _ => host,
        })
    }
    a.scheme() == b.scheme() && site(a).is_some() && site(a) == site(b)
}

/// Serializes cookies that apply to `ctx`.
///
/// With `for_client_bootstrap` the output is a JSON array for the injected
/// page runtime and omits `HttpOnly` cookies; otherwise it is a `Cookie:`
/// header value, longer paths first.
pub fn serialize(
    records: &[CookieRecord],
    ctx: &RewriteContext,
    for_client_bootstrap: bool,
    now: DateTime<Utc>,
) -> String {
    let mut applicable: Vec<&CookieRecord> = records
        .iter()
        .filter(|record| record.matches(ctx, now))
        .filter(|record| !(for_client_bootstrap && record.http_only))
        .collect();
    applicable.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

    if for_client_bootstrap {
        let view: Vec<BootstrapCookie<'_>> =
            applicable.into_iter().map(BootstrapCookie::from).collect();
        serde_json::to_string(&view).unwrap_or_else(|_| "[]".to_string())
    } else {
        applicable
            .iter()
            .map(|record| format!("{}={}", record.name, record.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapCookie<'a> {
    name: &'a str,
    value: &'a str,
    domain: &'a str,
    path: &'a str,
    expires: Option<String>,
    secure: bool,
    same_site: &'static str,
    host_only: bool,
}

impl<'a> From<&'a CookieRecord> for BootstrapCookie<'a> {
    fn from(record: &'a CookieRecord) -> Self {
        Self {
            name: &record.name,
            value: &record.value,
            domain: &record.domain,
            path: &record.path,
            expires: record.expires.map(|e| e.to_rfc3339()),
            secure: record.secure,
            same_site: record.same_site.as_str(),
            host_only: record.host_only,
        }
    }
}

/// Formats a timestamp so that stored values sort chronologically as text.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Raw row as persisted by a [`CookieStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub domain: String,
    pub path: String,
    pub name: String,
    pub value: String,
    /// RFC 3339 timestamp in UTC, see [`format_timestamp`].
    pub expires_at: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: String,
    pub host_only: bool,
}

impl From<&CookieRecord> for StoredCookie {
    fn from(record: &CookieRecord) -> Self {
        Self {
            domain: record.domain.clone(),
            path: record.path.clone(),
            name: record.name.clone(),
            value: record.value.clone(),
            expires_at: record.expires.map(format_timestamp),
            secure: record.secure,
            http_only: record.http_only,
            same_site: record.same_site.as_str().to_string(),
            host_only: record.host_only,
        }
    }
}

impl TryFrom<StoredCookie> for CookieRecord {
    type Error = ProxyError;

    fn try_from(row: StoredCookie) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| ProxyError::CookieStoreCorruption {
            key: format!("{}{}:{}", row.domain, row.path, row.name),
            reason,
        };
        let same_site = row.same_site.parse::<SameSite>().map_err(&corrupt)?;
        let expires = row
            .expires_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| corrupt(format!("bad expiry: {e}")))?
            .map(|e| e.with_timezone(&Utc));
        if row.name.is_empty() || row.domain.is_empty() || !row.path.starts_with('/') {
            return Err(corrupt("missing key component".to_string()));
        }
        Ok(CookieRecord {
            name: row.name,
            value: row.value,
            domain: row.domain,
            path: row.path,
            expires,
            secure: row.secure,
            http_only: row.http_only,
            same_site,
            host_only: row.host_only,
        })
    }
}

/// A single mutation applied by [`CookieStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieMutation {
    Upsert(StoredCookie),
    Delete(CookieKey),
}

/// Failure reported by a cookie store backend.
#[derive(Debug, Clone, Error)]
#[error("cookie store error: {0}")]
pub struct CookieStoreError(pub String);

/// Durable or in-memory keyed cookie storage.
///
/// Implementations are synchronous; the async jar moves calls off the
/// runtime and serializes writers.
pub trait CookieStore: Send + Sync {
    /// Returns every row whose domain is one of `domains`.
    fn load(&self, domains: &[String]) -> Result<Vec<StoredCookie>, CookieStoreError>;

    /// Applies a batch atomically.
    fn apply(&self, batch: &[CookieMutation]) -> Result<(), CookieStoreError>;
}

/// In-memory [`CookieStore`].
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    rows: RwLock<BTreeMap<CookieKey, StoredCookie>>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Inserts a raw row, bypassing validation.
    pub fn insert_raw(&self, row: StoredCookie) {
        let key = CookieKey {
            domain: row.domain.clone(),
            path: row.path.clone(),
            name: row.name.clone(),
        };
        self.rows.write().insert(key, row);
    }
}

impl CookieStore for MemoryCookieStore {
    fn load(&self, domains: &[String]) -> Result<Vec<StoredCookie>, CookieStoreError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| domains.contains(&row.domain))
            .cloned()
            .collect())
    }

    fn apply(&self, batch: &[CookieMutation]) -> Result<(), CookieStoreError> {
        let mut rows = self.rows.write();
        for mutation in batch {
            match mutation {
                CookieMutation::Upsert(row) => {
                    let key = CookieKey {
                        domain: row.domain.clone(),
                        path: row.path.clone(),
                        name: row.name.clone(),
                    };
                    rows.insert(key, row.clone());
                }
                CookieMutation::Delete(key) => {
                    rows.remove(key);
                }
            }
        }
        Ok(())
    }
}
