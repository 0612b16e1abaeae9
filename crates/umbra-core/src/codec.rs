//! Reversible string codecs used to embed destination URLs in relay paths.
//!
//! The encoded form is always safe as a single path segment: every codec
//! finishes with `encodeURIComponent`-style percent-encoding, so a literal `?`
//! never appears in encoded output. Codecs that scramble the URL split on the
//! first literal `?` when decoding and re-append the tail untouched, because
//! browsers append form-GET queries to whatever URL the form targeted.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, ConfigError};

/// Characters `encodeURIComponent` leaves alone, minus `'`, `(` and `)`.
///
/// Encoded URLs are spliced into CSS `url(...)` and quoted JS/CSS literals,
/// where those three would end the token early.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*');

/// URL codec selected in the relay configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlCodec {
    /// Identity; the URL is embedded as-is.
    None,
    /// Percent-encoding only.
    Plain,
    /// Odd-indexed characters XOR 2, then percent-encoded.
    #[default]
    Xor,
    /// Standard base64, then percent-encoded.
    Base64,
}

impl UrlCodec {
    /// Returns the configuration name of the codec.
    pub fn name(&self) -> &'static str {
        match self {
            UrlCodec::None => "none",
            UrlCodec::Plain => "plain",
            UrlCodec::Xor => "xor",
            UrlCodec::Base64 => "base64",
        }
    }

    /// Encodes a string. Deterministic for every codec.
    ///
    /// Output of every codec except `none` is free of quotes, parentheses,
    /// backslashes and whitespace.
    pub fn encode(&self, input: &str) -> String {
        match self {
            UrlCodec::None => input.to_string(),
            UrlCodec::Plain => encode_component(input),
            UrlCodec::Xor => encode_component(&xor(input)),
            UrlCodec::Base64 => {
                encode_component(&base64::engine::general_purpose::STANDARD.encode(input))
            }
        }
    }

    /// Decodes a string produced by [`UrlCodec::encode`].
    pub fn decode(&self, input: &str) -> Result<String, CodecError> {
        match self {
            UrlCodec::None => Ok(input.to_string()),
            UrlCodec::Plain => decode_component(input),
            UrlCodec::Xor => {
                let (head, tail) = split_query(input);
                let decoded = xor(&decode_component(head)?);
                Ok(format!("{decoded}{tail}"))
            }
            UrlCodec::Base64 => {
                let (head, tail) = split_query(input);
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(decode_component(head)?)
                    .map_err(|e| CodecError::Base64(e.to_string()))?;
                let decoded =
                    String::from_utf8(raw).map_err(|e| CodecError::Base64(e.to_string()))?;
                Ok(format!("{decoded}{tail}"))
            }
        }
    }
}

impl fmt::Display for UrlCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UrlCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(UrlCodec::None),
            "plain" => Ok(UrlCodec::Plain),
            "xor" => Ok(UrlCodec::Xor),
            "base64" => Ok(UrlCodec::Base64),
            other => Err(ConfigError::UnknownCodec(other.to_string())),
        }
    }
}

/// Percent-encodes like JavaScript's `encodeURIComponent`.
pub fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, URI_COMPONENT).to_string()
}

/// Reverses [`encode_component`].
pub fn decode_component(input: &str) -> Result<String, CodecError> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| CodecError::PercentEncoding)
}

/// Splits off everything from the first literal `?`, keeping the `?`.
fn split_query(input: &str) -> (&str, &str) {
    match input.find('?') {
        Some(idx) => input.split_at(idx),
        None => (input, ""),
    }
}

/// Flips bit 1 of every odd-indexed character. Self-inverse.
///
/// Surrogate blocks are 4-aligned, so flipping bit 1 never produces an
/// invalid scalar value.
fn xor(input: &str) -> String {
    input
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i % 2 == 1 {
                char::from_u32(c as u32 ^ 2).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}
