//! Deterministic JSON serialisation and SHA-256 digests.
//!
//! Two serialisations are produced:
//!
//! - **canonical**: keys sorted at every level, two-space indent, `": "` key
//!   separator, non-ASCII written literally. This is the form every tool must
//!   agree on to name a document.
//! - **raw**: insertion order kept, compact `", "` / `": "` separators,
//!   non-ASCII escaped as `\uXXXX`. This reproduces the untouched form that
//!   historical digests were computed over.

use std::fmt;
use std::io;

use common::{CleanroomError, Result};
use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Prefix used when a digest is presented as a content reference.
pub const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

/// Errors parsing a textual digest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    /// Not 64 hex characters after the optional prefix.
    #[error("digest must be 64 hex characters, got {0}")]
    InvalidLength(usize),

    /// Contains a non-hex character.
    #[error("digest contains non-hex characters")]
    InvalidHex,
}

impl Digest {
    /// SHA-256 over `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `sha256:<hex>` form.
    pub fn prefixed(&self) -> String {
        format!("{SHA256_PREFIX}{}", self.to_hex())
    }

    /// Parse either `sha256:<hex>` or bare hex. Upper-case hex is accepted.
    pub fn parse(s: &str) -> std::result::Result<Self, DigestParseError> {
        let bare = strip_sha256_prefix(s.trim());
        if bare.len() != 64 {
            return Err(DigestParseError::InvalidLength(bare.len()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(bare, &mut out).map_err(|_| DigestParseError::InvalidHex)?;
        Ok(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Strip a leading `sha256:` if present.
pub fn strip_sha256_prefix(s: &str) -> &str {
    s.strip_prefix(SHA256_PREFIX).unwrap_or(s)
}

/// SHA-256 over the UTF-8 bytes of `text`.
pub fn digest_text(text: &str) -> Digest {
    Digest::of(text.as_bytes())
}

/// Canonical serialisation of `doc`.
///
/// # Errors
///
/// Returns [`CleanroomError::InvalidDocument`] if serialisation fails, which
/// only happens for values serde_json itself cannot represent.
pub fn canonicalize(doc: &Value) -> Result<String> {
    let sorted = sort_keys(doc);
    let mut out = Vec::with_capacity(256);
    let formatter = PrettyFormatter::with_indent(b"  ");
    let mut ser = Serializer::with_formatter(&mut out, formatter);
    sorted
        .serialize(&mut ser)
        .map_err(|e| CleanroomError::InvalidDocument(format!("canonical serialisation: {e}")))?;
    String::from_utf8(out)
        .map_err(|e| CleanroomError::InvalidDocument(format!("canonical serialisation: {e}")))
}

/// Raw (insertion-ordered, ASCII-escaped, compact) serialisation of `doc`.
///
/// # Errors
///
/// Same conditions as [`canonicalize`].
pub fn raw_serialize(doc: &Value) -> Result<String> {
    let mut out = Vec::with_capacity(256);
    let mut ser = Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
    doc.serialize(&mut ser)
        .map_err(|e| CleanroomError::InvalidDocument(format!("raw serialisation: {e}")))?;
    String::from_utf8(out)
        .map_err(|e| CleanroomError::InvalidDocument(format!("raw serialisation: {e}")))
}

/// `digest(canonicalize(doc))`.
pub fn canonical_digest(doc: &Value) -> Result<Digest> {
    Ok(digest_text(&canonicalize(doc)?))
}

/// Recursively rebuild `v` with object keys in lexicographic order.
fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Compact formatter with `", "` / `": "` separators that escapes every
/// character outside printable ASCII.
struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        w: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        w: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(
        &mut self,
        w: &mut W,
    ) -> io::Result<()> {
        w.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        w: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        for c in fragment.chars() {
            if c.is_ascii() && c != '\x7f' {
                w.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(w, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        // Parsed from text so insertion order is the textual order.
        serde_json::from_str(
            r#"{"zeta": 1, "alpha": {"name": "café", "list": [3, 1, 2], "nested": {"b": true, "a": null}}, "empty": {}, "arr": []}"#,
        )
        .unwrap()
    }

    #[test]
    fn canonical_form_sorts_and_indents() {
        let c = canonicalize(&sample()).unwrap();
        let expected = "{\n  \"alpha\": {\n    \"list\": [\n      3,\n      1,\n      2\n    ],\n    \"name\": \"café\",\n    \"nested\": {\n      \"a\": null,\n      \"b\": true\n    }\n  },\n  \"arr\": [],\n  \"empty\": {},\n  \"zeta\": 1\n}";
        assert_eq!(c, expected);
    }

    #[test]
    fn canonical_digest_matches_reference_tooling() {
        assert_eq!(
            canonical_digest(&sample()).unwrap().to_hex(),
            "83cb290d3bd6ef211a6e66a25a0d15a9a83aa8f530261fd630afde90145ff936"
        );
    }

    #[test]
    fn raw_form_keeps_order_and_escapes_non_ascii() {
        let r = raw_serialize(&sample()).unwrap();
        assert_eq!(
            r,
            r#"{"zeta": 1, "alpha": {"name": "caf\u00e9", "list": [3, 1, 2], "nested": {"b": true, "a": null}}, "empty": {}, "arr": []}"#
        );
        assert_eq!(
            digest_text(&r).to_hex(),
            "518237dd43c715b3f707e383e48552d42f9290e744c4d0182aab7a6fed3c6182"
        );
    }

    #[test]
    fn raw_form_escapes_astral_chars_as_surrogates() {
        let r = raw_serialize(&json!({"k": "😀"})).unwrap();
        assert_eq!(r, r#"{"k": "\ud83d\ude00"}"#);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize(&sample()).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = canonicalize(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn canonical_form_ignores_input_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_ne!(raw_serialize(&a).unwrap(), raw_serialize(&b).unwrap());
    }

    #[test]
    fn digest_parse_accepts_prefixed_and_bare() {
        let hex = "6bbdb78ed816cc702249dcecac40467b1d31e5c8cfbb1ef312b7d119dde7024f";
        let a = Digest::parse(hex).unwrap();
        let b = Digest::parse(&format!("sha256:{hex}")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), hex);
        assert_eq!(a.prefixed(), format!("sha256:{hex}"));
        assert_eq!(a.to_string(), hex);
    }

    #[test]
    fn digest_parse_rejects_garbage() {
        assert_eq!(Digest::parse("abc"), Err(DigestParseError::InvalidLength(3)));
        assert_eq!(
            Digest::parse(&"zz".repeat(32)),
            Err(DigestParseError::InvalidHex)
        );
    }

    #[test]
    fn digest_of_empty_string() {
        assert_eq!(
            digest_text("").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
