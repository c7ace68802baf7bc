//! Digests of governance JS application bundles.
//!
//! Bundles published to the registry and the bundle reported back by the
//! running governance service disagree on HTTP-verb casing under
//! `metadata.endpoints.<path>`. The canonical digest lower-cases those keys
//! first; the raw digest is taken over the document exactly as received.

use common::{CleanroomError, Result};
use serde_json::{Map, Value};

use super::canonical::{canonicalize, digest_text, raw_serialize, Digest};

/// Both digests of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDigests {
    /// Digest over the untouched, insertion-ordered document.
    pub raw: Digest,
    /// Digest over the verb-normalised canonical form.
    pub canonical: Digest,
}

impl BundleDigests {
    /// Compute both digests for `bundle`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanroomError::InvalidDocument`] if `metadata.endpoints`
    /// exists but is not a map of maps.
    pub fn of(bundle: &Value) -> Result<Self> {
        let raw = digest_text(&raw_serialize(bundle)?);
        let canonical = digest_text(&canonical_bundle(bundle)?);
        Ok(Self { raw, canonical })
    }
}

/// Canonical text of a bundle with endpoint verbs lower-cased.
pub fn canonical_bundle(bundle: &Value) -> Result<String> {
    canonicalize(&normalize_endpoint_verbs(bundle)?)
}

/// Copy of `bundle` with every verb key under `metadata.endpoints.*` lower-cased.
fn normalize_endpoint_verbs(bundle: &Value) -> Result<Value> {
    let mut out = bundle.clone();
    let Some(endpoints) = out.pointer_mut("/metadata/endpoints") else {
        return Ok(out);
    };
    let endpoints = endpoints.as_object_mut().ok_or_else(|| {
        CleanroomError::InvalidDocument("bundle metadata.endpoints must be an object".into())
    })?;

    for (path, verbs) in endpoints.iter_mut() {
        let verbs = verbs.as_object_mut().ok_or_else(|| {
            CleanroomError::InvalidDocument(format!("bundle endpoint '{path}' must be an object"))
        })?;
        let lowered: Map<String, Value> = std::mem::take(verbs)
            .into_iter()
            .map(|(verb, action)| (verb.to_lowercase(), action))
            .collect();
        *verbs = lowered;
    }
    Ok(out)
}
