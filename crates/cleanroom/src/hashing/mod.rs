//! Canonical serialisation and SHA-256 digests of structured documents.
//!
//! # Module invariants
//!
//! - **Pure.** Nothing here performs I/O or reads configuration.
//! - `digest(canonicalize(doc))` is stable across processes and across
//!   independent implementations for the same logical document.

pub mod bundle;
pub mod canonical;

pub use bundle::BundleDigests;
pub use canonical::{
    canonical_digest, canonicalize, digest_text, raw_serialize, strip_sha256_prefix, Digest,
};
