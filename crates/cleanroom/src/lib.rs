//! Clean room key provisioning.
//!
//! - [`hashing`]: canonical JSON and SHA-256 digests shared with other tooling.
//! - [`version`]: component version resolution and upgrade detection.
//! - [`policy`]: CCE policy assembly and governance proposals.
//! - [`keys`]: attestation-bound KEKs and DEK envelope management.
//! - [`remote`]: registry, governance and key vault adapters.

pub mod config;
pub mod hashing;
pub mod keys;
pub mod policy;
pub mod remote;
pub mod telemetry;
pub mod version;
