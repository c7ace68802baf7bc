//! Key material for a clean room contract.
//!
//! Each datasource and datasink owns a random DEK kept in the local key
//! store. DEKs are published only wrapped under the contract's KEK, an RSA key
//! imported into a managed HSM with a release predicate pinning the approved
//! CCE policy digest. Nothing outside an attested container running that
//! policy can unwrap them.

pub mod dek;
pub mod envelope;
pub mod kek;
pub mod skr;
pub mod store;
pub mod wrap;

pub use dek::{DekBytes, DEK_LEN};
pub use envelope::{EnvelopeManager, WrappedDek};
pub use kek::{ensure_kek, kek_name, load_kek, Kek, KekFiles, KekOptions};
pub use skr::build_skr_policy;
pub use store::{
    ContractConfig, Datastore, DatastoreKind, DekResource, KekSettings, KeyStore, PrivateEntry,
};
pub use wrap::{unwrap_key, wrap_key, KekKeyPair, WrapError};
