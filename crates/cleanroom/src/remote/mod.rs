//! Adapters for the remote collaborators: manifest registry, governance
//! service, and the key vault / managed HSM.
//!
//! Every call is a single bounded attempt. Nothing here retries; repeating a
//! key import or a proposal submission is not safe to do blindly.

pub mod clients;
pub mod governance;
pub mod http;
pub mod key_vault;
pub mod registry;

pub use clients::{RemoteClients, RemoteSettings};
pub use governance::{GovernanceClient, GovernanceService};
pub use key_vault::{
    ImportOptions, KeyId, KeyImportRequest, KeyOperation, KeyReleaseService, KeyVaultClient,
    SecretStore, WritePrecondition,
};
pub use registry::{ManifestRegistry, OciManifest, OciRegistryClient, RegistryLocation};
