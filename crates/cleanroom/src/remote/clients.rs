//! Remote client bundle built from process configuration.

use std::sync::Arc;
use std::time::Duration;

use common::Result;

use super::governance::{GovernanceClient, GovernanceService};
use super::http::HttpClient;
use super::key_vault::{KeyReleaseService, KeyVaultClient, SecretStore};
use super::registry::{ManifestRegistry, OciRegistryClient, RegistryLocation};

/// Bundle of remote collaborators.
///
/// All clients share one connection pool. Each field is a trait object so
/// callers can substitute mocks.
#[derive(Clone)]
pub struct RemoteClients {
    /// Manifest registry holding version documents.
    pub registry: Arc<dyn ManifestRegistry>,
    /// Governance service.
    pub governance: Arc<dyn GovernanceService>,
    /// Key-release service for KEK import.
    pub keys: Arc<dyn KeyReleaseService>,
    /// Store for wrapped DEKs and secrets.
    pub secrets: Arc<dyn SecretStore>,
}

/// Explicit settings for [`RemoteClients::init`].
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// `<host>[/<prefix>]` of the versions registry.
    pub versions_registry: String,
    /// Governance service base URL.
    pub governance_endpoint: String,
    /// Bearer token for the key vault.
    pub key_vault_token: Option<String>,
    /// Bearer token for the managed HSM; the vault token when unset.
    pub managed_hsm_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl RemoteClients {
    /// Build every client from `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn init(settings: &RemoteSettings) -> Result<Self> {
        let http = HttpClient::new(settings.request_timeout)?;
        let vault = Arc::new(KeyVaultClient::new(
            http.clone(),
            settings.key_vault_token.clone(),
            settings.managed_hsm_token.clone(),
        ));
        Ok(Self {
            registry: Arc::new(OciRegistryClient::new(
                http.clone(),
                RegistryLocation::parse(&settings.versions_registry),
            )),
            governance: Arc::new(GovernanceClient::new(
                http,
                settings.governance_endpoint.clone(),
            )),
            keys: vault.clone(),
            secrets: vault,
        })
    }
}
