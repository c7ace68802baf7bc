//! Digest → release version resolution and upgrade detection.
//!
//! Lookups go to the versions registry first where one is published and fall
//! back to a static table of early releases that predate version documents.
//! A miss is reported as `"unknown"` in informational output but is an error
//! wherever the version gates an upgrade decision.

pub mod history;
pub mod semver;

use std::fmt;
use std::sync::Arc;

use common::protocol::{ComponentInfo, Upgrade, VersionDocument};
use common::{CleanroomError, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::hashing::{digest_text, strip_sha256_prefix, BundleDigests};
use crate::remote::{GovernanceService, ManifestRegistry};

pub use semver::{Version, VersionParseError};

/// Manifest annotation carrying a component's release version.
pub const VERSION_ANNOTATION: &str = "cleanroom.version";
/// Title of the version document layer.
pub const VERSION_DOCUMENT_TITLE: &str = "version.yaml";
/// Rendering of an unresolved version.
pub const UNKNOWN_VERSION: &str = "unknown";
/// Mutable tag of the newest release.
pub const LATEST: &str = "latest";

/// Independently versioned components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// Governance client container image.
    Client,
    /// Governance constitution.
    Constitution,
    /// Governance JS application bundle.
    JsApp,
}

impl ComponentKind {
    /// Registry component name.
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Client => "cgs-client",
            ComponentKind::Constitution => "cgs-constitution",
            ComponentKind::JsApp => "cgs-js-app",
        }
    }

    /// Upgrade entry naming `version` for this component.
    pub fn upgrade(self, version: String) -> Upgrade {
        match self {
            ComponentKind::Client => Upgrade::Client(version),
            ComponentKind::Constitution => Upgrade::Constitution(version),
            ComponentKind::JsApp => Upgrade::JsApp(version),
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digests and versions of the components deployed in the governance service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceVersions {
    pub constitution: ComponentInfo,
    pub jsapp: ComponentInfo,
}

/// Current service versions plus available upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpgrades {
    pub constitution_version: String,
    pub jsapp_version: String,
    pub upgrades: Vec<Upgrade>,
}

/// Current client version plus available upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUpgrades {
    pub client_version: String,
    pub upgrades: Vec<Upgrade>,
}

/// Resolves digests to versions against a manifest registry.
#[derive(Clone)]
pub struct VersionResolver {
    registry: Arc<dyn ManifestRegistry>,
}

impl VersionResolver {
    pub fn new(registry: Arc<dyn ManifestRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `digest_or_tag` (bare hex, `sha256:` hex, or `latest`).
    ///
    /// # Errors
    ///
    /// [`CleanroomError::NotFound`] when no source knows the digest. A
    /// registry failure is returned only if the static table also misses.
    pub async fn resolve(&self, kind: ComponentKind, digest_or_tag: &str) -> Result<String> {
        if digest_or_tag == LATEST {
            return self
                .version_document_entry(kind, LATEST)
                .await?
                .ok_or_else(|| not_found(kind, LATEST));
        }

        let tag = strip_sha256_prefix(digest_or_tag);
        let mut remote_error = None;

        if kind == ComponentKind::Client {
            if let Some(v) = history::lookup(kind, tag) {
                return Ok(v.to_owned());
            }
        } else {
            match self.manifest_annotation(kind, tag).await {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {}
                Err(e) => {
                    warn!(component = %kind, error = %e, "version manifest lookup failed");
                    remote_error = Some(e);
                }
            }
        }

        match self.version_document_entry(kind, tag).await {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => {
                warn!(component = %kind, error = %e, "version document lookup failed");
                remote_error.get_or_insert(e);
            }
        }

        if let Some(v) = history::lookup(kind, tag) {
            debug!(component = %kind, version = v, "resolved from release history");
            return Ok(v.to_owned());
        }

        Err(remote_error.unwrap_or_else(|| not_found(kind, digest_or_tag)))
    }

    /// Like [`resolve`](Self::resolve) for display: a miss or a registry
    /// failure renders as `"unknown"`.
    pub async fn try_resolve(&self, kind: ComponentKind, digest_or_tag: &str) -> String {
        match self.resolve(kind, digest_or_tag).await {
            Ok(v) => v,
            Err(CleanroomError::NotFound(_)) => UNKNOWN_VERSION.to_owned(),
            Err(e) => {
                warn!(component = %kind, error = %e, "version unresolved; reporting unknown");
                UNKNOWN_VERSION.to_owned()
            }
        }
    }

    /// Resolve a version that gates an upgrade decision.
    ///
    /// # Errors
    ///
    /// A miss is [`CleanroomError::NotFound`] asking for a tooling upgrade;
    /// an unparseable version is [`CleanroomError::InvalidDocument`].
    pub async fn resolve_required(
        &self,
        kind: ComponentKind,
        digest: &str,
    ) -> Result<Version> {
        let version = self.resolve(kind, digest).await.map_err(|e| match e {
            CleanroomError::NotFound(_) => CleanroomError::NotFound(format!(
                "could not identify version for {kind} digest {digest}; \
                 an upgrade of the cleanroom tooling may be required"
            )),
            other => other,
        })?;
        parse_version(kind, &version)
    }

    /// Upgrade to `latest` for the component currently at `digest`, if newer.
    pub async fn upgrades_available(
        &self,
        kind: ComponentKind,
        digest: &str,
    ) -> Result<(Version, Option<Upgrade>)> {
        let current = self.resolve_required(kind, digest).await?;
        let latest = match self.resolve(kind, LATEST).await {
            Ok(v) => Some(parse_version(kind, &v)?),
            Err(CleanroomError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok((current, upgrade_between(kind, current, latest)))
    }

    /// Digests and versions of the constitution and JS app in governance.
    pub async fn service_versions(
        &self,
        governance: &dyn GovernanceService,
    ) -> Result<ServiceVersions> {
        let (constitution, jsapp) = service_digests(governance).await?;
        Ok(ServiceVersions {
            constitution: ComponentInfo {
                version: self
                    .try_resolve(ComponentKind::Constitution, &constitution)
                    .await,
                digest: prefixed(&constitution),
            },
            jsapp: ComponentInfo {
                version: self.try_resolve(ComponentKind::JsApp, &jsapp).await,
                digest: prefixed(&jsapp),
            },
        })
    }

    /// Current governance service versions and available upgrades.
    pub async fn service_upgrades(
        &self,
        governance: &dyn GovernanceService,
    ) -> Result<ServiceUpgrades> {
        let (constitution, jsapp) = service_digests(governance).await?;
        let (constitution_version, c_up) = self
            .upgrades_available(ComponentKind::Constitution, &constitution)
            .await?;
        let (jsapp_version, j_up) = self
            .upgrades_available(ComponentKind::JsApp, &jsapp)
            .await?;

        Ok(ServiceUpgrades {
            constitution_version: constitution_version.to_string(),
            jsapp_version: jsapp_version.to_string(),
            upgrades: c_up.into_iter().chain(j_up).collect(),
        })
    }

    /// Current client version and available upgrades for image `digest`.
    pub async fn client_upgrades(&self, digest: &str) -> Result<ClientUpgrades> {
        let (current, upgrade) = self
            .upgrades_available(ComponentKind::Client, digest)
            .await?;
        Ok(ClientUpgrades {
            client_version: current.to_string(),
            upgrades: upgrade.into_iter().collect(),
        })
    }

    async fn manifest_annotation(&self, kind: ComponentKind, tag: &str) -> Result<Option<String>> {
        let manifest = self.registry.manifest(kind.name(), tag).await?;
        Ok(manifest.and_then(|m| m.annotations.get(VERSION_ANNOTATION).cloned()))
    }

    async fn version_document_entry(
        &self,
        kind: ComponentKind,
        tag: &str,
    ) -> Result<Option<String>> {
        let repository = format!("versions/{}", kind.name());
        let Some(manifest) = self.registry.manifest(&repository, tag).await? else {
            return Ok(None);
        };
        let Some(layer) = manifest.layer_titled(VERSION_DOCUMENT_TITLE) else {
            return Err(CleanroomError::InvalidDocument(format!(
                "{repository}:{tag} has no {VERSION_DOCUMENT_TITLE} layer"
            )));
        };
        let blob = self.registry.blob(&repository, &layer.digest).await?;
        let document: VersionDocument = serde_yaml::from_slice(&blob).map_err(|e| {
            CleanroomError::InvalidDocument(format!("{repository}:{tag} version document: {e}"))
        })?;
        Ok(document.version_of(kind.name()))
    }
}

/// Upgrade entry if `latest` is strictly newer than `current`.
pub fn upgrade_between(
    kind: ComponentKind,
    current: Version,
    latest: Option<Version>,
) -> Option<Upgrade> {
    latest
        .filter(|l| *l > current)
        .map(|l| kind.upgrade(l.to_string()))
}

/// `(constitution digest, canonical JS app digest)` as bare hex.
async fn service_digests(governance: &dyn GovernanceService) -> Result<(String, String)> {
    let constitution = governance.constitution().await?;
    let bundle = governance.jsapp_bundle().await?;
    Ok((
        digest_text(&constitution).to_hex(),
        BundleDigests::of(&bundle)?.canonical.to_hex(),
    ))
}

fn prefixed(hex: &str) -> String {
    format!("{}{hex}", crate::hashing::canonical::SHA256_PREFIX)
}

fn parse_version(kind: ComponentKind, raw: &str) -> Result<Version> {
    raw.parse()
        .map_err(|e| CleanroomError::InvalidDocument(format!("{kind} version: {e}")))
}

fn not_found(kind: ComponentKind, tag: &str) -> CleanroomError {
    CleanroomError::NotFound(format!("no version recorded for {kind} {tag}"))
}
