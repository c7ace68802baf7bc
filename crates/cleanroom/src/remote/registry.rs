//! Content-addressable manifest registry (OCI distribution API).

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::{self, HttpClient};

/// Annotation naming a layer's file.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// Subset of an OCI image manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    /// Manifest-level annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Layer descriptors.
    #[serde(default)]
    pub layers: Vec<OciDescriptor>,
}

/// Content descriptor of a manifest layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// Media type of the blob.
    #[serde(default)]
    pub media_type: String,
    /// `sha256:`-prefixed blob digest.
    pub digest: String,
    /// Descriptor annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl OciManifest {
    /// Layer whose title annotation equals `title`.
    pub fn layer_titled(&self, title: &str) -> Option<&OciDescriptor> {
        self.layers
            .iter()
            .find(|l| l.annotations.get(TITLE_ANNOTATION).map(String::as_str) == Some(title))
    }
}

/// Read access to a manifest registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestRegistry: Send + Sync {
    /// Fetch the manifest for `<repository>:<reference>`; `None` if absent.
    async fn manifest(&self, repository: &str, reference: &str) -> Result<Option<OciManifest>>;

    /// Fetch a blob by digest from `repository`.
    async fn blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>>;
}

/// Registry location: `<host>[/<prefix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLocation {
    base_url: String,
    prefix: String,
}

impl RegistryLocation {
    /// Parse `mcr.microsoft.com/cleanroom`-style locations.
    ///
    /// `localhost` registries are reached over plain HTTP.
    pub fn parse(location: &str) -> Self {
        let trimmed = location
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (host, prefix) = match trimmed.split_once('/') {
            Some((h, p)) => (h, p.to_owned()),
            None => (trimmed, String::new()),
        };
        let hostname = host.split(':').next().unwrap_or(host);
        let scheme = if hostname == "localhost" || hostname == "127.0.0.1" {
            "http"
        } else {
            "https"
        };
        Self {
            base_url: format!("{scheme}://{host}"),
            prefix,
        }
    }

    /// Full repository path for a component repository.
    pub fn repository(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Base URL including scheme.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// [`ManifestRegistry`] over the OCI distribution HTTP API with anonymous pulls.
#[derive(Clone, Debug)]
pub struct OciRegistryClient {
    http: HttpClient,
    location: RegistryLocation,
}

impl OciRegistryClient {
    /// Create a client for `location`.
    pub fn new(http: HttpClient, location: RegistryLocation) -> Self {
        Self { http, location }
    }
}

#[async_trait]
impl ManifestRegistry for OciRegistryClient {
    async fn manifest(&self, repository: &str, reference: &str) -> Result<Option<OciManifest>> {
        let repo = self.location.repository(repository);
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.location.base_url());
        debug!(url = %url, "fetching manifest");

        let req = self
            .http
            .request(Method::GET, &url, None)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        match http::send(&Method::GET, &url, req, true).await? {
            Some(resp) => Ok(Some(http::json_body(&Method::GET, &url, resp).await?)),
            None => Ok(None),
        }
    }

    async fn blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let repo = self.location.repository(repository);
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.location.base_url());
        debug!(url = %url, "fetching blob");

        let req = self.http.request(Method::GET, &url, None);
        let resp = http::send_expect(&Method::GET, &url, req).await?;
        let bytes = resp.bytes().await.map_err(|e| {
            http::remote_error(&Method::GET, &url, 200, format!("unreadable body: {e}"))
        })?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_with_prefix() {
        let loc = RegistryLocation::parse("mcr.microsoft.com/cleanroom");
        assert_eq!(loc.base_url(), "https://mcr.microsoft.com");
        assert_eq!(loc.repository("versions/cgs-client"), "cleanroom/versions/cgs-client");
    }

    #[test]
    fn localhost_location_is_plain_http() {
        let loc = RegistryLocation::parse("localhost:5000");
        assert_eq!(loc.base_url(), "http://localhost:5000");
        assert_eq!(loc.repository("cgs-js-app"), "cgs-js-app");
    }

    #[test]
    fn manifest_layer_lookup_by_title() {
        let m: OciManifest = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "annotations": {"cleanroom.version": "1.0.8"},
            "layers": [
                {"mediaType": "application/yaml", "digest": "sha256:aa",
                 "annotations": {"org.opencontainers.image.title": "version.yaml"}},
                {"mediaType": "application/json", "digest": "sha256:bb"}
            ]
        }))
        .unwrap();
        assert_eq!(m.annotations.get("cleanroom.version").unwrap(), "1.0.8");
        assert_eq!(m.layer_titled("version.yaml").unwrap().digest, "sha256:aa");
        assert!(m.layer_titled("bundle.json").is_none());
    }
}
