//! Key-release service (vault / managed HSM) and wrapped-secret store.
//!
//! Both capabilities are reached over the Key Vault REST API. Managed HSM
//! and standard vault URLs differ only in the bearer token sent: requests to
//! a `*.managedhsm.azure.net` host carry the HSM token.

use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::protocol::SkrPolicy;
use common::{CleanroomError, Result};
use reqwest::Method;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::http::{self, join_url, HttpClient};
use crate::keys::wrap::parse_private_key_pem;

const API_VERSION: &str = "7.4";
const MANAGED_HSM_HOST_SUFFIX: &str = ".managedhsm.azure.net";

/// Operations a KEK may be used for inside the key-release service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyOperation {
    /// Encrypt arbitrary data with the public half.
    Encrypt,
    /// Wrap another key with the public half.
    WrapKey,
}

/// Import options for a KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Exportable under the release policy.
    pub exportable: bool,
    /// HSM-protected.
    pub hsm: bool,
    /// Permitted operations.
    pub ops: Vec<KeyOperation>,
}

impl ImportOptions {
    /// Exportable-under-policy, HSM-protected, `encrypt` + `wrapKey` only.
    pub fn release_under_policy() -> Self {
        Self {
            exportable: true,
            hsm: true,
            ops: vec![KeyOperation::Encrypt, KeyOperation::WrapKey],
        }
    }
}

/// Request to import a KEK together with its release predicate.
pub struct KeyImportRequest {
    /// Vault or managed HSM URL.
    pub vault_url: String,
    /// Deterministic key name.
    pub name: String,
    /// PEM-encoded private key; zeroed on drop.
    pub private_key_pem: Zeroizing<String>,
    /// Secure-key-release predicate.
    pub release_policy: SkrPolicy,
    /// Import options.
    pub options: ImportOptions,
}

impl fmt::Debug for KeyImportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyImportRequest")
            .field("vault_url", &self.vault_url)
            .field("name", &self.name)
            .field("private_key_pem", &"[REDACTED]")
            .field("release_policy", &self.release_policy)
            .field("options", &self.options)
            .finish()
    }
}

/// Identity of an imported key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyId {
    /// Vault or managed HSM URL.
    pub vault_url: String,
    /// Key name.
    pub name: String,
    /// Key version, when reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl KeyId {
    /// `https://<vault>/keys/<name>[/<version>]`.
    pub fn kid(&self) -> String {
        let base = join_url(&self.vault_url, &format!("keys/{}", self.name));
        match &self.version {
            Some(v) => format!("{base}/{v}"),
            None => base,
        }
    }
}

/// Condition a secret write is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The secret must not exist yet.
    IfAbsent,
    /// The secret's current version must still be this one.
    IfVersion(String),
}

/// Remote key-release service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyReleaseService: Send + Sync {
    /// Import a private key under a release policy.
    async fn import_key(&self, request: &KeyImportRequest) -> Result<KeyId>;

    /// PEM (SPKI) public key of an imported key.
    async fn get_public_key(&self, key: &KeyId) -> Result<String>;
}

/// Store for wrapped secret values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current version of secret `name`, or `None` if it does not exist.
    async fn secret_version(&self, vault_url: &str, name: &str) -> Result<Option<String>>;

    /// Write `value` under `name` if `precondition` still holds, returning
    /// the new version.
    async fn set_secret(
        &self,
        vault_url: &str,
        name: &str,
        value: &str,
        precondition: &WritePrecondition,
    ) -> Result<String>;
}

/// Key Vault REST client.
#[derive(Clone)]
pub struct KeyVaultClient {
    http: HttpClient,
    vault_token: Option<Zeroizing<String>>,
    managed_hsm_token: Option<Zeroizing<String>>,
}

impl fmt::Debug for KeyVaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |t: &Option<Zeroizing<String>>| t.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("KeyVaultClient")
            .field("vault_token", &redacted(&self.vault_token))
            .field("managed_hsm_token", &redacted(&self.managed_hsm_token))
            .finish()
    }
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Deserialize)]
struct SecretBundle {
    id: String,
}

impl KeyVaultClient {
    /// Create a client. `managed_hsm_token` authenticates managed HSM
    /// requests and falls back to `vault_token` when unset.
    pub fn new(
        http: HttpClient,
        vault_token: Option<String>,
        managed_hsm_token: Option<String>,
    ) -> Self {
        Self {
            http,
            vault_token: vault_token.map(Zeroizing::new),
            managed_hsm_token: managed_hsm_token.map(Zeroizing::new),
        }
    }

    /// Bearer token for a request to `url`.
    fn token_for(&self, url: &str) -> Option<&str> {
        let token = if is_managed_hsm(url) {
            self.managed_hsm_token.as_ref().or(self.vault_token.as_ref())
        } else {
            self.vault_token.as_ref()
        };
        token.map(|t| t.as_str())
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url, self.token_for(url))
    }
}

fn is_managed_hsm(url: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with(MANAGED_HSM_HOST_SUFFIX)))
        .unwrap_or(false)
}

#[async_trait]
impl KeyReleaseService for KeyVaultClient {
    async fn import_key(&self, request: &KeyImportRequest) -> Result<KeyId> {
        let url = format!(
            "{}?api-version={API_VERSION}",
            join_url(&request.vault_url, &format!("keys/{}", request.name))
        );
        let body = import_body(request)?;

        let builder = self.request(Method::PUT, &url).json(&body);
        let resp = http::send_expect(&Method::PUT, &url, builder).await?;
        let bundle: KeyBundle = http::json_body(&Method::PUT, &url, resp).await?;

        let version = bundle.key.kid.as_deref().and_then(last_segment);
        info!(name = %request.name, version = ?version, "KEK imported");
        Ok(KeyId {
            vault_url: request.vault_url.clone(),
            name: request.name.clone(),
            version,
        })
    }

    async fn get_public_key(&self, key: &KeyId) -> Result<String> {
        let url = format!("{}?api-version={API_VERSION}", key.kid());
        let builder = self.request(Method::GET, &url);
        let resp = http::send_expect(&Method::GET, &url, builder).await?;
        let bundle: KeyBundle = http::json_body(&Method::GET, &url, resp).await?;

        let (n, e) = match (bundle.key.n, bundle.key.e) {
            (Some(n), Some(e)) => (n, e),
            _ => {
                return Err(CleanroomError::InvalidDocument(format!(
                    "key {} has no RSA public components",
                    key.name
                )))
            }
        };
        let n = decode_b64url(&n)?;
        let e = decode_b64url(&e)?;
        let public = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map_err(|e| CleanroomError::Crypto(format!("invalid RSA public key: {e}")))?;
        public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CleanroomError::Crypto(format!("public key encoding: {e}")))
    }
}

#[async_trait]
impl SecretStore for KeyVaultClient {
    async fn secret_version(&self, vault_url: &str, name: &str) -> Result<Option<String>> {
        let url = format!(
            "{}?api-version={API_VERSION}",
            join_url(vault_url, &format!("secrets/{name}"))
        );
        let builder = self.request(Method::GET, &url);
        match http::send(&Method::GET, &url, builder, true).await? {
            Some(resp) => {
                let bundle: SecretBundle = http::json_body(&Method::GET, &url, resp).await?;
                Ok(last_segment(&bundle.id))
            }
            None => Ok(None),
        }
    }

    async fn set_secret(
        &self,
        vault_url: &str,
        name: &str,
        value: &str,
        precondition: &WritePrecondition,
    ) -> Result<String> {
        // Key Vault secrets have no native conditional write; re-read the
        // current version immediately before writing.
        let current = self.secret_version(vault_url, name).await?;
        check_precondition(name, precondition, current.as_deref())?;

        let url = format!(
            "{}?api-version={API_VERSION}",
            join_url(vault_url, &format!("secrets/{name}"))
        );
        let builder = self
            .request(Method::PUT, &url)
            .json(&json!({ "value": value }));
        let resp = http::send_expect(&Method::PUT, &url, builder).await?;
        let bundle: SecretBundle = http::json_body(&Method::PUT, &url, resp).await?;
        debug!(secret = %name, "secret written");
        last_segment(&bundle.id).ok_or_else(|| {
            CleanroomError::InvalidDocument(format!("secret id '{}' has no version", bundle.id))
        })
    }
}

/// Fail with [`CleanroomError::Conflict`] if `current` violates `precondition`.
pub fn check_precondition(
    name: &str,
    precondition: &WritePrecondition,
    current: Option<&str>,
) -> Result<()> {
    match (precondition, current) {
        (WritePrecondition::IfAbsent, None) => Ok(()),
        (WritePrecondition::IfAbsent, Some(v)) => Err(CleanroomError::Conflict(format!(
            "secret '{name}' was created concurrently (version {v})"
        ))),
        (WritePrecondition::IfVersion(expected), Some(v)) if v == expected => Ok(()),
        (WritePrecondition::IfVersion(expected), found) => Err(CleanroomError::Conflict(format!(
            "secret '{name}' changed concurrently: expected version {expected}, found {}",
            found.unwrap_or("none")
        ))),
    }
}

/// Key Vault import body: RSA-HSM JWK, exportable attribute, release policy.
fn import_body(request: &KeyImportRequest) -> Result<serde_json::Value> {
    let key = parse_private_key_pem(&request.private_key_pem)?;
    let b64 = |n: &BigUint| URL_SAFE_NO_PAD.encode(n.to_bytes_be());

    let primes = key.primes();
    if primes.len() != 2 {
        return Err(CleanroomError::Crypto(
            "multi-prime RSA keys cannot be imported".into(),
        ));
    }
    let missing = || CleanroomError::Crypto("RSA key lacks CRT parameters".into());
    let dp = key.dp().ok_or_else(missing)?;
    let dq = key.dq().ok_or_else(missing)?;
    let qi = key.crt_coefficient().ok_or_else(missing)?;

    let policy = serde_json::to_vec(&request.release_policy)
        .map_err(|e| CleanroomError::InvalidDocument(format!("release policy: {e}")))?;

    Ok(json!({
        "key": {
            "kty": if request.options.hsm { "RSA-HSM" } else { "RSA" },
            "key_ops": request.options.ops,
            "n": b64(key.n()),
            "e": b64(key.e()),
            "d": b64(key.d()),
            "p": b64(&primes[0]),
            "q": b64(&primes[1]),
            "dp": b64(dp),
            "dq": b64(dq),
            "qi": b64(&qi),
        },
        "hsm": request.options.hsm,
        "attributes": { "exportable": request.options.exportable },
        "release_policy": {
            "contentType": "application/json; charset=utf-8",
            "data": URL_SAFE_NO_PAD.encode(policy),
            "immutable": false,
        },
    }))
}

fn decode_b64url(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| CleanroomError::InvalidDocument(format!("invalid base64url: {e}")))
}

fn last_segment(id: &str) -> Option<String> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::skr::build_skr_policy;
    use crate::keys::wrap::{tests::test_key, KekKeyPair};

    fn request() -> KeyImportRequest {
        let pair = KekKeyPair::from_private(test_key(0).clone());
        KeyImportRequest {
            vault_url: "https://hsm.managedhsm.azure.net".into(),
            name: "abcd1234-contract".into(),
            private_key_pem: pair.private_pem().unwrap(),
            release_policy: build_skr_policy("deadbeef", "https://maa.example"),
            options: ImportOptions::release_under_policy(),
        }
    }

    #[test]
    fn import_body_shape() {
        let body = import_body(&request()).unwrap();
        assert_eq!(body["key"]["kty"], "RSA-HSM");
        assert_eq!(body["key"]["key_ops"], json!(["encrypt", "wrapKey"]));
        assert_eq!(body["attributes"]["exportable"], true);
        assert_eq!(body["hsm"], true);
        for field in ["n", "e", "d", "p", "q", "dp", "dq", "qi"] {
            assert!(body["key"][field].as_str().is_some(), "missing {field}");
        }

        let data = body["release_policy"]["data"].as_str().unwrap();
        let policy: SkrPolicy =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(data).unwrap()).unwrap();
        assert_eq!(policy.claim_value("x-ms-sevsnpvm-hostdata"), Some("deadbeef"));
    }

    #[test]
    fn import_request_debug_redacts_key() {
        let r = request();
        let s = format!("{r:?}");
        assert!(s.contains("REDACTED"));
        assert!(!s.contains("PRIVATE KEY"));
    }

    fn client(managed_hsm_token: Option<&str>) -> KeyVaultClient {
        let http = HttpClient::new(std::time::Duration::from_secs(5)).unwrap();
        KeyVaultClient::new(
            http,
            Some("vault-token".into()),
            managed_hsm_token.map(str::to_owned),
        )
    }

    fn bearer(client: &KeyVaultClient, url: &str) -> Option<String> {
        let req = client.request(Method::GET, url).build().unwrap();
        req.headers()
            .get(reqwest::header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_owned())
    }

    #[test]
    fn requests_carry_the_token_for_their_host() {
        let c = client(Some("hsm-token"));
        assert_eq!(
            bearer(&c, "https://hsm.managedhsm.azure.net/keys/k?api-version=7.4").as_deref(),
            Some("Bearer hsm-token")
        );
        assert_eq!(
            bearer(&c, "https://kv.vault.azure.net/secrets/s?api-version=7.4").as_deref(),
            Some("Bearer vault-token")
        );
        // Suffix match on the host only.
        assert_eq!(
            bearer(&c, "https://kv.vault.azure.net/keys/x.managedhsm.azure.net").as_deref(),
            Some("Bearer vault-token")
        );
    }

    #[test]
    fn managed_hsm_falls_back_to_vault_token() {
        let c = client(None);
        assert_eq!(
            c.token_for("https://hsm.managedhsm.azure.net/keys/k"),
            Some("vault-token")
        );
        let s = format!("{c:?}");
        assert!(!s.contains("vault-token"));
    }

    #[test]
    fn key_id_formats_kid() {
        let id = KeyId {
            vault_url: "https://kv.vault.azure.net/".into(),
            name: "k".into(),
            version: Some("v1".into()),
        };
        assert_eq!(id.kid(), "https://kv.vault.azure.net/keys/k/v1");
    }

    #[test]
    fn last_segment_of_ids() {
        assert_eq!(
            last_segment("https://kv.vault.azure.net/secrets/s/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(last_segment(""), None);
    }

    #[test]
    fn preconditions() {
        assert!(check_precondition("s", &WritePrecondition::IfAbsent, None).is_ok());
        assert!(matches!(
            check_precondition("s", &WritePrecondition::IfAbsent, Some("v1")),
            Err(CleanroomError::Conflict(_))
        ));
        let v1 = WritePrecondition::IfVersion("v1".into());
        assert!(check_precondition("s", &v1, Some("v1")).is_ok());
        assert!(matches!(
            check_precondition("s", &v1, Some("v2")),
            Err(CleanroomError::Conflict(_))
        ));
        assert!(matches!(
            check_precondition("s", &v1, None),
            Err(CleanroomError::Conflict(_))
        ));
    }
}
