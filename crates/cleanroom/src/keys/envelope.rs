//! DEK envelope management: KEK provisioning and wrapped-secret publication.

use std::sync::Arc;

use common::protocol::WrappedSecretRef;
use common::{CleanroomError, Result};
use serde::Serialize;
use tracing::{info, instrument};

use super::dek::DekBytes;
use super::kek::{ensure_kek, load_kek, Kek, KekOptions};
use super::store::{find_unique, Datastore, DatastoreKind, DekResource, KeyStore};
use super::wrap::{parse_public_key_pem, wrap_key};
use crate::hashing::Digest;
use crate::remote::{GovernanceService, KeyReleaseService, SecretStore, WritePrecondition};

/// One wrapped DEK written to a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedDek {
    /// `datasource/<name>` or `datasink/<name>`.
    pub entry: String,
    pub secret_name: String,
    pub vault_url: String,
    /// Secret version written.
    pub version: String,
}

/// Provisions KEKs for a contract and wraps its DEKs.
#[derive(Clone)]
pub struct EnvelopeManager {
    store: KeyStore,
    keys: Arc<dyn KeyReleaseService>,
    secrets: Arc<dyn SecretStore>,
    governance: Arc<dyn GovernanceService>,
    options: KekOptions,
}

impl EnvelopeManager {
    pub fn new(
        store: KeyStore,
        keys: Arc<dyn KeyReleaseService>,
        secrets: Arc<dyn SecretStore>,
        governance: Arc<dyn GovernanceService>,
        options: KekOptions,
    ) -> Self {
        Self {
            store,
            keys,
            secrets,
            governance,
            options,
        }
    }

    /// Digest of the clean room policy governance has approved for the
    /// contract, as lower-case hex without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// [`CleanroomError::PolicyMissing`] if no proposal has been accepted or
    /// the approved host data is not a SHA-256 digest.
    pub async fn approved_policy_digest(&self, contract_id: &str) -> Result<String> {
        let policy = self.governance.cleanroom_policy(contract_id).await?;
        let hostdata = policy.hostdata().ok_or_else(|| {
            CleanroomError::PolicyMissing(format!(
                "no clean room policy found under contract '{contract_id}'; check that a \
                 policy proposal for the contract has been accepted"
            ))
        })?;
        let digest = Digest::parse(hostdata).map_err(|e| {
            CleanroomError::PolicyMissing(format!(
                "approved clean room policy for contract '{contract_id}' has invalid \
                 host data '{hostdata}': {e}"
            ))
        })?;
        Ok(digest.to_hex())
    }

    /// Ensure the contract's KEK is imported and bound to `policy_digest`.
    pub async fn ensure_kek(&self, contract_id: &str, policy_digest: &str) -> Result<Kek> {
        ensure_kek(
            &self.store,
            self.keys.as_ref(),
            contract_id,
            policy_digest,
            self.options,
        )
        .await
    }

    /// Fetch the approved policy, ensure the KEK, and wrap every DEK.
    #[instrument(skip(self))]
    pub async fn provision(&self, contract_id: &str) -> Result<Vec<WrappedDek>> {
        let digest = self.approved_policy_digest(contract_id).await?;
        self.ensure_kek(contract_id, &digest).await?;
        self.wrap_all_deks(contract_id).await
    }

    /// Wrap the DEK of every datasource and datasink under the contract's KEK
    /// and write each as a secret.
    ///
    /// The KEK's binding to the currently approved policy is re-checked first.
    #[instrument(skip(self))]
    pub async fn wrap_all_deks(&self, contract_id: &str) -> Result<Vec<WrappedDek>> {
        let kek = self.bound_kek(contract_id).await?;
        let config = self.store.load_config()?;
        let private = self.store.load_private()?;

        let stores = config
            .specification
            .datasources
            .iter()
            .map(|d| (DatastoreKind::Source, d))
            .chain(
                config
                    .specification
                    .datasinks
                    .iter()
                    .map(|d| (DatastoreKind::Sink, d)),
            );

        let mut wrapped = Vec::new();
        for (kind, datastore) in stores {
            let entry = kind.entry_name(&datastore.name);
            let key_file = find_unique(&private, &entry)?.ok_or_else(|| {
                CleanroomError::Configuration(format!(
                    "no key for {kind} with name '{}' was found",
                    datastore.name
                ))
            })?;
            let dek = DekBytes::load(&key_file.key_file_path)?;
            let version = self.publish(&kek, datastore, dek.as_bytes()).await?;
            info!(
                entry = %entry,
                secret = %datastore.dek.secret_name,
                vault = %datastore.dek.vault_url,
                "wrapped DEK written"
            );
            wrapped.push(WrappedDek {
                entry,
                secret_name: datastore.dek.secret_name.clone(),
                vault_url: datastore.dek.vault_url.clone(),
                version,
            });
        }
        Ok(wrapped)
    }

    /// Wrap an ad hoc secret under the contract's KEK and store it as `name`.
    #[instrument(skip(self, value))]
    pub async fn wrap_secret(
        &self,
        contract_id: &str,
        name: &str,
        value: &[u8],
        vault_url: &str,
    ) -> Result<WrappedSecretRef> {
        let kek = self.bound_kek(contract_id).await?;
        let precondition = self.precondition(vault_url, name).await?;
        let ciphertext = wrap_key(&kek.public_key, value)?;
        self.secrets
            .set_secret(vault_url, name, &ciphertext, &precondition)
            .await?;
        info!(secret = %name, vault = %vault_url, "wrapped secret written");

        Ok(WrappedSecretRef {
            kid: name.to_owned(),
            akv_endpoint: vault_url.to_owned(),
            kek: kek.reference(),
        })
    }

    /// The contract's KEK, provided it pins the currently approved policy and
    /// its local public key is the one held by the key-release service.
    async fn bound_kek(&self, contract_id: &str) -> Result<Kek> {
        let approved = self.approved_policy_digest(contract_id).await?;
        let kek = load_kek(&self.store, contract_id)?;
        match kek.bound_digest() {
            Some(bound) if bound == approved => {}
            bound => {
                return Err(CleanroomError::Configuration(format!(
                    "KEK '{}' is bound to policy {} but governance approved {approved}; \
                     re-create the KEK before wrapping",
                    kek.name,
                    bound.unwrap_or("<none>")
                )))
            }
        }

        let remote = parse_public_key_pem(&self.keys.get_public_key(&kek.key_id).await?)?;
        if remote != kek.public_key {
            return Err(CleanroomError::Configuration(format!(
                "local public key of KEK '{}' does not match the key held by {}",
                kek.name, kek.settings.hsm_url
            )));
        }
        Ok(kek)
    }

    async fn precondition(&self, vault_url: &str, name: &str) -> Result<WritePrecondition> {
        Ok(match self.secrets.secret_version(vault_url, name).await? {
            Some(version) => WritePrecondition::IfVersion(version),
            None => WritePrecondition::IfAbsent,
        })
    }

    async fn publish(&self, kek: &Kek, datastore: &Datastore, dek: &[u8]) -> Result<String> {
        let DekResource {
            secret_name,
            vault_url,
        } = &datastore.dek;
        let precondition = self.precondition(vault_url, secret_name).await?;
        let ciphertext = wrap_key(&kek.public_key, dek)?;
        self.secrets
            .set_secret(vault_url, secret_name, &ciphertext, &precondition)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::kek::{kek_name, KekFiles};
    use crate::keys::wrap::{public_key_pem, tests::test_key, unwrap_key, KekKeyPair};
    use crate::remote::governance::MockGovernanceService;
    use crate::remote::key_vault::{MockKeyReleaseService, MockSecretStore};
    use crate::remote::KeyId;
    use common::protocol::{CleanroomPolicy, PolicyClaims};
    use std::sync::Mutex;

    const DIGEST_A: &str = "73973b78d70cc68353426de188db5dfc57e5b766e399935fb73a61127ea26d20";
    const DIGEST_B: &str = "b53eea46a7b311974b8085e11396ba10689448e4bab449e3ae630aaf65f8e4d6";

    fn governance(hostdata: Option<&'static str>) -> MockGovernanceService {
        let mut g = MockGovernanceService::new();
        g.expect_cleanroom_policy().returning(move |_| {
            Ok(CleanroomPolicy {
                policy: hostdata.map(|h| PolicyClaims {
                    hostdata: vec![h.to_owned()],
                    other: Default::default(),
                }),
            })
        });
        g
    }

    /// Key-release service holding `test_key(remote)` after one import.
    fn releasing(remote: usize) -> MockKeyReleaseService {
        let mut keys = MockKeyReleaseService::new();
        keys.expect_import_key().times(1).returning(|req| {
            Ok(KeyId {
                vault_url: req.vault_url.clone(),
                name: req.name.clone(),
                version: Some("v1".into()),
            })
        });
        keys.expect_get_public_key()
            .returning(move |_| Ok(public_key_pem(&test_key(remote).to_public_key()).unwrap()));
        keys
    }

    fn importing() -> MockKeyReleaseService {
        releasing(0)
    }

    /// Store with KEK settings, one datasource, one datasink and a pooled key.
    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("cleanroom.yaml"));
        store.init().unwrap();
        let settings = store
            .set_kek("https://hsm.managedhsm.azure.net", "https://maa.example")
            .unwrap();
        store
            .add_datastore(DatastoreKind::Source, "input", "https://kv.vault.azure.net")
            .unwrap();
        store
            .add_datastore(DatastoreKind::Sink, "output", "https://kv.vault.azure.net")
            .unwrap();
        let files = KekFiles::new(&store, &kek_name(&settings, "c1"));
        let pem = KekKeyPair::from_private(test_key(0).clone())
            .private_pem()
            .unwrap();
        std::fs::write(files.private_pem, pem.as_bytes()).unwrap();
        (dir, store)
    }

    fn manager(
        store: KeyStore,
        keys: MockKeyReleaseService,
        secrets: MockSecretStore,
        governance: MockGovernanceService,
    ) -> EnvelopeManager {
        EnvelopeManager::new(
            store,
            Arc::new(keys),
            Arc::new(secrets),
            Arc::new(governance),
            KekOptions::default(),
        )
    }

    #[tokio::test]
    async fn provision_wraps_every_dek_conditionally() {
        let (_dir, store) = store();
        let written: Arc<Mutex<Vec<(String, String)>>> = Arc::default();

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_secret_version()
            .returning(|_, name| Ok((name == "wrapped-input-dek").then(|| "v7".to_owned())));
        let sink = written.clone();
        secrets
            .expect_set_secret()
            .times(2)
            .returning(move |_, name, value, precondition| {
                match name {
                    "wrapped-input-dek" => assert_eq!(
                        precondition,
                        &WritePrecondition::IfVersion("v7".into())
                    ),
                    _ => assert_eq!(precondition, &WritePrecondition::IfAbsent),
                }
                sink.lock()
                    .unwrap()
                    .push((name.to_owned(), value.to_owned()));
                Ok("new".into())
            });

        let m = manager(store.clone(), importing(), secrets, governance(Some(DIGEST_A)));
        let out = m.provision("c1").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entry, "datasource/input");
        assert_eq!(out[1].secret_name, "wrapped-output-dek");

        let written = written.lock().unwrap();
        let input = DekBytes::load(&store.key_path("input.bin")).unwrap();
        let (_, ciphertext) = written
            .iter()
            .find(|(n, _)| n == "wrapped-input-dek")
            .unwrap();
        assert_eq!(
            unwrap_key(test_key(0), ciphertext).unwrap().as_slice(),
            input.as_bytes()
        );
    }

    #[tokio::test]
    async fn provision_without_approved_policy() {
        let (_dir, store) = store();
        let mut keys = MockKeyReleaseService::new();
        keys.expect_import_key().times(0);
        let mut secrets = MockSecretStore::new();
        secrets.expect_set_secret().times(0);

        let m = manager(store, keys, secrets, governance(None));
        let err = m.provision("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::PolicyMissing(_)));
    }

    #[tokio::test]
    async fn prefixed_approved_digest_matches_bound_kek() {
        let (_dir, store) = store();
        let mut secrets = MockSecretStore::new();
        secrets.expect_secret_version().returning(|_, _| Ok(None));
        secrets
            .expect_set_secret()
            .times(2)
            .returning(|_, _, _, _| Ok("v1".into()));
        let m = manager(
            store,
            importing(),
            secrets,
            governance(Some(
                "sha256:73973B78D70CC68353426DE188DB5DFC57E5B766E399935FB73A61127EA26D20",
            )),
        );

        assert_eq!(m.approved_policy_digest("c1").await.unwrap(), DIGEST_A);
        let out = m.provision("c1").await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn malformed_approved_digest_is_policy_missing() {
        let (_dir, store) = store();
        let m = manager(
            store,
            MockKeyReleaseService::new(),
            MockSecretStore::new(),
            governance(Some("not-a-digest")),
        );
        let err = m.provision("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::PolicyMissing(_)));
    }

    #[tokio::test]
    async fn stale_kek_is_never_used() {
        let (_dir, store) = store();
        let m = manager(
            store.clone(),
            importing(),
            MockSecretStore::new(),
            governance(Some(DIGEST_A)),
        );
        m.ensure_kek("c1", DIGEST_A).await.unwrap();

        // Governance has since approved a different policy.
        let mut secrets = MockSecretStore::new();
        secrets.expect_set_secret().times(0);
        let m = manager(
            store,
            MockKeyReleaseService::new(),
            secrets,
            governance(Some(DIGEST_B)),
        );
        let err = m.wrap_all_deks("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::Configuration(m) if m.contains("bound")));
    }

    #[tokio::test]
    async fn wrap_without_kek_is_configuration_error() {
        let (_dir, store) = store();
        let m = manager(
            store,
            MockKeyReleaseService::new(),
            MockSecretStore::new(),
            governance(Some(DIGEST_A)),
        );
        let err = m.wrap_all_deks("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::Configuration(_)));
    }

    #[tokio::test]
    async fn concurrent_secret_change_is_a_conflict() {
        let (_dir, store) = store();
        let mut secrets = MockSecretStore::new();
        secrets.expect_secret_version().returning(|_, _| Ok(None));
        secrets.expect_set_secret().times(1).returning(|_, name, _, _| {
            Err(CleanroomError::Conflict(format!("secret '{name}' changed")))
        });
        let m = manager(store, importing(), secrets, governance(Some(DIGEST_A)));
        let err = m.provision("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn wrap_secret_returns_reference() {
        let (_dir, store) = store();
        let mut secrets = MockSecretStore::new();
        secrets.expect_secret_version().returning(|_, _| Ok(None));
        secrets
            .expect_set_secret()
            .withf(|vault, name, _, precondition| {
                vault == "https://secrets.vault.azure.net"
                    && name == "db-password"
                    && *precondition == WritePrecondition::IfAbsent
            })
            .times(1)
            .returning(|_, _, _, _| Ok("v1".into()));
        let m = manager(store, importing(), secrets, governance(Some(DIGEST_A)));
        let kek = m.ensure_kek("c1", DIGEST_A).await.unwrap();

        let r = m
            .wrap_secret("c1", "db-password", b"hunter2", "https://secrets.vault.azure.net")
            .await
            .unwrap();
        assert_eq!(r.kid, "db-password");
        assert_eq!(r.akv_endpoint, "https://secrets.vault.azure.net");
        assert_eq!(r.kek.kid, kek.name);
        assert_eq!(r.kek.akv_endpoint, "https://hsm.managedhsm.azure.net");
        assert_eq!(r.kek.maa_endpoint, "https://maa.example");
    }

    #[tokio::test]
    async fn missing_datastore_key_is_reported() {
        let (_dir, store) = store();
        let mut private = store.load_private().unwrap();
        private.retain(|e| e.name != "datasink/output");
        store.save_private(&private).unwrap();

        let mut secrets = MockSecretStore::new();
        secrets.expect_secret_version().returning(|_, _| Ok(None));
        secrets.expect_set_secret().returning(|_, _, _, _| Ok("v1".into()));
        let m = manager(store, importing(), secrets, governance(Some(DIGEST_A)));
        let err = m.provision("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::Configuration(m) if m.contains("output")));
    }

    #[tokio::test]
    async fn remote_key_must_match_local_public_key() {
        let (_dir, store) = store();
        let mut secrets = MockSecretStore::new();
        secrets.expect_set_secret().times(0);
        let m = manager(store, releasing(1), secrets, governance(Some(DIGEST_A)));
        let err = m.provision("c1").await.unwrap_err();
        assert!(matches!(err, CleanroomError::Configuration(m) if m.contains("does not match")));
    }
}
