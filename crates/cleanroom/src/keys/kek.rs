//! Per-contract key encryption keys.
//!
//! A KEK is named `<generateName><contractId>` and lives in the keys directory
//! as three files:
//!
//! - `<name>.pem`: PKCS#1 private key (removed after import unless retained)
//! - `<name>.pub.pem`: SPKI public key used for wrapping
//! - `<name>.skr.json`: release predicate sent with the import
//!
//! The private index entry `kek/<name>` records the remote key id once the
//! import has succeeded. That id, not the presence of the PEM file, decides
//! whether a KEK is reused.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use common::protocol::{KekRef, SkrPolicy};
use common::{CleanroomError, Result};
use rsa::RsaPublicKey;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::skr::{self, bound_digest, build_skr_policy};
use super::store::{
    find_unique, kek_entry_name, upsert, write_atomic, KekSettings, KeyStore, PrivateEntry,
};
use super::wrap::{generate_keypair, parse_private_key_pem, parse_public_key_pem, KekKeyPair};
use crate::hashing::Digest;
use crate::remote::{ImportOptions, KeyId, KeyImportRequest, KeyReleaseService};

/// Handling of local KEK material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KekOptions {
    /// Keep the private PEM after a successful import.
    pub retain_private_key: bool,
}

impl Default for KekOptions {
    fn default() -> Self {
        Self {
            retain_private_key: true,
        }
    }
}

/// An imported KEK.
#[derive(Debug, Clone)]
pub struct Kek {
    pub name: String,
    pub key_id: KeyId,
    pub public_key: RsaPublicKey,
    pub release_policy: SkrPolicy,
    pub settings: KekSettings,
}

impl Kek {
    /// Policy digest the release predicate pins.
    pub fn bound_digest(&self) -> Option<&str> {
        bound_digest(&self.release_policy)
    }

    /// Reference recorded next to every wrapped value.
    pub fn reference(&self) -> KekRef {
        KekRef {
            kid: self.name.clone(),
            akv_endpoint: self.settings.hsm_url.clone(),
            maa_endpoint: self.settings.maa_url.clone(),
        }
    }
}

/// Local files of a KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KekFiles {
    pub private_pem: PathBuf,
    pub public_pem: PathBuf,
    pub release_policy: PathBuf,
}

impl KekFiles {
    pub fn new(store: &KeyStore, name: &str) -> Self {
        Self {
            private_pem: store.key_path(&format!("{name}.pem")),
            public_pem: store.key_path(&format!("{name}.pub.pem")),
            release_policy: store.key_path(&format!("{name}.skr.json")),
        }
    }
}

/// Name of the KEK for `contract_id`.
pub fn kek_name(settings: &KekSettings, contract_id: &str) -> String {
    format!("{}{contract_id}", settings.generate_name)
}

/// Return the KEK for `contract_id`, creating and importing it if needed.
///
/// An imported KEK whose release predicate already pins `policy_digest` is
/// reused without contacting the key-release service. A KEK bound to a
/// different digest is replaced by a freshly generated one.
///
/// # Errors
///
/// - [`CleanroomError::Configuration`] if no KEK settings exist.
/// - [`CleanroomError::PolicyMissing`] if `policy_digest` is not a digest.
/// - [`CleanroomError::Conflict`] if another process is creating the same KEK.
pub async fn ensure_kek(
    store: &KeyStore,
    keys: &dyn KeyReleaseService,
    contract_id: &str,
    policy_digest: &str,
    options: KekOptions,
) -> Result<Kek> {
    let settings = store.load_config()?.kek()?.clone();
    let digest = Digest::parse(policy_digest).map_err(|e| {
        CleanroomError::PolicyMissing(format!(
            "no valid clean room policy digest for contract '{contract_id}': {e}"
        ))
    })?;
    let digest = digest.to_hex();

    let name = kek_name(&settings, contract_id);
    let files = KekFiles::new(store, &name);
    let entry_name = kek_entry_name(&name);
    let mut private = store.load_private()?;

    if let Some(entry) = find_unique(&private, &entry_name)? {
        if let Some(kid) = &entry.key_id {
            let kek = load_imported(&files, &settings, &name, kid)?;
            if kek.bound_digest() == Some(digest.as_str()) {
                debug!(kek = %name, "reusing imported KEK");
                return Ok(kek);
            }
            warn!(
                kek = %name,
                bound = ?kek.bound_digest(),
                approved = %digest,
                "KEK is bound to a different policy; replacing it"
            );
            // Forget the import before the material it points at.
            upsert(
                &mut private,
                PrivateEntry {
                    name: entry_name.clone(),
                    key_file_path: files.private_pem.clone(),
                    key_id: None,
                },
            );
            store.save_private(&private)?;
            remove_local_files(&files)?;
        }
    }

    let pair = load_or_create_private_key(&files.private_pem)?;
    let release_policy = build_skr_policy(&digest, &settings.maa_url);
    write_atomic(&files.release_policy, skr::to_json(&release_policy)?.as_bytes())?;
    write_atomic(&files.public_pem, pair.public_pem()?.as_bytes())?;

    // Record the entry before importing so a failed import is retried with
    // the same key material.
    upsert(
        &mut private,
        PrivateEntry {
            name: entry_name.clone(),
            key_file_path: files.private_pem.clone(),
            key_id: None,
        },
    );
    store.save_private(&private)?;

    let request = KeyImportRequest {
        vault_url: settings.hsm_url.clone(),
        name: name.clone(),
        private_key_pem: pair.private_pem()?,
        release_policy: release_policy.clone(),
        options: ImportOptions::release_under_policy(),
    };
    let key_id = keys.import_key(&request).await?;
    drop(request);

    upsert(
        &mut private,
        PrivateEntry {
            name: entry_name,
            key_file_path: files.private_pem.clone(),
            key_id: Some(key_id.kid()),
        },
    );
    store.save_private(&private)?;

    if !options.retain_private_key {
        erase_file(&files.private_pem)?;
        info!(kek = %name, "local KEK private key erased after import");
    }

    info!(kek = %name, vault = %settings.hsm_url, "KEK provisioned");
    Ok(Kek {
        name,
        key_id,
        public_key: pair.public_key(),
        release_policy,
        settings,
    })
}

/// The imported KEK for `contract_id`.
///
/// # Errors
///
/// [`CleanroomError::Configuration`] if no KEK has been imported yet.
pub fn load_kek(store: &KeyStore, contract_id: &str) -> Result<Kek> {
    let settings = store.load_config()?.kek()?.clone();
    let name = kek_name(&settings, contract_id);
    let private = store.load_private()?;
    let kid = find_unique(&private, &kek_entry_name(&name))?
        .and_then(|e| e.key_id.clone())
        .ok_or_else(|| {
            CleanroomError::Configuration(format!(
                "KEK '{name}' not found; create the KEK for contract '{contract_id}' first"
            ))
        })?;
    load_imported(&KekFiles::new(store, &name), &settings, &name, &kid)
}

fn load_imported(
    files: &KekFiles,
    settings: &KekSettings,
    name: &str,
    kid: &str,
) -> Result<Kek> {
    let release_policy = skr::load(&files.release_policy)?;
    let public_key = match fs::read_to_string(&files.public_pem) {
        Ok(pem) => parse_public_key_pem(&pem)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let pem = Zeroizing::new(
                fs::read_to_string(&files.private_pem)
                    .map_err(|e| CleanroomError::io(&files.private_pem, e))?,
            );
            parse_private_key_pem(&pem)?.to_public_key()
        }
        Err(e) => return Err(CleanroomError::io(&files.public_pem, e)),
    };
    Ok(Kek {
        name: name.to_owned(),
        key_id: key_id_from_kid(&settings.hsm_url, name, kid),
        public_key,
        release_policy,
        settings: settings.clone(),
    })
}

fn key_id_from_kid(vault_url: &str, name: &str, kid: &str) -> KeyId {
    let marker = format!("/keys/{name}/");
    let version = kid
        .find(&marker)
        .map(|i| &kid[i + marker.len()..])
        .filter(|v| !v.is_empty())
        .map(str::to_owned);
    KeyId {
        vault_url: vault_url.to_owned(),
        name: name.to_owned(),
        version,
    }
}

/// Read the private key at `path`, or generate one with exclusive create.
fn load_or_create_private_key(path: &Path) -> Result<KekKeyPair> {
    match fs::read_to_string(path) {
        Ok(pem) => {
            let pem = Zeroizing::new(pem);
            debug!(path = %path.display(), "importing existing KEK key file");
            return Ok(KekKeyPair::from_private(parse_private_key_pem(&pem)?));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CleanroomError::io(path, e)),
    }

    let pair = generate_keypair()?;
    let pem = pair.private_pem()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => CleanroomError::Conflict(format!(
                "KEK key file {} was created concurrently",
                path.display()
            )),
            _ => CleanroomError::io(path, e),
        })?;
    file.write_all(pem.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| CleanroomError::io(path, e))?;
    info!(path = %path.display(), "KEK key pair generated");
    Ok(pair)
}

fn remove_local_files(files: &KekFiles) -> Result<()> {
    erase_file(&files.private_pem)?;
    for path in [&files.public_pem, &files.release_policy] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CleanroomError::io(path, e)),
        }
    }
    Ok(())
}

/// Overwrite `path` with zeroes, then remove it. Missing files are ignored.
fn erase_file(path: &Path) -> Result<()> {
    let len = match fs::metadata(path) {
        Ok(m) => m.len() as usize,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CleanroomError::io(path, e)),
    };
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut f| {
            f.write_all(&vec![0u8; len])?;
            f.sync_all()
        })
        .and_then(|_| fs::remove_file(path))
        .map_err(|e| CleanroomError::io(path, e))
}
