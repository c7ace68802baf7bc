//! Local contract configuration and its private key-file index.
//!
//! Layout for a configuration file `<stem>.<ext>`:
//!
//! - `<stem>.<ext>`: shareable [`ContractConfig`] (YAML).
//! - `<stem>.private.<ext>`: list of [`PrivateEntry`] pointing at key files.
//! - `<stem>.keys/`: DEK files, KEK PEM files and release policies.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use common::{CleanroomError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::dek::DekBytes;

/// KEK settings of a contract configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KekSettings {
    /// Prefix of every KEK name minted from this configuration.
    pub generate_name: String,
    /// Managed HSM or vault that holds the KEKs.
    pub hsm_url: String,
    /// Attestation authority evaluating the release predicate.
    pub maa_url: String,
}

/// Wrapped-DEK secret backing a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DekResource {
    pub secret_name: String,
    pub vault_url: String,
}

/// A datasource or datasink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    pub dek: DekResource,
    /// Remaining settings, carried through untouched.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

/// Datastores and other deployment settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    #[serde(default)]
    pub datasources: Vec<Datastore>,
    #[serde(default)]
    pub datasinks: Vec<Datastore>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

/// Shareable contract configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kek: Option<KekSettings>,
    #[serde(default)]
    pub specification: Specification,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

impl ContractConfig {
    /// KEK settings, or a [`CleanroomError::Configuration`] asking for `set-kek`.
    pub fn kek(&self) -> Result<&KekSettings> {
        self.kek.as_ref().ok_or_else(|| {
            CleanroomError::Configuration(
                "no KEK entry in the cleanroom configuration; run set-kek first".into(),
            )
        })
    }
}

/// Private index entry locating a key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateEntry {
    /// `kek/<name>`, `datasource/<name>` or `datasink/<name>`.
    pub name: String,
    pub key_file_path: PathBuf,
    /// Remote key id, once the KEK has been imported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Kind of datastore a DEK protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreKind {
    Source,
    Sink,
}

impl DatastoreKind {
    /// Private entry prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            DatastoreKind::Source => "datasource",
            DatastoreKind::Sink => "datasink",
        }
    }

    /// `<prefix>/<name>`.
    pub fn entry_name(self, name: &str) -> String {
        format!("{}/{name}", self.prefix())
    }
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Secret name of a datastore's wrapped DEK.
pub fn wrapped_dek_secret_name(name: &str) -> String {
    format!("wrapped-{name}-dek")
}

/// Private entry name of the KEK called `kek_name`.
pub fn kek_entry_name(kek_name: &str) -> String {
    format!("kek/{kek_name}")
}

/// Files derived from one configuration path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config: PathBuf,
    pub private: PathBuf,
    pub keys_dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(config: impl Into<PathBuf>) -> Self {
        let config = config.into();
        let private = match config.extension() {
            Some(ext) => config.with_extension(format!("private.{}", ext.to_string_lossy())),
            None => config.with_extension("private"),
        };
        let keys_dir = config.with_extension("keys");
        Self {
            config,
            private,
            keys_dir,
        }
    }
}

/// File-backed store of contract configuration and key files.
#[derive(Debug, Clone)]
pub struct KeyStore {
    paths: ConfigPaths,
}

impl KeyStore {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            paths: ConfigPaths::new(config_path),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Path of `file_name` inside the keys directory.
    pub fn key_path(&self, file_name: &str) -> PathBuf {
        self.paths.keys_dir.join(file_name)
    }

    /// Create an empty configuration, private index and keys directory.
    ///
    /// Returns `Ok(false)` and changes nothing if either document exists.
    pub fn init(&self) -> Result<bool> {
        for existing in [&self.paths.config, &self.paths.private] {
            if existing.exists() {
                warn!(path = %existing.display(), "already exists; doing nothing");
                return Ok(false);
            }
        }
        fs::create_dir_all(&self.paths.keys_dir)
            .map_err(|e| CleanroomError::io(&self.paths.keys_dir, e))?;
        self.save_config(&ContractConfig::default())?;
        self.save_private(&[])?;
        Ok(true)
    }

    pub fn load_config(&self) -> Result<ContractConfig> {
        read_yaml(&self.paths.config)
    }

    pub fn save_config(&self, config: &ContractConfig) -> Result<()> {
        write_yaml(&self.paths.config, config)
    }

    pub fn load_private(&self) -> Result<Vec<PrivateEntry>> {
        read_yaml::<Option<Vec<PrivateEntry>>>(&self.paths.private).map(Option::unwrap_or_default)
    }

    pub fn save_private(&self, entries: &[PrivateEntry]) -> Result<()> {
        write_yaml(&self.paths.private, &entries)
    }

    /// Record KEK settings, keeping an existing name prefix.
    pub fn set_kek(&self, hsm_url: &str, maa_url: &str) -> Result<KekSettings> {
        let mut config = self.load_config()?;
        let generate_name = match &config.kek {
            Some(existing) => existing.generate_name.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                format!("{}-", &id[..8])
            }
        };
        let settings = KekSettings {
            generate_name,
            hsm_url: hsm_url.to_owned(),
            maa_url: maa_url.to_owned(),
        };
        config.kek = Some(settings.clone());
        self.save_config(&config)?;
        info!(
            generate_name = %settings.generate_name,
            "KEK entry added to cleanroom configuration"
        );
        Ok(settings)
    }

    /// Register a datastore and create its DEK if it has none yet.
    pub fn add_datastore(
        &self,
        kind: DatastoreKind,
        name: &str,
        vault_url: &str,
    ) -> Result<Datastore> {
        let mut config = self.load_config()?;
        config.kek()?;

        fs::create_dir_all(&self.paths.keys_dir)
            .map_err(|e| CleanroomError::io(&self.paths.keys_dir, e))?;
        let key_file_path = self.key_path(&format!("{name}.bin"));
        if DekBytes::create_if_absent(&key_file_path)? {
            info!(kind = %kind, name = %name, "DEK created");
        }

        let list = match kind {
            DatastoreKind::Source => &mut config.specification.datasources,
            DatastoreKind::Sink => &mut config.specification.datasinks,
        };
        let other = list
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.other.clone())
            .unwrap_or_default();
        let datastore = Datastore {
            name: name.to_owned(),
            dek: DekResource {
                secret_name: wrapped_dek_secret_name(name),
                vault_url: vault_url.to_owned(),
            },
            other,
        };
        match list.iter_mut().find(|d| d.name == name) {
            Some(slot) => *slot = datastore.clone(),
            None => list.push(datastore.clone()),
        }

        let mut private = self.load_private()?;
        upsert(
            &mut private,
            PrivateEntry {
                name: kind.entry_name(name),
                key_file_path,
                key_id: None,
            },
        );

        self.save_config(&config)?;
        self.save_private(&private)?;
        info!(kind = %kind, name = %name, "datastore added to cleanroom configuration");
        Ok(datastore)
    }
}

/// The single entry called `name`, if any.
///
/// # Errors
///
/// [`CleanroomError::DuplicateEntry`] if more than one entry has that name.
pub fn find_unique<'a>(
    entries: &'a [PrivateEntry],
    name: &str,
) -> Result<Option<&'a PrivateEntry>> {
    let mut matches = entries.iter().filter(|e| e.name == name);
    let first = matches.next();
    if matches.next().is_some() {
        return Err(CleanroomError::DuplicateEntry(name.to_owned()));
    }
    Ok(first)
}

/// Replace the entry with the same name, or append.
pub fn upsert(entries: &mut Vec<PrivateEntry>, entry: PrivateEntry) {
    match entries.iter_mut().find(|e| e.name == entry.name) {
        Some(slot) => *slot = entry,
        None => entries.push(entry),
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CleanroomError::Configuration(format!(
            "cannot find file {}; check the cleanroom configuration path",
            path.display()
        )),
        _ => CleanroomError::io(path, e),
    })?;
    serde_yaml::from_str(&text)
        .map_err(|e| CleanroomError::InvalidDocument(format!("{}: {e}", path.display())))
}

fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| CleanroomError::InvalidDocument(format!("{}: {e}", path.display())))?;
    write_atomic(path, text.as_bytes())
}

/// Replace `path` with `bytes` via a temporary sibling and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(name);

    let written = fs::File::create(&tmp).and_then(|mut f| {
        f.write_all(bytes)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(CleanroomError::io(path, e));
    }
    Ok(())
}
