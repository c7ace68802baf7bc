//! Configuration loading and validation for the cleanroom tool.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if a variable the selected operation needs
//! is missing or invalid. Collaborator settings are handed to client
//! constructors from here; nothing reads the environment afterwards.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::keys::KekOptions;
use crate::remote::RemoteSettings;

/// Operation performed by one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Fetch the approved policy, ensure the KEK, wrap every DEK.
    Provision,
    /// Build the CCE policy and its governance proposal.
    AssemblePolicy,
    /// Report governance service and client versions with upgrades.
    Versions,
}

/// How `assemble-policy` produces the policy text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource<'a> {
    /// Fixed permissive policy for debugging.
    AllowAll,
    /// Run the external generator over a deployment spec.
    Generate {
        command: &'a str,
        spec: &'a PathBuf,
    },
    /// Substitute sidecar layer digests into a placeholder policy.
    Placeholder {
        policy: &'a PathBuf,
        sidecar: &'a PathBuf,
    },
}

/// Validated process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Operation to run. **Required.**
    pub operation: Operation,

    /// Path of the contract configuration document.
    pub cleanroom_config: Option<PathBuf>,

    /// Contract whose KEK and DEKs are provisioned.
    pub contract_id: Option<String>,

    /// Governance service base URL.
    pub governance_endpoint: Option<String>,

    /// `<host>[/<prefix>]` of the registry holding version documents.
    #[serde(default = "default_versions_registry")]
    pub versions_registry: String,

    /// Bearer token for the secret vault. **Required** for `provision`.
    pub key_vault_access_token: Option<String>,

    /// Bearer token for the managed HSM holding the KEK. Falls back to
    /// `KEY_VAULT_ACCESS_TOKEN` when unset.
    pub managed_hsm_access_token: Option<String>,

    /// Per-request timeout for every remote call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Keep the KEK private key on disk after a successful import.
    #[serde(default = "default_retain_kek_private_key")]
    pub retain_kek_private_key: bool,

    /// Folder receiving the assembled policy and its proposal.
    pub policy_output_dir: Option<PathBuf>,

    /// Placeholder policy generated against the stand-in image.
    pub placeholder_policy_path: Option<PathBuf>,

    /// Ordered `{image, layers}` manifest of the sidecar images.
    pub sidecar_digests_path: Option<PathBuf>,

    /// Normalized deployment spec for the external generator.
    pub deployment_spec_path: Option<PathBuf>,

    /// Generator command line, e.g. `az confcom acipolicygen`.
    pub policy_generator_command: Option<String>,

    /// Generate a debuggable policy.
    #[serde(default)]
    pub policy_debug_mode: bool,

    /// Submit the assembled policy's proposal to governance for `CONTRACT_ID`.
    #[serde(default)]
    pub submit_policy_proposal: bool,

    /// Emit the fixed allow-all policy instead of assembling one.
    #[serde(default)]
    pub allow_all: bool,

    /// Digest of the running client image, for client upgrade checks.
    pub client_digest: Option<String>,

    /// OTLP endpoint. Span export is off when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_versions_registry() -> String {
    "mcr.microsoft.com/cleanroom".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_retain_kek_private_key() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Settings for [`crate::remote::RemoteClients::init`].
    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            versions_registry: self.versions_registry.clone(),
            governance_endpoint: self.governance_endpoint.clone().unwrap_or_default(),
            key_vault_token: self.key_vault_access_token.clone(),
            managed_hsm_token: self
                .managed_hsm_access_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn kek_options(&self) -> KekOptions {
        KekOptions {
            retain_private_key: self.retain_kek_private_key,
        }
    }

    /// Policy source for `assemble-policy`. `ALLOW_ALL` wins, then the
    /// generator, then the placeholder.
    pub fn policy_source(&self) -> Result<PolicySource<'_>> {
        if self.allow_all {
            return Ok(PolicySource::AllowAll);
        }
        match (&self.policy_generator_command, &self.deployment_spec_path) {
            (Some(command), Some(spec)) => {
                return Ok(PolicySource::Generate { command, spec });
            }
            (Some(_), None) => {
                anyhow::bail!("POLICY_GENERATOR_COMMAND requires DEPLOYMENT_SPEC_PATH")
            }
            _ => {}
        }
        match (&self.placeholder_policy_path, &self.sidecar_digests_path) {
            (Some(policy), Some(sidecar)) => Ok(PolicySource::Placeholder { policy, sidecar }),
            _ => anyhow::bail!(
                "assemble-policy needs ALLOW_ALL, POLICY_GENERATOR_COMMAND with \
                 DEPLOYMENT_SPEC_PATH, or PLACEHOLDER_POLICY_PATH with SIDECAR_DIGESTS_PATH"
            ),
        }
    }

    /// Validate the fields the selected operation uses.
    fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be > 0");
        }
        ensure_non_empty(&self.log_level, "LOG_LEVEL")?;

        match self.operation {
            Operation::Provision => {
                ensure_set(&self.cleanroom_config, "CLEANROOM_CONFIG")?;
                ensure_present(&self.contract_id, "CONTRACT_ID")?;
                ensure_present(&self.governance_endpoint, "GOVERNANCE_ENDPOINT")?;
                ensure_present(&self.key_vault_access_token, "KEY_VAULT_ACCESS_TOKEN")?;
            }
            Operation::AssemblePolicy => {
                ensure_set(&self.policy_output_dir, "POLICY_OUTPUT_DIR")?;
                self.policy_source()?;
                if self.submit_policy_proposal {
                    ensure_present(&self.contract_id, "CONTRACT_ID")?;
                    ensure_present(&self.governance_endpoint, "GOVERNANCE_ENDPOINT")?;
                }
            }
            Operation::Versions => {
                ensure_present(&self.governance_endpoint, "GOVERNANCE_ENDPOINT")?;
                ensure_non_empty(&self.versions_registry, "VERSIONS_REGISTRY")?;
            }
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

fn ensure_present(value: &Option<String>, name: &str) -> Result<()> {
    ensure_non_empty(value.as_deref().unwrap_or_default(), name)
}

fn ensure_set(value: &Option<PathBuf>, name: &str) -> Result<()> {
    match value {
        Some(path) if !path.as_os_str().is_empty() => Ok(()),
        _ => anyhow::bail!("{name} is required and must not be empty"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(operation: Operation) -> Config {
        Config {
            operation,
            cleanroom_config: Some("/work/cleanroom.yaml".into()),
            contract_id: Some("contract-1".into()),
            governance_endpoint: Some("https://ccf.example".into()),
            versions_registry: default_versions_registry(),
            key_vault_access_token: Some("token".into()),
            managed_hsm_access_token: Some("hsm-token".into()),
            request_timeout_secs: default_request_timeout(),
            retain_kek_private_key: default_retain_kek_private_key(),
            policy_output_dir: Some("/work/out".into()),
            placeholder_policy_path: Some("/work/placeholder.rego".into()),
            sidecar_digests_path: Some("/work/sidecar-digests.yaml".into()),
            deployment_spec_path: None,
            policy_generator_command: None,
            policy_debug_mode: false,
            submit_policy_proposal: false,
            allow_all: false,
            client_digest: None,
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_versions_registry(), "mcr.microsoft.com/cleanroom");
        assert_eq!(default_request_timeout(), 30);
        assert!(default_retain_kek_private_key());
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn complete_configs_validate() {
        for op in [
            Operation::Provision,
            Operation::AssemblePolicy,
            Operation::Versions,
        ] {
            assert!(base(op).validate().is_ok(), "{op:?}");
        }
    }

    #[test]
    fn provision_requires_contract_and_token() {
        let mut cfg = base(Operation::Provision);
        cfg.contract_id = Some("  ".into());
        assert!(cfg.validate().is_err());

        let mut cfg = base(Operation::Provision);
        cfg.key_vault_access_token = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn versions_does_not_need_key_material() {
        let mut cfg = base(Operation::Versions);
        cfg.cleanroom_config = None;
        cfg.key_vault_access_token = None;
        cfg.policy_output_dir = None;
        assert!(cfg.validate().is_ok());

        cfg.governance_endpoint = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn policy_source_precedence() {
        let mut cfg = base(Operation::AssemblePolicy);
        assert!(matches!(
            cfg.policy_source().unwrap(),
            PolicySource::Placeholder { .. }
        ));

        cfg.policy_generator_command = Some("az confcom acipolicygen".into());
        assert!(cfg.policy_source().is_err());
        cfg.deployment_spec_path = Some("/work/deployment.json".into());
        assert!(matches!(
            cfg.policy_source().unwrap(),
            PolicySource::Generate { command: "az confcom acipolicygen", .. }
        ));

        cfg.allow_all = true;
        assert_eq!(cfg.policy_source().unwrap(), PolicySource::AllowAll);
    }

    #[test]
    fn assemble_requires_a_policy_source() {
        let mut cfg = base(Operation::AssemblePolicy);
        cfg.sidecar_digests_path = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn proposal_submission_needs_contract() {
        let mut cfg = base(Operation::AssemblePolicy);
        cfg.submit_policy_proposal = true;
        assert!(cfg.validate().is_ok());
        cfg.contract_id = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_managed_hsm_token_is_unset() {
        let mut cfg = base(Operation::Provision);
        cfg.managed_hsm_access_token = Some(" ".into());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.remote_settings().managed_hsm_token, None);
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = base(Operation::Versions);
        cfg.request_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn remote_settings_carry_explicit_values() {
        let cfg = base(Operation::Provision);
        let s = cfg.remote_settings();
        assert_eq!(s.governance_endpoint, "https://ccf.example");
        assert_eq!(s.key_vault_token.as_deref(), Some("token"));
        assert_eq!(s.managed_hsm_token.as_deref(), Some("hsm-token"));
        assert_eq!(s.request_timeout, Duration::from_secs(30));
        assert!(cfg.kek_options().retain_private_key);
    }
}
