//! `cleanroom` binary entry point.
//!
//! One operation per invocation, selected by `OPERATION`:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP export).
//! 3. Run `provision`, `assemble-policy` or `versions`.
//! 4. Print the operation's result as JSON on stdout.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use cleanroom::config::{Config, Operation, PolicySource};
use cleanroom::keys::{EnvelopeManager, KeyStore};
use cleanroom::policy::{self, generator, AssembledPolicy, ProcessPolicyGenerator, SidecarDigests};
use cleanroom::remote::RemoteClients;
use cleanroom::telemetry;
use cleanroom::version::VersionResolver;
use common::CleanroomError;

/// Generator output, kept beside the assembled policy.
const GENERATED_POLICY_FILE: &str = "generated-policy.rego";

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        operation = ?cfg.operation,
        "cleanroom starting"
    );

    // -----------------------------------------------------------------------
    // 3. Operation
    // -----------------------------------------------------------------------
    let outcome = match cfg.operation {
        Operation::Provision => provision(&cfg).await,
        Operation::AssemblePolicy => assemble_policy(&cfg).await,
        Operation::Versions => versions(&cfg).await,
    };

    // -----------------------------------------------------------------------
    // 4. Result
    // -----------------------------------------------------------------------
    let result = outcome.and_then(|value| {
        let text = serde_json::to_string_pretty(&value).context("failed to render result")?;
        println!("{text}");
        Ok(())
    });
    if let Err(e) = &result {
        let code = e
            .downcast_ref::<CleanroomError>()
            .map_or("internal", CleanroomError::code);
        error!(code, error = %format!("{e:#}"), "operation failed");
    }
    telemetry::shutdown_telemetry();
    result
}

async fn provision(cfg: &Config) -> Result<Value> {
    let (Some(config_path), Some(contract_id)) = (&cfg.cleanroom_config, &cfg.contract_id)
    else {
        anyhow::bail!("provision needs CLEANROOM_CONFIG and CONTRACT_ID");
    };
    let clients = RemoteClients::init(&cfg.remote_settings())?;
    let manager = EnvelopeManager::new(
        KeyStore::new(config_path),
        clients.keys,
        clients.secrets,
        clients.governance,
        cfg.kek_options(),
    );

    let wrapped = manager.provision(contract_id).await?;
    info!(contract_id = %contract_id, wrapped = wrapped.len(), "provisioning complete");
    Ok(json!({ "contractId": contract_id, "wrapped": wrapped }))
}

async fn assemble_policy(cfg: &Config) -> Result<Value> {
    let Some(output_dir) = &cfg.policy_output_dir else {
        anyhow::bail!("assemble-policy needs POLICY_OUTPUT_DIR");
    };

    let assembled = match cfg.policy_source()? {
        PolicySource::AllowAll => {
            warn!("using the allow-all debug policy");
            policy::allow_all()
        }
        PolicySource::Generate { command, spec } => {
            let runner = ProcessPolicyGenerator::from_command_line(
                command,
                output_dir.join(GENERATED_POLICY_FILE),
            )?;
            generator::generate(&runner, spec, cfg.policy_debug_mode).await?
        }
        PolicySource::Placeholder { policy, sidecar } => {
            from_placeholder(policy, &SidecarDigests::load(sidecar)?)?
        }
    };

    let outputs = policy::write_outputs(output_dir, &assembled)?;
    info!(
        digest = %assembled.digest(),
        policy = %outputs.policy.display(),
        "policy assembled"
    );

    let submitted = match (&cfg.contract_id, cfg.submit_policy_proposal) {
        (Some(contract_id), true) => {
            let clients = RemoteClients::init(&cfg.remote_settings())?;
            let governance = clients.governance.as_ref();
            Some(policy::submit_proposal(governance, contract_id, &assembled).await?)
        }
        _ => None,
    };

    Ok(json!({
        "policyDigest": assembled.digest().to_hex(),
        "policyFile": outputs.policy,
        "proposalFile": outputs.proposal,
        "policyBase64": assembled.base64(),
        "proposal": submitted,
    }))
}

/// Substitute sidecar layers into the placeholder; the sidecar manifest's
/// order names the image of each container.
fn from_placeholder(path: &Path, sidecar: &SidecarDigests) -> Result<AssembledPolicy> {
    let text = std::fs::read_to_string(path).map_err(|e| CleanroomError::io(path, e))?;
    Ok(policy::substitute_layers(&text, &sidecar.images(), sidecar)?)
}

async fn versions(cfg: &Config) -> Result<Value> {
    let clients = RemoteClients::init(&cfg.remote_settings())?;
    let resolver = VersionResolver::new(clients.registry.clone());

    let service = resolver.service_versions(clients.governance.as_ref()).await?;
    let service_upgrades = match resolver.service_upgrades(clients.governance.as_ref()).await {
        Ok(upgrades) => Some(upgrades),
        Err(CleanroomError::NotFound(reason)) => {
            warn!(%reason, "service upgrades not determined");
            None
        }
        Err(e) => return Err(e.into()),
    };
    let client = match &cfg.client_digest {
        Some(digest) => Some(resolver.client_upgrades(digest).await?),
        None => None,
    };

    Ok(json!({
        "service": service,
        "serviceUpgrades": service_upgrades,
        "client": client,
    }))
}
