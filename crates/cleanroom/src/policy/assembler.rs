//! Final policy assembly, digesting, and output files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::PolicyProposal;
use common::{CleanroomError, Result};
use serde_json::Value;
use tracing::{info, warn};

use super::containers::extract_containers;
use super::sidecar::SidecarDigests;
use crate::hashing::{digest_text, Digest};
use crate::remote::GovernanceService;

/// Policy file written by [`write_outputs`].
pub const POLICY_FILE: &str = "cleanroom-policy.rego";
/// Governance claims proposal written by [`write_outputs`].
pub const PROPOSAL_FILE: &str = "cleanroom-governance-policy.json";

const ALLOW_ALL_POLICY: &str = "package policy\n\napi_svn := \"0.10.0\"\n\nmount_device := {\"allowed\": true}\nmount_overlay := {\"allowed\": true}\ncreate_container := {\"allowed\": true, \"env_list\": null, \"allow_stdio_access\": true}\nunmount_device := {\"allowed\": true} \nunmount_overlay := {\"allowed\": true}\nexec_in_container := {\"allowed\": true, \"env_list\": null}\nexec_external := {\"allowed\": true, \"env_list\": null, \"allow_stdio_access\": true}\nshutdown_container := {\"allowed\": true}\nsignal_container_process := {\"allowed\": true}\nplan9_mount := {\"allowed\": true}\nplan9_unmount := {\"allowed\": true}\nget_properties := {\"allowed\": true}\ndump_stacks := {\"allowed\": true}\nruntime_logging := {\"allowed\": true}\nload_fragment := {\"allowed\": true}\nscratch_mount := {\"allowed\": true}\nscratch_unmount := {\"allowed\": true}\n";

/// Policy text and the digest that binds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPolicy {
    text: String,
    digest: Digest,
}

impl AssembledPolicy {
    /// Digest `text` exactly as it will be deployed.
    pub fn new(text: String) -> Self {
        let digest = digest_text(&text);
        Self { text, digest }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// SHA-256 of the UTF-8 text; the `hostdata` attestation claim.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Base64 of the text, for embedding into a deployment template.
    pub fn base64(&self) -> String {
        STANDARD.encode(self.text.as_bytes())
    }

    /// Governance proposal pinning this policy's digest.
    pub fn proposal(&self) -> PolicyProposal {
        PolicyProposal::add(self.digest.to_hex())
    }
}

/// Permissive debug policy that allows every enclave operation.
pub fn allow_all() -> AssembledPolicy {
    AssembledPolicy::new(ALLOW_ALL_POLICY.to_owned())
}

/// Replace each placeholder container's layers with the real digests of the
/// corresponding image.
///
/// `images[i]` names the image of the `i`-th container in `placeholder`.
///
/// # Errors
///
/// [`CleanroomError::PolicyMismatch`] if the containers block cannot be found,
/// if `images` and the containers disagree in count, if the sidecar manifest
/// does not carry exactly one entry per container, or if an image has no
/// sidecar entry.
pub fn substitute_layers(
    placeholder: &str,
    images: &[String],
    sidecar: &SidecarDigests,
) -> Result<AssembledPolicy> {
    let block = extract_containers(placeholder)?;
    let count = block.containers.len();

    if images.len() != count {
        return Err(CleanroomError::PolicyMismatch(format!(
            "policy has {count} containers but {} images were supplied",
            images.len()
        )));
    }
    if sidecar.len() != count {
        return Err(CleanroomError::PolicyMismatch(format!(
            "policy has {count} containers but the sidecar digest manifest has {} entries",
            sidecar.len()
        )));
    }

    let mut containers = block.containers.clone();
    for (container, image) in containers.iter_mut().zip(images) {
        let layers = sidecar.layers_for(image).ok_or_else(|| {
            CleanroomError::PolicyMismatch(format!(
                "no sidecar digests recorded for image '{image}'"
            ))
        })?;
        container.set_layers(layers);
    }

    let text = block.splice(placeholder, &containers)?;
    let policy = AssembledPolicy::new(text);
    info!(
        containers = count,
        digest = %policy.digest(),
        "placeholder layers substituted"
    );
    Ok(policy)
}

/// Paths written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutputs {
    pub policy: PathBuf,
    pub proposal: PathBuf,
}

/// Write the policy text and its governance proposal into `dir`.
///
/// Both files are staged under temporary names and renamed into place once
/// both have been written.
pub fn write_outputs(dir: &Path, policy: &AssembledPolicy) -> Result<PolicyOutputs> {
    if !dir.is_dir() {
        return Err(CleanroomError::Configuration(format!(
            "output folder {} does not exist",
            dir.display()
        )));
    }

    let proposal = serde_json::to_string_pretty(&policy.proposal())
        .map_err(|e| CleanroomError::InvalidDocument(format!("policy proposal: {e}")))?;

    let outputs = PolicyOutputs {
        policy: dir.join(POLICY_FILE),
        proposal: dir.join(PROPOSAL_FILE),
    };
    let staged_policy = stage(&outputs.policy, policy.text())?;
    let staged_proposal = stage(&outputs.proposal, &proposal).map_err(|e| {
        let _ = fs::remove_file(&staged_policy);
        e
    })?;
    let staged = [
        (staged_policy, &outputs.policy),
        (staged_proposal, &outputs.proposal),
    ];
    for (tmp, dest) in &staged {
        fs::rename(tmp, dest).map_err(|e| {
            let _ = fs::remove_file(tmp);
            CleanroomError::io(dest, e)
        })?;
    }
    Ok(outputs)
}

/// Submit the policy's claims proposal for `contract_id` to governance.
///
/// One attempt; a duplicate submission would open a second proposal.
pub async fn submit_proposal(
    governance: &dyn GovernanceService,
    contract_id: &str,
    policy: &AssembledPolicy,
) -> Result<Value> {
    let response = governance
        .propose_cleanroom_policy(contract_id, &policy.proposal())
        .await?;
    info!(contract_id = %contract_id, digest = %policy.digest(), "policy proposal submitted");
    Ok(response)
}

/// Write `contents` to a fresh sibling of `dest`.
fn stage(dest: &Path, contents: &str) -> Result<PathBuf> {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    let tmp = dest.with_file_name(name);

    let result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut f| {
            f.write_all(contents.as_bytes())?;
            f.sync_all()
        });
    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), error = %cleanup, "could not remove staged file");
        }
        return Err(CleanroomError::io(&tmp, e));
    }
    Ok(tmp)
}
