//! Base policy generation from a deployment specification.
//!
//! Generation is delegated to an external tool; this module only runs it and
//! reads back the policy text it produced.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::{CleanroomError, Result};
use tokio::process::Command;
use tracing::{debug, info};

use super::assembler::AssembledPolicy;

/// External policy generator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyGenerator: Send + Sync {
    /// Generate policy text for the normalized deployment spec at `spec`.
    async fn generate(&self, spec: &Path, debug_mode: bool) -> Result<String>;
}

/// Generate the base policy and its digest.
pub async fn generate(
    generator: &dyn PolicyGenerator,
    spec: &Path,
    debug_mode: bool,
) -> Result<AssembledPolicy> {
    let text = generator.generate(spec, debug_mode).await?;
    if text.trim().is_empty() {
        return Err(CleanroomError::InvalidDocument(
            "policy generator produced an empty policy".into(),
        ));
    }
    let policy = AssembledPolicy::new(text);
    info!(digest = %policy.digest(), "policy generated");
    Ok(policy)
}

/// [`PolicyGenerator`] that runs a command line such as
/// `az confcom acipolicygen`.
///
/// The command is invoked as
/// `<program> <args..> -i <spec> --outraw-pretty-print -s <output> [--debug-mode]`.
#[derive(Debug, Clone)]
pub struct ProcessPolicyGenerator {
    program: String,
    args: Vec<String>,
    output: PathBuf,
}

impl ProcessPolicyGenerator {
    /// Parse a whitespace-separated command line; the policy is written to
    /// `output`.
    pub fn from_command_line(command: &str, output: PathBuf) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_owned);
        let program = parts.next().ok_or_else(|| {
            CleanroomError::Configuration("policy generator command is empty".into())
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            output,
        })
    }
}

#[async_trait]
impl PolicyGenerator for ProcessPolicyGenerator {
    async fn generate(&self, spec: &Path, debug_mode: bool) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-i")
            .arg(spec)
            .arg("--outraw-pretty-print")
            .arg("-s")
            .arg(&self.output);
        if debug_mode {
            cmd.arg("--debug-mode");
        }
        debug!(program = %self.program, spec = %spec.display(), "running policy generator");

        let out = cmd
            .output()
            .await
            .map_err(|e| CleanroomError::io(&self.program, e))?;
        if !out.status.success() {
            return Err(CleanroomError::Configuration(format!(
                "policy generator exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        tokio::fs::read_to_string(&self.output)
            .await
            .map_err(|e| CleanroomError::io(&self.output, e))
    }
}
