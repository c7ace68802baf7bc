//! CCE policy assembly.
//!
//! A policy is either generated from a deployment spec by an external tool,
//! or produced by substituting real layer digests into a placeholder policy
//! generated once against a stand-in image. Either way the result is an
//! [`AssembledPolicy`] whose digest is taken over the exact text that will be
//! deployed.

pub mod assembler;
pub mod containers;
pub mod generator;
pub mod sidecar;

pub use assembler::{
    allow_all, submit_proposal, substitute_layers, write_outputs, AssembledPolicy, PolicyOutputs,
    POLICY_FILE, PROPOSAL_FILE,
};
pub use containers::{extract_containers, ContainersError, ContainersSpan, PolicyContainer};
pub use generator::{PolicyGenerator, ProcessPolicyGenerator};
pub use sidecar::{SidecarDigests, SidecarEntry};
