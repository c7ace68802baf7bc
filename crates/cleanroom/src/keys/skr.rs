//! Secure-key-release predicates binding a KEK to a policy digest.

use std::path::Path;

use common::protocol::{
    SkrClause, SkrCondition, SkrPolicy, ATTESTATION_TYPE_CLAIM, COMPLIANCE_STATUS_CLAIM,
    COMPLIANT_UVM, HOSTDATA_CLAIM, SEV_SNP_VM,
};
use common::{CleanroomError, Result};

/// Predicate grammar version.
pub const SKR_VERSION: &str = "1.0.0";

/// Release only to a compliant SEV-SNP guest whose `hostdata` is `policy_digest`,
/// as attested by `authority`.
pub fn build_skr_policy(policy_digest: &str, authority: &str) -> SkrPolicy {
    let condition = |claim: &str, equals: &str| SkrCondition {
        claim: claim.to_owned(),
        equals: equals.to_owned(),
    };
    SkrPolicy {
        any_of: vec![SkrClause {
            all_of: vec![
                condition(HOSTDATA_CLAIM, policy_digest),
                condition(COMPLIANCE_STATUS_CLAIM, COMPLIANT_UVM),
                condition(ATTESTATION_TYPE_CLAIM, SEV_SNP_VM),
            ],
            authority: authority.to_owned(),
        }],
        version: SKR_VERSION.to_owned(),
    }
}

/// Policy digest a predicate is bound to.
pub fn bound_digest(policy: &SkrPolicy) -> Option<&str> {
    policy.claim_value(HOSTDATA_CLAIM)
}

pub fn load(path: &Path) -> Result<SkrPolicy> {
    let bytes = std::fs::read(path).map_err(|e| CleanroomError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        CleanroomError::InvalidDocument(format!("{}: {e}", path.display()))
    })
}

pub fn to_json(policy: &SkrPolicy) -> Result<String> {
    serde_json::to_string_pretty(policy)
        .map_err(|e| CleanroomError::InvalidDocument(format!("release policy: {e}")))
}
