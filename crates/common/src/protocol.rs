//! Document shapes exchanged with external collaborators.
//!
//! These types are serialised as JSON towards the key-release service and the
//! governance service, and parsed from YAML for registry version documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attestation claim carrying the CCE policy digest.
pub const HOSTDATA_CLAIM: &str = "x-ms-sevsnpvm-hostdata";
/// Attestation claim carrying the platform compliance status.
pub const COMPLIANCE_STATUS_CLAIM: &str = "x-ms-compliance-status";
/// Attestation claim carrying the attestation type.
pub const ATTESTATION_TYPE_CLAIM: &str = "x-ms-attestation-type";
/// Attestation claim flagging a debuggable guest.
pub const DEBUGGABLE_CLAIM: &str = "x-ms-sevsnpvm-is-debuggable";

/// Required value of [`COMPLIANCE_STATUS_CLAIM`].
pub const COMPLIANT_UVM: &str = "azure-compliant-uvm";
/// Required value of [`ATTESTATION_TYPE_CLAIM`].
pub const SEV_SNP_VM: &str = "sevsnpvm";

// ---------------------------------------------------------------------------
// Secure key release predicate
// ---------------------------------------------------------------------------

/// Secure-Key-Release predicate attached to an imported KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkrPolicy {
    /// Alternatives; release happens if any clause holds.
    #[serde(rename = "anyOf")]
    pub any_of: Vec<SkrClause>,
    /// Policy grammar version.
    pub version: String,
}

/// Conjunction of claim conditions evaluated by one attestation authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkrClause {
    /// Conditions that must all hold.
    #[serde(rename = "allOf")]
    pub all_of: Vec<SkrCondition>,
    /// Attestation authority URL.
    pub authority: String,
}

/// A single `claim == value` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkrCondition {
    /// Claim name.
    pub claim: String,
    /// Expected claim value.
    pub equals: String,
}

impl SkrPolicy {
    /// Value pinned for `claim` in the first clause, if any.
    pub fn claim_value(&self, claim: &str) -> Option<&str> {
        self.any_of
            .first()?
            .all_of
            .iter()
            .find(|c| c.claim == claim)
            .map(|c| c.equals.as_str())
    }
}

// ---------------------------------------------------------------------------
// Governance policy
// ---------------------------------------------------------------------------

/// Approved clean room policy as returned by the governance service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanroomPolicy {
    /// Approved claims; absent until a policy proposal has been accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyClaims>,
}

/// Claims of an approved clean room policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyClaims {
    /// Approved CCE policy digests (hex).
    #[serde(rename = "x-ms-sevsnpvm-hostdata", default)]
    pub hostdata: Vec<String>,
    /// Remaining claims, carried through untouched.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl CleanroomPolicy {
    /// First approved host-data digest, if governance has approved one.
    pub fn hostdata(&self) -> Option<&str> {
        self.policy
            .as_ref()?
            .hostdata
            .first()
            .map(String::as_str)
            .filter(|h| !h.trim().is_empty())
    }
}

/// Claims proposal submitted to governance for a deployment policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyProposal {
    /// Proposal kind; always `"add"` for new deployments.
    #[serde(rename = "type")]
    pub kind: String,
    /// Proposed claims.
    pub claims: ProposedClaims,
}

/// Claims carried by a [`PolicyProposal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedClaims {
    /// Whether the guest may be debuggable.
    #[serde(rename = "x-ms-sevsnpvm-is-debuggable")]
    pub is_debuggable: bool,
    /// CCE policy digest (hex).
    #[serde(rename = "x-ms-sevsnpvm-hostdata")]
    pub hostdata: String,
}

impl PolicyProposal {
    /// Proposal adding a non-debuggable deployment pinned to `hostdata`.
    pub fn add(hostdata: impl Into<String>) -> Self {
        Self {
            kind: "add".into(),
            claims: ProposedClaims {
                is_debuggable: false,
                hostdata: hostdata.into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Version documents
// ---------------------------------------------------------------------------

/// `version.yaml` payload published alongside each component release.
///
/// Shaped `{ <component>: { version: "x.y.z" } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionDocument(pub BTreeMap<String, ComponentVersion>);

/// Per-component entry of a [`VersionDocument`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentVersion {
    /// Version; YAML may present it as a string or a number.
    #[serde(default)]
    pub version: Option<serde_json::Value>,
}

impl VersionDocument {
    /// Version string recorded for `component`, if present.
    pub fn version_of(&self, component: &str) -> Option<String> {
        match self.0.get(component)?.version.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// One available upgrade, keyed by component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Upgrade {
    /// Governance client image upgrade.
    #[serde(rename = "clientVersion")]
    Client(String),
    /// Constitution upgrade.
    #[serde(rename = "constitutionVersion")]
    Constitution(String),
    /// JS application bundle upgrade.
    #[serde(rename = "jsappVersion")]
    JsApp(String),
}

/// Digest and resolved version of a deployed component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// `sha256:`-prefixed digest.
    pub digest: String,
    /// Resolved version, or `"unknown"`.
    pub version: String,
}

// ---------------------------------------------------------------------------
// Wrapped secrets
// ---------------------------------------------------------------------------

/// Reference to a wrapped secret and the KEK that protects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecretRef {
    /// Secret name in the vault.
    pub kid: String,
    /// Vault holding the wrapped value.
    #[serde(rename = "akvEndpoint")]
    pub akv_endpoint: String,
    /// KEK the value is wrapped under.
    pub kek: KekRef,
}

/// Reference to an imported KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekRef {
    /// KEK name in the key-release service.
    pub kid: String,
    /// Key-release service (vault or managed HSM) URL.
    #[serde(rename = "akvEndpoint")]
    pub akv_endpoint: String,
    /// Attestation authority URL.
    #[serde(rename = "maaEndpoint")]
    pub maa_endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn governance_policy_hostdata() {
        let p: CleanroomPolicy = serde_json::from_value(json!({
            "policy": {
                "x-ms-sevsnpvm-hostdata": ["abc123"],
                "x-ms-sevsnpvm-is-debuggable": [false]
            }
        }))
        .unwrap();
        assert_eq!(p.hostdata(), Some("abc123"));
        assert!(p.policy.unwrap().other.contains_key(DEBUGGABLE_CLAIM));
    }

    #[test]
    fn governance_policy_without_claims_has_no_hostdata() {
        let empty: CleanroomPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.hostdata(), None);

        let no_claim: CleanroomPolicy =
            serde_json::from_value(json!({"policy": {"other": 1}})).unwrap();
        assert_eq!(no_claim.hostdata(), None);
    }

    #[test]
    fn upgrade_serialises_with_component_key() {
        let u = Upgrade::Client("1.0.8".into());
        assert_eq!(serde_json::to_value(&u).unwrap(), json!({"clientVersion": "1.0.8"}));
        let u = Upgrade::JsApp("1.0.9".into());
        assert_eq!(serde_json::to_value(&u).unwrap(), json!({"jsappVersion": "1.0.9"}));
    }

    #[test]
    fn version_document_accepts_string_or_number() {
        let doc: VersionDocument = serde_json::from_value(json!({
            "cgs-client": {"version": "1.0.8"},
            "cgs-js-app": {"version": 2},
            "cgs-constitution": {}
        }))
        .unwrap();
        assert_eq!(doc.version_of("cgs-client").as_deref(), Some("1.0.8"));
        assert_eq!(doc.version_of("cgs-js-app").as_deref(), Some("2"));
        assert_eq!(doc.version_of("cgs-constitution"), None);
        assert_eq!(doc.version_of("missing"), None);
    }

    #[test]
    fn proposal_shape() {
        let p = PolicyProposal::add("deadbeef");
        assert_eq!(
            serde_json::to_value(&p).unwrap(),
            json!({
                "type": "add",
                "claims": {
                    "x-ms-sevsnpvm-is-debuggable": false,
                    "x-ms-sevsnpvm-hostdata": "deadbeef"
                }
            })
        );
    }
}
