// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Agent Control Plane.
//!
//! If you only take one dependency, take this one.

/// Approval checkpoint records and resolution audit fields.
pub mod approval;
/// Artifact manifests and run-level artifact references.
pub mod artifact;
/// Sequence-numbered run events with type-discriminated payloads.
pub mod event;
/// Append-boundary validation of raw event payloads.
pub mod payload;
/// The run document and its cost/error fields.
pub mod run;
/// Agent session bookkeeping for sandbox processes.
pub mod session;
/// The pure run state machine.
pub mod state;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use approval::{Approval, ApprovalStatus, RejectionReason, ResolutionSource};
pub use artifact::{ArtifactManifest, ArtifactStatus};
pub use event::{Event, EventPayload, EventType, Severity, UnknownEventType};
pub use payload::{PayloadError, validate_payload};
pub use run::{ArtifactRef, Run, RunErrorInfo, RunErrorKind};
pub use session::{AgentSession, SessionState};
pub use state::{RunState, TransitionError, TransitionRecord, apply_transition};

/// Current contract version string embedded in every contract snapshot.
///
/// # Examples
///
/// ```
/// assert_eq!(acp_core::CONTRACT_VERSION, "acp/v0.1");
/// ```
pub const CONTRACT_VERSION: &str = "acp/v0.1";

/// The immutable specification a run must obey.
///
/// A contract is snapshotted into the [`Run`] at submission and never
/// mutated afterwards. Validation lives in `acp-policy`; this crate only
/// carries the shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Contract {
    /// Contract schema version (see [`CONTRACT_VERSION`]).
    pub contract_version: String,

    /// Template this contract was instantiated from.
    pub template_id: String,

    /// Version of the template.
    pub template_version: String,

    /// Human intent for the run.
    pub goal: String,

    /// Ordered success criteria evaluated during the verification phase.
    pub success_criteria: Vec<SuccessCriterion>,

    /// Deliverables the run is expected to produce.
    pub deliverables: Vec<Deliverable>,

    /// Behavioural constraints enforced at runtime.
    pub constraints: Vec<Constraint>,

    /// Tool allow/block lists.
    pub tool_policy: ToolPolicy,

    /// External integration scopes granted to the run (e.g. `"email:send"`).
    pub integration_scopes: Vec<String>,

    /// Rules deciding which proposed actions require human approval.
    pub approval_rules: Vec<ApprovalRule>,

    /// Hard wall-clock cap for the whole run, in seconds.
    pub max_duration_seconds: u64,

    /// Optional hard cap on total spend, in cents.
    pub max_cost_cents: Option<u64>,

    /// Files mounted into the sandbox before the run starts.
    pub input_files: Vec<String>,

    /// Where each deliverable lands in the vault.
    pub output_destinations: Vec<OutputDestination>,
}

/// One success criterion checked during verification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuccessCriterion {
    /// Stable identifier, unique within the contract.
    pub id: String,
    /// Human-readable description of what must hold.
    pub description: String,
    /// What kind of evidence satisfies this criterion.
    pub evidence_type: EvidenceType,
    /// Type-specific evidence detail (e.g. a path for `file_exists`).
    #[serde(default)]
    pub evidence_spec: serde_json::Value,
}

/// How a [`SuccessCriterion`] is proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    /// A file with the given path exists among the packaged artifacts.
    FileExists,
    /// A recorded API response matched the expectation.
    ApiResponse,
    /// A recorded test run reported success.
    TestPassed,
    /// A human must check; the run marks it unverified.
    ManualCheck,
}

/// A deliverable the run must (or may) produce.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Deliverable {
    /// Stable identifier, unique within the contract.
    pub id: String,
    /// Deliverable type (e.g. `"markdown"`, `"report"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Filename pattern under the destination base path.
    pub destination_pattern: String,
    /// Whether a missing deliverable fails verification.
    pub required: bool,
}

/// A behavioural constraint with an enforcement severity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    /// The rule itself (type + spec).
    #[serde(flatten)]
    pub rule: ConstraintRule,
    /// What happens on violation.
    #[serde(default)]
    pub severity: ConstraintSeverity,
}

/// The rule payload of a [`Constraint`], discriminated by `rule_type`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule_type", content = "rule_spec", rename_all = "snake_case")]
pub enum ConstraintRule {
    /// Block a tool by exact name.
    ToolBlocked(String),
    /// Block file paths by prefix or glob patterns.
    PathBlocked(Vec<String>),
    /// Block textual tool arguments matching a regex.
    PatternBlocked(String),
    /// Dispatch to a named predicate registered with the validator.
    Custom {
        /// Registered predicate name.
        name: String,
        /// Opaque parameters passed to the predicate.
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// Enforcement level of a [`Constraint`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSeverity {
    /// Record the drift and continue the run.
    #[default]
    Warn,
    /// Record the drift and fail the run.
    Fail,
}

/// Tool allow/block lists. An empty `allowed` list means "no allowlist".
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolPolicy {
    /// Tool allowlist. Empty means any tool not blocked is permitted.
    pub allowed: Vec<String>,
    /// Tool blocklist. Always wins over the allowlist.
    pub blocked: Vec<String>,
}

/// Rule deciding when a proposed action requires a human checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRule {
    /// Action type the rule applies to (free-form, e.g. `"send_email"`).
    pub action_type: String,
    /// When the gate fires.
    pub condition: ApprovalCondition,
    /// How long the checkpoint stays pending before timing out.
    pub timeout_seconds: u64,
    /// What the timeout sweep does to an expired checkpoint.
    pub auto_action_on_timeout: TimeoutAction,
}

/// When an [`ApprovalRule`] gates an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCondition {
    /// Gate every occurrence.
    Always,
    /// Gate only the first occurrence within the run.
    FirstTime,
    /// Gate when the action touches a granted integration scope.
    IfExternal,
    /// Never gate; the action is auto-approved.
    Never,
}

/// Automatic resolution applied when a checkpoint expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Resume the run as if the checkpoint had been approved.
    Approve,
    /// Terminate the run in the distinct `timeout` state.
    Reject,
}

/// Maps a deliverable to its vault base path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputDestination {
    /// The deliverable this destination belongs to.
    pub deliverable_id: String,
    /// Vault base path the deliverable is written under.
    pub base_path: String,
}

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing and byte-level
/// comparison.
///
/// Not a full JCS implementation, but stable for our types: keys are
/// sorted (serde_json maps preserve insertion of a BTreeMap) and numbers
/// serialize consistently.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Builder for constructing [`Contract`]s ergonomically.
///
/// # Examples
///
/// ```
/// use acp_core::{ContractBuilder, EvidenceType};
///
/// let contract = ContractBuilder::new("summarize the inbox")
///     .template("daily-summary", "3")
///     .criterion("S1", "summary file exists", EvidenceType::FileExists, "out.md")
///     .deliverable("D1", "markdown", "out.md", true)
///     .destination("D1", "vault/notes")
///     .allow_tools(["read", "write"])
///     .max_duration_seconds(600)
///     .build();
///
/// assert_eq!(contract.goal, "summarize the inbox");
/// assert_eq!(contract.deliverables.len(), 1);
/// ```
#[derive(Debug)]
pub struct ContractBuilder {
    goal: String,
    template_id: String,
    template_version: String,
    success_criteria: Vec<SuccessCriterion>,
    deliverables: Vec<Deliverable>,
    constraints: Vec<Constraint>,
    tool_policy: ToolPolicy,
    integration_scopes: Vec<String>,
    approval_rules: Vec<ApprovalRule>,
    max_duration_seconds: u64,
    max_cost_cents: Option<u64>,
    input_files: Vec<String>,
    output_destinations: Vec<OutputDestination>,
}

impl ContractBuilder {
    /// Create a new builder with the given goal.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            template_id: "adhoc".into(),
            template_version: "1".into(),
            success_criteria: vec![],
            deliverables: vec![],
            constraints: vec![],
            tool_policy: ToolPolicy::default(),
            integration_scopes: vec![],
            approval_rules: vec![],
            max_duration_seconds: 3600,
            max_cost_cents: None,
            input_files: vec![],
            output_destinations: vec![],
        }
    }

    /// Set the template id and version.
    #[must_use]
    pub fn template(mut self, id: impl Into<String>, version: impl Into<String>) -> Self {
        self.template_id = id.into();
        self.template_version = version.into();
        self
    }

    /// Add a success criterion.
    #[must_use]
    pub fn criterion(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        evidence_type: EvidenceType,
        evidence_spec: impl Into<serde_json::Value>,
    ) -> Self {
        self.success_criteria.push(SuccessCriterion {
            id: id.into(),
            description: description.into(),
            evidence_type,
            evidence_spec: evidence_spec.into(),
        });
        self
    }

    /// Add a deliverable.
    #[must_use]
    pub fn deliverable(
        mut self,
        id: impl Into<String>,
        kind: impl Into<String>,
        destination_pattern: impl Into<String>,
        required: bool,
    ) -> Self {
        self.deliverables.push(Deliverable {
            id: id.into(),
            kind: kind.into(),
            destination_pattern: destination_pattern.into(),
            required,
        });
        self
    }

    /// Add a constraint.
    #[must_use]
    pub fn constraint(mut self, rule: ConstraintRule, severity: ConstraintSeverity) -> Self {
        self.constraints.push(Constraint { rule, severity });
        self
    }

    /// Extend the tool allowlist.
    #[must_use]
    pub fn allow_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_policy.allowed.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Extend the tool blocklist.
    #[must_use]
    pub fn block_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_policy.blocked.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Grant an integration scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.integration_scopes.push(scope.into());
        self
    }

    /// Add an approval rule.
    #[must_use]
    pub fn approval_rule(
        mut self,
        action_type: impl Into<String>,
        condition: ApprovalCondition,
        timeout_seconds: u64,
        auto_action_on_timeout: TimeoutAction,
    ) -> Self {
        self.approval_rules.push(ApprovalRule {
            action_type: action_type.into(),
            condition,
            timeout_seconds,
            auto_action_on_timeout,
        });
        self
    }

    /// Set the wall-clock cap.
    #[must_use]
    pub fn max_duration_seconds(mut self, secs: u64) -> Self {
        self.max_duration_seconds = secs;
        self
    }

    /// Set the cost cap in cents.
    #[must_use]
    pub fn max_cost_cents(mut self, cents: u64) -> Self {
        self.max_cost_cents = Some(cents);
        self
    }

    /// Mount an input file into the sandbox.
    #[must_use]
    pub fn input_file(mut self, path: impl Into<String>) -> Self {
        self.input_files.push(path.into());
        self
    }

    /// Map a deliverable to a vault base path.
    #[must_use]
    pub fn destination(
        mut self,
        deliverable_id: impl Into<String>,
        base_path: impl Into<String>,
    ) -> Self {
        self.output_destinations.push(OutputDestination {
            deliverable_id: deliverable_id.into(),
            base_path: base_path.into(),
        });
        self
    }

    /// Finalize the contract.
    #[must_use]
    pub fn build(self) -> Contract {
        Contract {
            contract_version: CONTRACT_VERSION.to_string(),
            template_id: self.template_id,
            template_version: self.template_version,
            goal: self.goal,
            success_criteria: self.success_criteria,
            deliverables: self.deliverables,
            constraints: self.constraints,
            tool_policy: self.tool_policy,
            integration_scopes: self.integration_scopes,
            approval_rules: self.approval_rules,
            max_duration_seconds: self.max_duration_seconds,
            max_cost_cents: self.max_cost_cents,
            input_files: self.input_files,
            output_destinations: self.output_destinations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_sane() {
        let c = ContractBuilder::new("do the thing").build();
        assert_eq!(c.contract_version, CONTRACT_VERSION);
        assert_eq!(c.template_id, "adhoc");
        assert!(c.tool_policy.allowed.is_empty());
        assert!(c.max_cost_cents.is_none());
        assert_eq!(c.max_duration_seconds, 3600);
    }

    #[test]
    fn contract_serde_roundtrip() {
        let c = ContractBuilder::new("summarize")
            .criterion("S1", "file exists", EvidenceType::FileExists, "out.md")
            .deliverable("D1", "markdown", "out.md", true)
            .destination("D1", "vault/notes")
            .allow_tools(["read", "write"])
            .block_tools(["delete"])
            .approval_rule("send_email", ApprovalCondition::Always, 300, TimeoutAction::Reject)
            .max_cost_cents(500)
            .build();

        let json = serde_json::to_string(&c).unwrap();
        let back: Contract = serde_json::from_str(&json).unwrap();
        assert_eq!(back.goal, "summarize");
        assert_eq!(back.deliverables[0].kind, "markdown");
        assert_eq!(back.tool_policy.blocked, vec!["delete"]);
        assert_eq!(back.approval_rules[0].timeout_seconds, 300);
    }

    #[test]
    fn constraint_rule_tagging() {
        let rule = ConstraintRule::PathBlocked(vec!["secrets/**".into()]);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["rule_type"], "path_blocked");
        assert_eq!(json["rule_spec"][0], "secrets/**");

        let custom = ConstraintRule::Custom {
            name: "no_weekend_sends".into(),
            params: serde_json::json!({"tz": "UTC"}),
        };
        let json = serde_json::to_value(&custom).unwrap();
        assert_eq!(json["rule_type"], "custom");
        assert_eq!(json["rule_spec"]["name"], "no_weekend_sends");
    }

    #[test]
    fn canonical_json_is_deterministic() {
        let c = ContractBuilder::new("hash me").build();
        let a = canonical_json(&c).unwrap();
        let b = canonical_json(&c).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sha256_hex_known_vector() {
        // Empty input digest is a well-known constant.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
