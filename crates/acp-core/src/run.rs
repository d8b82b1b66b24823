// SPDX-License-Identifier: MIT OR Apache-2.0
//! The run document.
//!
//! A [`Run`] is created at submission with a contract snapshot and mutated
//! only through the ledger: state transitions via [`crate::apply_transition`]
//! and well-scoped field patches (cost, artifacts, `last_event_seq`, error).

use crate::state::RunState;
use crate::{Contract, CONTRACT_VERSION};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One execution of one agent under one contract.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    /// Stable external identifier.
    pub run_id: Uuid,
    /// Workspace this run belongs to.
    pub workspace_id: String,
    /// Template the contract was instantiated from.
    pub template_id: String,
    /// Version of the template.
    pub template_version: String,
    /// Immutable contract snapshot taken at submission.
    pub contract: Contract,
    /// Current lifecycle state.
    pub state: RunState,
    /// Last active phase before the current state (resume target).
    pub previous_state: Option<RunState>,
    /// When the run was submitted.
    pub created_at: DateTime<Utc>,
    /// When the run left `pending`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Accumulated sandbox compute spend, in cents.
    pub compute_cents: u64,
    /// Accumulated API spend, in cents.
    pub api_cents: u64,
    /// Sequence number of the last appended event; `-1` before any event.
    pub last_event_seq: i64,
    /// Artifacts recorded so far.
    pub artifacts: Vec<ArtifactRef>,
    /// Terminal error, when the run failed.
    pub error: Option<RunErrorInfo>,
}

impl Run {
    /// Create a fresh run in `pending` with zeroed counters.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, contract: Contract) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            template_id: contract.template_id.clone(),
            template_version: contract.template_version.clone(),
            contract,
            state: RunState::Pending,
            previous_state: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            compute_cents: 0,
            api_cents: 0,
            last_event_seq: -1,
            artifacts: vec![],
            error: None,
        }
    }

    /// Total spend. Always computed, never stored, so the identity
    /// `total == compute + api` holds at every observable time.
    #[must_use]
    pub fn total_cents(&self) -> u64 {
        self.compute_cents + self.api_cents
    }

    /// Returns `true` once the run has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Reference to an artifact recorded on the run document.
///
/// The full [`crate::ArtifactManifest`] lives with the vault; the run only
/// carries the pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    /// Artifact identifier (matches the deliverable id where applicable).
    pub id: String,
    /// Artifact type (e.g. `"markdown"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Destination path in the vault.
    pub path: String,
}

/// The closed failure taxonomy. Every terminal failure carries exactly one
/// of these kinds; retry behaviour is keyed off it in `acp-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Network blips, sandbox cold-start hiccups.
    Transient,
    /// A tool invocation failed; the agent may retry with different args.
    ToolFailure,
    /// The agent's own internal failure.
    AgentError,
    /// The sandbox process died.
    SandboxCrash,
    /// The run violated its contract.
    ContractViolation,
    /// The wall-clock cap (`max_duration_seconds`) expired.
    Timeout,
    /// An approval checkpoint expired.
    ApprovalTimeout,
    /// No progress within the heartbeat window.
    Stalled,
}

impl RunErrorKind {
    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ToolFailure => "tool_failure",
            Self::AgentError => "agent_error",
            Self::SandboxCrash => "sandbox_crash",
            Self::ContractViolation => "contract_violation",
            Self::Timeout => "timeout",
            Self::ApprovalTimeout => "approval_timeout",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error recorded on a failed run document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunErrorInfo {
    /// Classified failure kind.
    pub kind: RunErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether a retry of the whole run could plausibly succeed.
    pub recoverable: bool,
}

impl RunErrorInfo {
    /// Construct an error record.
    #[must_use]
    pub fn new(kind: RunErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable,
        }
    }
}

/// Ensure contract snapshots carry the version this build understands.
#[must_use]
pub fn contract_version_supported(contract: &Contract) -> bool {
    contract.contract_version == CONTRACT_VERSION
}
