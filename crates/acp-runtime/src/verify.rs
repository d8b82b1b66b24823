// SPDX-License-Identifier: MIT OR Apache-2.0
//! Success-criteria evaluation.
//!
//! Runs during the verification step with whatever evidence the run
//! produced: packaged artifacts for `file_exists`, recorded tool results
//! for `api_response` and `test_passed`. `manual_check` criteria are never
//! auto-verified; they are marked unverified for a human.

use acp_core::{Contract, EvidenceType};
use acp_vault::{CriterionOutcome, CriterionStatus};
use serde_json::Value;

/// An artifact the agent produced, held until packaging.
#[derive(Debug, Clone)]
pub struct ProducedArtifact {
    /// Deliverable the artifact fulfils.
    pub deliverable_id: String,
    /// Where it lived inside the sandbox.
    pub sandbox_path: String,
    /// The extracted bytes.
    pub bytes: Vec<u8>,
}

/// A tool result recorded during the run, kept as verification evidence.
#[derive(Debug, Clone)]
pub struct RecordedToolResult {
    /// Tool name.
    pub tool: String,
    /// JSON output.
    pub output: Value,
    /// Whether the tool reported an error.
    pub is_error: bool,
}

/// Evaluate every success criterion.
#[must_use]
pub fn evaluate_criteria(
    contract: &Contract,
    produced: &[ProducedArtifact],
    tool_results: &[RecordedToolResult],
) -> Vec<CriterionOutcome> {
    contract
        .success_criteria
        .iter()
        .map(|criterion| {
            let (status, detail) = match criterion.evidence_type {
                EvidenceType::FileExists => check_file_exists(contract, produced, &criterion.evidence_spec),
                EvidenceType::ApiResponse => check_tool_evidence(tool_results, &criterion.evidence_spec, false),
                EvidenceType::TestPassed => check_tool_evidence(tool_results, &criterion.evidence_spec, true),
                EvidenceType::ManualCheck => (
                    CriterionStatus::Unverified,
                    Some("manual check; left for a human".to_string()),
                ),
            };
            CriterionOutcome {
                criterion_id: criterion.id.clone(),
                status,
                detail,
            }
        })
        .collect()
}

fn check_file_exists(
    contract: &Contract,
    produced: &[ProducedArtifact],
    spec: &Value,
) -> (CriterionStatus, Option<String>) {
    let Some(path) = spec.as_str() else {
        return (
            CriterionStatus::Failed,
            Some("file_exists needs a path string as evidence_spec".to_string()),
        );
    };

    // Match on the sandbox path directly, or through the deliverable whose
    // destination pattern names the expected file.
    let direct = produced.iter().any(|p| {
        p.sandbox_path == path || p.sandbox_path.ends_with(&format!("/{path}"))
    });
    let via_deliverable = contract
        .deliverables
        .iter()
        .filter(|d| d.destination_pattern == path)
        .any(|d| produced.iter().any(|p| p.deliverable_id == d.id));

    if direct || via_deliverable {
        (CriterionStatus::Verified, Some(format!("'{path}' produced")))
    } else {
        (
            CriterionStatus::Failed,
            Some(format!("'{path}' was not produced")),
        )
    }
}

fn check_tool_evidence(
    tool_results: &[RecordedToolResult],
    spec: &Value,
    default_to_test_tools: bool,
) -> (CriterionStatus, Option<String>) {
    let wanted_tool = spec.get("tool").and_then(Value::as_str);
    let contains = spec.get("contains").and_then(Value::as_str);

    let matched = tool_results.iter().find(|r| {
        if r.is_error {
            return false;
        }
        let tool_ok = match wanted_tool {
            Some(tool) => r.tool == tool,
            None => !default_to_test_tools || r.tool.contains("test"),
        };
        if !tool_ok {
            return false;
        }
        match contains {
            Some(needle) => r.output.to_string().contains(needle),
            None => true,
        }
    });

    match matched {
        Some(result) => (
            CriterionStatus::Verified,
            Some(format!("evidenced by '{}' result", result.tool)),
        ),
        None => (
            CriterionStatus::Failed,
            Some("no matching tool result recorded".to_string()),
        ),
    }
}
