// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-run contract checks.
//!
//! Runs before a contract is admitted. All problems are collected into one
//! error so a client can fix the whole contract in a single round trip.

use crate::{ContractValidator, PredicateRegistry};
use acp_core::Contract;
use std::collections::BTreeSet;

/// Preflight validation failure: every problem found, in contract order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("contract validation failed: {problems:?}")]
pub struct PreflightError {
    /// Individual validation failure messages.
    pub problems: Vec<String>,
}

/// Validate a contract before a run is created.
///
/// Checks schema-level consistency: unique ids, disjoint tool lists, valid
/// destination references, deduplicated approval rules, a positive duration
/// cap, and compilable constraint specs.
///
/// # Errors
///
/// Returns a [`PreflightError`] listing every problem found.
pub fn preflight(contract: &Contract, registry: &PredicateRegistry) -> Result<(), PreflightError> {
    let mut problems = Vec::new();

    if contract.goal.trim().is_empty() {
        problems.push("goal must not be empty".to_string());
    }
    if contract.max_duration_seconds == 0 {
        problems.push("max_duration_seconds must be greater than zero".to_string());
    }

    check_unique(
        contract.success_criteria.iter().map(|c| c.id.as_str()),
        "success criterion",
        &mut problems,
    );
    check_unique(
        contract.deliverables.iter().map(|d| d.id.as_str()),
        "deliverable",
        &mut problems,
    );

    // Tool policy lists must be disjoint.
    let allowed: BTreeSet<&str> = contract.tool_policy.allowed.iter().map(String::as_str).collect();
    for blocked in &contract.tool_policy.blocked {
        if allowed.contains(blocked.as_str()) {
            problems.push(format!("tool '{blocked}' is both allowed and blocked"));
        }
    }

    // Destinations must reference existing deliverables, and every
    // deliverable needs a destination.
    let deliverable_ids: BTreeSet<&str> =
        contract.deliverables.iter().map(|d| d.id.as_str()).collect();
    let destination_ids: BTreeSet<&str> = contract
        .output_destinations
        .iter()
        .map(|d| d.deliverable_id.as_str())
        .collect();
    for dest in &contract.output_destinations {
        if !deliverable_ids.contains(dest.deliverable_id.as_str()) {
            problems.push(format!(
                "output destination references unknown deliverable '{}'",
                dest.deliverable_id
            ));
        }
    }
    for deliverable in &contract.deliverables {
        if !destination_ids.contains(deliverable.id.as_str()) {
            problems.push(format!(
                "deliverable '{}' has no output destination",
                deliverable.id
            ));
        }
    }

    // Approval rule action types are free-form but must not repeat.
    check_unique(
        contract.approval_rules.iter().map(|r| r.action_type.as_str()),
        "approval rule for action",
        &mut problems,
    );
    for rule in &contract.approval_rules {
        if rule.timeout_seconds == 0 {
            problems.push(format!(
                "approval rule '{}' has a zero timeout",
                rule.action_type
            ));
        }
    }

    // Constraint specs must compile (globs, regexes, predicate names).
    if let Err(e) = ContractValidator::compile(contract, registry) {
        problems.push(format!("constraint compilation failed: {e:#}"));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PreflightError { problems })
    }
}

fn check_unique<'a>(
    ids: impl Iterator<Item = &'a str>,
    what: &str,
    problems: &mut Vec<String>,
) {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            problems.push(format!("duplicate {what} id '{id}'"));
        }
    }
}
