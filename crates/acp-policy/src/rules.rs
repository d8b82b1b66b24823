// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval rule evaluation.
//!
//! Decides whether a checkpoint the agent raised actually needs a human,
//! based on the contract's approval rules and what the run has already done.

use acp_core::{ApprovalCondition, ApprovalRule, Contract};
use std::collections::BTreeSet;

/// Find the approval rule covering an action type, if any.
#[must_use]
pub fn find_rule<'a>(contract: &'a Contract, action_type: &str) -> Option<&'a ApprovalRule> {
    contract
        .approval_rules
        .iter()
        .find(|r| r.action_type == action_type)
}

/// Evaluate a rule's condition against the run's history and scopes.
///
/// `seen_actions` is the set of action types the run has already raised;
/// `scopes` are the contract's granted integration scopes. An action is
/// considered external when a granted scope names it (e.g. action
/// `"send_email"` with scope `"send_email"` or `"send_email:*"`).
#[must_use]
pub fn should_gate(
    rule: &ApprovalRule,
    seen_actions: &BTreeSet<String>,
    scopes: &[String],
) -> bool {
    match rule.condition {
        ApprovalCondition::Always => true,
        ApprovalCondition::Never => false,
        ApprovalCondition::FirstTime => !seen_actions.contains(&rule.action_type),
        ApprovalCondition::IfExternal => scopes.iter().any(|scope| {
            scope == &rule.action_type
                || scope
                    .strip_suffix(":*")
                    .is_some_and(|prefix| rule.action_type.starts_with(prefix))
                || rule
                    .action_type
                    .strip_prefix(&format!("{scope}:"))
                    .is_some()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::{ApprovalCondition, ContractBuilder, TimeoutAction};

    fn rule(condition: ApprovalCondition) -> ApprovalRule {
        ApprovalRule {
            action_type: "send_email".into(),
            condition,
            timeout_seconds: 300,
            auto_action_on_timeout: TimeoutAction::Reject,
        }
    }

    #[test]
    fn always_and_never() {
        let seen = BTreeSet::new();
        assert!(should_gate(&rule(ApprovalCondition::Always), &seen, &[]));
        assert!(!should_gate(&rule(ApprovalCondition::Never), &seen, &[]));
    }

    #[test]
    fn first_time_gates_only_once() {
        let mut seen = BTreeSet::new();
        let r = rule(ApprovalCondition::FirstTime);
        assert!(should_gate(&r, &seen, &[]));
        seen.insert("send_email".to_string());
        assert!(!should_gate(&r, &seen, &[]));
    }

    #[test]
    fn if_external_matches_granted_scopes() {
        let seen = BTreeSet::new();
        let r = rule(ApprovalCondition::IfExternal);

        assert!(!should_gate(&r, &seen, &[]));
        assert!(should_gate(&r, &seen, &["send_email".to_string()]));
        assert!(should_gate(&r, &seen, &["send_email:*".to_string()]));
        assert!(!should_gate(&r, &seen, &["calendar:write".to_string()]));
    }

    #[test]
    fn find_rule_by_action_type() {
        let contract = ContractBuilder::new("g")
            .approval_rule("send_email", ApprovalCondition::Always, 60, TimeoutAction::Approve)
            .build();
        assert!(find_rule(&contract, "send_email").is_some());
        assert!(find_rule(&contract, "delete_repo").is_none());
    }
}
