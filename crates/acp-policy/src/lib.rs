// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-policy
#![deny(unsafe_code)]

/// Pre-run contract checks.
pub mod preflight;
/// Approval rule evaluation.
pub mod rules;

use acp_core::{Constraint, ConstraintRule, ConstraintSeverity, Contract, EventPayload};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use preflight::{PreflightError, preflight};
pub use rules::{find_rule, should_gate};

/// A denied action, ready to become a `drift.detected` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Which rule fired (`"tool_policy"`, `"tool_blocked"`, `"path_blocked"`,
    /// `"pattern_blocked"`, or `"custom:<name>"`).
    pub rule: String,
    /// Human-readable reason.
    pub reason: String,
    /// Tool involved, when the drift was a tool call.
    pub tool: Option<String>,
    /// Suggested fallback for the agent, if any.
    pub fallback: Option<String>,
    /// Whether the violation escalates to run failure.
    pub severity: ConstraintSeverity,
}

impl DriftReport {
    /// Convert into the event payload appended to the run's log.
    #[must_use]
    pub fn into_payload(self) -> EventPayload {
        EventPayload::DriftDetected {
            rule: self.rule,
            reason: self.reason,
            tool: self.tool,
            fallback: self.fallback,
        }
    }
}

/// Outcome of a runtime check.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    /// Forward the call to the sandbox.
    Allow,
    /// Do not forward; record the drift.
    Deny(DriftReport),
}

impl ToolDecision {
    /// Returns `true` for [`ToolDecision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// A named predicate backing `custom` constraint rules.
///
/// Receives the tool name, its JSON args, and the rule's params; returns
/// `true` when the call is acceptable.
pub type CustomPredicate = Arc<dyn Fn(&str, &serde_json::Value, &serde_json::Value) -> bool + Send + Sync>;

/// Registry of [`CustomPredicate`]s, consulted by name.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, CustomPredicate>,
}

impl PredicateRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under a name, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&str, &serde_json::Value, &serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Look up a predicate.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CustomPredicate> {
        self.predicates.get(name)
    }

    /// Names of all registered predicates.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.predicates.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// A compiled constraint, matched per tool call.
enum CompiledConstraint {
    ToolBlocked {
        tool: String,
        severity: ConstraintSeverity,
    },
    PathBlocked {
        globs: GlobSet,
        severity: ConstraintSeverity,
    },
    PatternBlocked {
        pattern: Regex,
        severity: ConstraintSeverity,
    },
    Custom {
        name: String,
        params: serde_json::Value,
        predicate: CustomPredicate,
        severity: ConstraintSeverity,
    },
}

/// Runtime contract enforcement for one run.
///
/// Compiled once from the contract snapshot; checks are pure and cheap.
pub struct ContractValidator {
    allowed: Vec<String>,
    blocked: Vec<String>,
    constraints: Vec<CompiledConstraint>,
}

impl ContractValidator {
    /// Compile a contract's tool policy and constraints.
    ///
    /// # Errors
    ///
    /// Fails when a path glob, regex pattern, or custom predicate reference
    /// does not compile. Preflight runs these same compilations, so a
    /// preflighted contract cannot fail here.
    pub fn compile(contract: &Contract, registry: &PredicateRegistry) -> Result<Self> {
        let mut constraints = Vec::with_capacity(contract.constraints.len());
        for constraint in &contract.constraints {
            constraints.push(Self::compile_constraint(constraint, registry)?);
        }
        Ok(Self {
            allowed: contract.tool_policy.allowed.clone(),
            blocked: contract.tool_policy.blocked.clone(),
            constraints,
        })
    }

    fn compile_constraint(
        constraint: &Constraint,
        registry: &PredicateRegistry,
    ) -> Result<CompiledConstraint> {
        let severity = constraint.severity;
        Ok(match &constraint.rule {
            ConstraintRule::ToolBlocked(tool) => CompiledConstraint::ToolBlocked {
                tool: tool.clone(),
                severity,
            },
            ConstraintRule::PathBlocked(patterns) => {
                let mut builder = GlobSetBuilder::new();
                for p in patterns {
                    builder.add(Glob::new(p).with_context(|| format!("compile path glob '{p}'"))?);
                }
                CompiledConstraint::PathBlocked {
                    globs: builder.build().context("build path globset")?,
                    severity,
                }
            }
            ConstraintRule::PatternBlocked(pattern) => CompiledConstraint::PatternBlocked {
                pattern: Regex::new(pattern)
                    .with_context(|| format!("compile blocked pattern '{pattern}'"))?,
                severity,
            },
            ConstraintRule::Custom { name, params } => {
                let predicate = registry
                    .get(name)
                    .with_context(|| format!("unknown custom predicate '{name}'"))?
                    .clone();
                CompiledConstraint::Custom {
                    name: name.clone(),
                    params: params.clone(),
                    predicate,
                    severity,
                }
            }
        })
    }

    /// Check a proposed tool call against the tool policy and constraints.
    ///
    /// The blocklist wins over the allowlist; a non-empty allowlist denies
    /// anything unlisted; constraints run only for calls the policy allows.
    #[must_use]
    pub fn check_tool_call(&self, tool: &str, args: &serde_json::Value) -> ToolDecision {
        if self.blocked.iter().any(|b| b.as_str() == tool) {
            return ToolDecision::Deny(DriftReport {
                rule: "tool_policy".into(),
                reason: format!("tool '{tool}' is blocked by the contract"),
                tool: Some(tool.to_string()),
                fallback: self.fallback_hint(),
                severity: ConstraintSeverity::Warn,
            });
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a.as_str() == tool) {
            return ToolDecision::Deny(DriftReport {
                rule: "tool_policy".into(),
                reason: format!("tool '{tool}' is not in the contract allowlist"),
                tool: Some(tool.to_string()),
                fallback: self.fallback_hint(),
                severity: ConstraintSeverity::Warn,
            });
        }

        for constraint in &self.constraints {
            if let Some(report) = self.check_constraint(constraint, tool, args) {
                return ToolDecision::Deny(report);
            }
        }

        ToolDecision::Allow
    }

    fn fallback_hint(&self) -> Option<String> {
        if self.allowed.is_empty() {
            None
        } else {
            Some(format!("allowed tools: {}", self.allowed.join(", ")))
        }
    }

    fn check_constraint(
        &self,
        constraint: &CompiledConstraint,
        tool: &str,
        args: &serde_json::Value,
    ) -> Option<DriftReport> {
        match constraint {
            CompiledConstraint::ToolBlocked { tool: blocked, severity } => {
                (blocked.as_str() == tool).then(|| DriftReport {
                    rule: "tool_blocked".into(),
                    reason: format!("tool '{tool}' is blocked by a constraint"),
                    tool: Some(tool.to_string()),
                    fallback: None,
                    severity: *severity,
                })
            }
            CompiledConstraint::PathBlocked { globs, severity } => {
                let path = path_argument(args)?;
                globs.is_match(Path::new(&path)).then(|| DriftReport {
                    rule: "path_blocked".into(),
                    reason: format!("path '{path}' is blocked by the contract"),
                    tool: Some(tool.to_string()),
                    fallback: None,
                    severity: *severity,
                })
            }
            CompiledConstraint::PatternBlocked { pattern, severity } => {
                let text = textual_args(args);
                pattern.is_match(&text).then(|| DriftReport {
                    rule: "pattern_blocked".into(),
                    reason: format!("arguments match blocked pattern '{pattern}'"),
                    tool: Some(tool.to_string()),
                    fallback: None,
                    severity: *severity,
                })
            }
            CompiledConstraint::Custom {
                name,
                params,
                predicate,
                severity,
            } => (!predicate(tool, args, params)).then(|| DriftReport {
                rule: format!("custom:{name}"),
                reason: format!("custom rule '{name}' rejected the call"),
                tool: Some(tool.to_string()),
                fallback: None,
                severity: *severity,
            }),
        }
    }
}

/// Pull the path argument out of a tool call, if it has one.
fn path_argument(args: &serde_json::Value) -> Option<String> {
    for key in ["path", "file_path", "target"] {
        if let Some(s) = args.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

/// Flatten string-valued args into one haystack for pattern rules.
fn textual_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .values()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
