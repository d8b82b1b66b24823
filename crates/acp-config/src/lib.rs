// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The approval sweep interval is large enough to miss short timeouts.
    LargeSweepInterval {
        /// Interval value in milliseconds.
        millis: u64,
    },
    /// The per-subscriber event buffer is small; slow clients will lag out.
    SmallEventBuffer {
        /// Configured buffer size.
        size: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeSweepInterval { millis } => {
                write!(f, "approval sweep interval is {millis}ms; short checkpoint timeouts will resolve late")
            }
            ConfigWarning::SmallEventBuffer { size } => {
                write!(f, "event buffer of {size} is small; slow subscribers will be closed with lag errors")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// HTTP bind address.
    pub bind: String,
    /// Workspace this process serves (the core is one workspace per process).
    pub workspace_id: String,
    /// Vault paths.
    pub vault: VaultPaths,
    /// Runtime limits.
    pub limits: Limits,
    /// Per-workspace budgets, in cents.
    pub budgets: BTreeMap<String, WorkspaceBudgetConfig>,
}

/// Artifact and trace base paths.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VaultPaths {
    /// Artifact base directory.
    pub artifact_base: String,
    /// Trace base directory.
    pub trace_base: String,
}

/// Runtime limits and intervals.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Limits {
    /// Cap on concurrently active runs (admission control).
    pub max_active_runs: usize,
    /// Per-subscriber event buffer (events).
    pub event_buffer: usize,
    /// Approval timeout sweep interval, in milliseconds.
    pub approval_sweep_interval_ms: u64,
    /// Fail a run as stalled after this many milliseconds without any
    /// sandbox signal. `0` disables stall detection.
    pub stall_timeout_ms: u64,
}

/// Budget caps for one workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceBudgetConfig {
    /// Cap on spend per calendar day (UTC), in cents.
    pub per_day_cents: Option<u64>,
    /// Cap on spend per calendar month (UTC), in cents.
    pub per_month_cents: Option<u64>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
            workspace_id: "default".to_string(),
            vault: VaultPaths::default(),
            limits: Limits::default(),
            budgets: BTreeMap::new(),
        }
    }
}

impl Default for VaultPaths {
    fn default() -> Self {
        Self {
            artifact_base: ".controlplane/vault".to_string(),
            trace_base: ".controlplane/traces".to_string(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_active_runs: 8,
            event_buffer: 256,
            approval_sweep_interval_ms: 1_000,
            stall_timeout_ms: 0,
        }
    }
}

impl ControlPlaneConfig {
    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ParseError`] on malformed TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`], [`ConfigError::ParseError`], or
    /// [`ConfigError::ValidationError`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation. Collects every problem before failing.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing each problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();

        if self.bind.trim().is_empty() {
            reasons.push("bind address must not be empty".to_string());
        }
        if self.workspace_id.trim().is_empty() {
            reasons.push("workspace_id must not be empty".to_string());
        }
        if self.limits.max_active_runs == 0 {
            reasons.push("limits.max_active_runs must be at least 1".to_string());
        }
        if self.limits.event_buffer == 0 {
            reasons.push("limits.event_buffer must be at least 1".to_string());
        }
        if self.limits.approval_sweep_interval_ms == 0 {
            reasons.push("limits.approval_sweep_interval_ms must be positive".to_string());
        }
        for (workspace, budget) in &self.budgets {
            if let (Some(day), Some(month)) = (budget.per_day_cents, budget.per_month_cents)
                && day > month
            {
                reasons.push(format!(
                    "budget for '{workspace}': per_day_cents exceeds per_month_cents"
                ));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings for a valid config.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.budgets.is_empty() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "budgets".to_string(),
                hint: "workspace spend is unbounded".to_string(),
            });
        }
        if self.limits.approval_sweep_interval_ms > 10_000 {
            warnings.push(ConfigWarning::LargeSweepInterval {
                millis: self.limits.approval_sweep_interval_ms,
            });
        }
        if self.limits.event_buffer < 64 {
            warnings.push(ConfigWarning::SmallEventBuffer {
                size: self.limits.event_buffer,
            });
        }
        warnings
    }

    /// Merge an overlay on top of this config: non-default overlay fields
    /// win, budgets are unioned with the overlay taking precedence.
    #[must_use]
    pub fn merged_with(mut self, overlay: Self) -> Self {
        let defaults = Self::default();
        if overlay.bind != defaults.bind {
            self.bind = overlay.bind;
        }
        if overlay.workspace_id != defaults.workspace_id {
            self.workspace_id = overlay.workspace_id;
        }
        if overlay.vault.artifact_base != defaults.vault.artifact_base {
            self.vault.artifact_base = overlay.vault.artifact_base;
        }
        if overlay.vault.trace_base != defaults.vault.trace_base {
            self.vault.trace_base = overlay.vault.trace_base;
        }
        if overlay.limits.max_active_runs != defaults.limits.max_active_runs {
            self.limits.max_active_runs = overlay.limits.max_active_runs;
        }
        if overlay.limits.event_buffer != defaults.limits.event_buffer {
            self.limits.event_buffer = overlay.limits.event_buffer;
        }
        if overlay.limits.approval_sweep_interval_ms != defaults.limits.approval_sweep_interval_ms {
            self.limits.approval_sweep_interval_ms = overlay.limits.approval_sweep_interval_ms;
        }
        if overlay.limits.stall_timeout_ms != defaults.limits.stall_timeout_ms {
            self.limits.stall_timeout_ms = overlay.limits.stall_timeout_ms;
        }
        for (workspace, budget) in overlay.budgets {
            self.budgets.insert(workspace, budget);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = ControlPlaneConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn toml_roundtrip() {
        let raw = r#"
            bind = "0.0.0.0:9000"
            workspace_id = "research"

            [vault]
            artifact_base = "/vault/notes"
            trace_base = "/vault/traces"

            [limits]
            max_active_runs = 4
            event_buffer = 128
            approval_sweep_interval_ms = 500
            stall_timeout_ms = 30000

            [budgets.research]
            per_day_cents = 500
            per_month_cents = 5000
        "#;
        let config = ControlPlaneConfig::from_toml_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.limits.max_active_runs, 4);
        assert_eq!(
            config.budgets.get("research").unwrap().per_day_cents,
            Some(500)
        );
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = ControlPlaneConfig::from_toml_str("bind = [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_collects_all_problems() {
        let mut config = ControlPlaneConfig::default();
        config.bind = " ".into();
        config.limits.max_active_runs = 0;
        config.limits.approval_sweep_interval_ms = 0;
        let ConfigError::ValidationError { reasons } = config.validate().unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn inverted_budget_is_rejected() {
        let mut config = ControlPlaneConfig::default();
        config.budgets.insert(
            "ws".into(),
            WorkspaceBudgetConfig {
                per_day_cents: Some(1000),
                per_month_cents: Some(100),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn warnings_are_advisory() {
        let mut config = ControlPlaneConfig::default();
        config.limits.event_buffer = 16;
        config.limits.approval_sweep_interval_ms = 60_000;
        config.validate().unwrap();

        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::SmallEventBuffer { .. })));
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeSweepInterval { .. })));
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::MissingOptionalField { .. })));
    }

    #[test]
    fn merge_prefers_overlay_non_defaults() {
        let base = ControlPlaneConfig::from_toml_str("bind = \"0.0.0.0:1\"").unwrap();
        let overlay = ControlPlaneConfig::from_toml_str(
            "[limits]\nmax_active_runs = 2",
        )
        .unwrap();
        let merged = base.merged_with(overlay);
        assert_eq!(merged.bind, "0.0.0.0:1");
        assert_eq!(merged.limits.max_active_runs, 2);
    }

    #[test]
    fn load_missing_file() {
        let err = ControlPlaneConfig::load(Path::new("/nonexistent/acp.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
