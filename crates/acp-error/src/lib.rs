// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-error
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Per-category retry policies with exponential backoff.
pub mod retry;

use acp_core::{RunErrorInfo, RunErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use retry::{RetryAttempt, RetryMetadata, RetryOutcome, RetryPolicy, retry_with_policy};

/// A classified control-plane failure.
///
/// Every failure that can terminate a run carries exactly one
/// [`RunErrorKind`], a human-readable message, and arbitrary key-value
/// context for the trace.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RunError {
    /// Classified failure kind.
    pub kind: RunErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary structured context (attempt counts, tool names, paths).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl RunError {
    /// Create an error with no context.
    #[must_use]
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether a retry of the whole run could plausibly succeed.
    ///
    /// Mirrors the retry table: categories with a local-recovery budget are
    /// recoverable; contract violations, agent errors, and timeouts are not.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        matches!(
            self.kind,
            RunErrorKind::Transient
                | RunErrorKind::ToolFailure
                | RunErrorKind::SandboxCrash
                | RunErrorKind::Stalled
        )
    }

    /// Convert into the record stored on the run document.
    #[must_use]
    pub fn into_info(self) -> RunErrorInfo {
        let recoverable = self.recoverable();
        RunErrorInfo {
            kind: self.kind,
            message: self.message,
            recoverable,
        }
    }
}
