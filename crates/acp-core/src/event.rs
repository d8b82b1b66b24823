// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sequence-numbered run events.
//!
//! Events are immutable after append. The payload is a type-discriminated
//! variant serialized with `#[serde(tag = "type")]` and flattened into the
//! envelope, so the wire shape carries a single `type` field next to the
//! envelope metadata.

use crate::run::{ArtifactRef, RunErrorInfo};
use crate::state::RunState;
use crate::{RejectionReason, ResolutionSource, TimeoutAction};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An append-only record of something observable within a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Unique identifier, used for append deduplication.
    pub event_id: Uuid,
    /// Run this event belongs to.
    pub run_id: Uuid,
    /// Monotonic, gap-free sequence number starting at 0 per run.
    pub seq: u64,
    /// Run state at the moment of emission.
    pub phase: RunState,
    /// Severity classification.
    pub severity: Severity,
    /// Emission timestamp.
    pub ts: DateTime<Utc>,
    /// The payload, discriminated by its `type` field.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Construct an event with a fresh id, current timestamp, and the
    /// payload's default severity.
    #[must_use]
    pub fn new(run_id: Uuid, seq: u64, phase: RunState, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            seq,
            phase,
            severity: payload.default_severity(),
            ts: Utc::now(),
            payload,
        }
    }

    /// Override the severity (e.g. an `info`-level drift entry).
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// The event's type discriminator.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine progress.
    Info,
    /// Something off-contract or degraded, run continues.
    Warning,
    /// A failure.
    Error,
}

/// The payload discriminator for [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// The run has been admitted and the sandbox is being prepared.
    #[serde(rename = "run.started")]
    RunStarted {
        /// The contract goal, for display.
        goal: String,
    },

    /// The run advanced to a new phase.
    #[serde(rename = "phase.changed")]
    PhaseChanged {
        /// Phase before the change.
        from: RunState,
        /// Phase after the change.
        to: RunState,
    },

    /// The agent invoked a tool (after passing the contract check).
    #[serde(rename = "tool.called")]
    ToolCalled {
        /// Tool name.
        tool: String,
        /// Correlation id chosen by the agent, if any.
        tool_use_id: Option<String>,
        /// JSON arguments passed to the tool.
        args: serde_json::Value,
    },

    /// A tool invocation produced a result.
    #[serde(rename = "tool.result")]
    ToolResult {
        /// Tool name.
        tool: String,
        /// Correlation id matching the originating call.
        tool_use_id: Option<String>,
        /// JSON output of the tool.
        output: serde_json::Value,
        /// Whether the tool reported an error.
        is_error: bool,
    },

    /// A file changed inside the sandbox workspace.
    #[serde(rename = "file.changed")]
    FileChanged {
        /// Path relative to the sandbox workspace root.
        path: String,
        /// Human-readable summary of the change.
        summary: String,
    },

    /// An artifact was produced.
    #[serde(rename = "artifact.created")]
    ArtifactCreated {
        /// Reference recorded on the run document.
        artifact: ArtifactRef,
    },

    /// The agent raised a human checkpoint.
    #[serde(rename = "checkpoint.requested")]
    CheckpointRequested {
        /// Stable checkpoint id chosen by the agent.
        checkpoint_id: String,
        /// Action type the checkpoint gates.
        action_type: String,
        /// Opaque preview shown to the approver.
        preview: serde_json::Value,
    },

    /// A checkpoint was approved.
    #[serde(rename = "checkpoint.approved")]
    CheckpointApproved {
        /// The resolved checkpoint.
        checkpoint_id: String,
        /// Who approved.
        resolved_by: String,
        /// Where the resolution came from.
        source: ResolutionSource,
    },

    /// A checkpoint was rejected.
    #[serde(rename = "checkpoint.rejected")]
    CheckpointRejected {
        /// The resolved checkpoint.
        checkpoint_id: String,
        /// Why it was rejected.
        reason: RejectionReason,
        /// Who rejected, when known.
        resolved_by: Option<String>,
        /// Where the resolution came from.
        source: ResolutionSource,
    },

    /// A checkpoint expired and its timeout action was applied.
    #[serde(rename = "checkpoint.timeout")]
    CheckpointTimeout {
        /// The expired checkpoint.
        checkpoint_id: String,
        /// The automatic action that was applied.
        action_taken: TimeoutAction,
    },

    /// The agent attempted something its contract forbids.
    #[serde(rename = "drift.detected")]
    DriftDetected {
        /// Which rule fired (e.g. `"tool_policy"`, `"path_blocked"`).
        rule: String,
        /// Human-readable reason.
        reason: String,
        /// Tool involved, when the drift was a tool call.
        tool: Option<String>,
        /// Suggested fallback for the agent, if any.
        fallback: Option<String>,
    },

    /// Terminal: the run finished successfully.
    #[serde(rename = "run.completed")]
    RunCompleted {
        /// Number of artifacts packaged.
        artifact_count: u64,
    },

    /// Terminal: the run failed.
    #[serde(rename = "run.failed")]
    RunFailed {
        /// The classified error.
        error: RunErrorInfo,
    },
}

impl EventPayload {
    /// The type discriminator for this payload.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted { .. } => EventType::RunStarted,
            Self::PhaseChanged { .. } => EventType::PhaseChanged,
            Self::ToolCalled { .. } => EventType::ToolCalled,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::FileChanged { .. } => EventType::FileChanged,
            Self::ArtifactCreated { .. } => EventType::ArtifactCreated,
            Self::CheckpointRequested { .. } => EventType::CheckpointRequested,
            Self::CheckpointApproved { .. } => EventType::CheckpointApproved,
            Self::CheckpointRejected { .. } => EventType::CheckpointRejected,
            Self::CheckpointTimeout { .. } => EventType::CheckpointTimeout,
            Self::DriftDetected { .. } => EventType::DriftDetected,
            Self::RunCompleted { .. } => EventType::RunCompleted,
            Self::RunFailed { .. } => EventType::RunFailed,
        }
    }

    /// Severity assigned when the emitter does not override it.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::DriftDetected { .. } | Self::CheckpointTimeout { .. } => Severity::Warning,
            Self::RunFailed { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Returns `true` for the payloads that close a run's event log.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}

/// The closed set of event type discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum EventType {
    /// `run.started`
    #[serde(rename = "run.started")]
    RunStarted,
    /// `phase.changed`
    #[serde(rename = "phase.changed")]
    PhaseChanged,
    /// `tool.called`
    #[serde(rename = "tool.called")]
    ToolCalled,
    /// `tool.result`
    #[serde(rename = "tool.result")]
    ToolResult,
    /// `file.changed`
    #[serde(rename = "file.changed")]
    FileChanged,
    /// `artifact.created`
    #[serde(rename = "artifact.created")]
    ArtifactCreated,
    /// `checkpoint.requested`
    #[serde(rename = "checkpoint.requested")]
    CheckpointRequested,
    /// `checkpoint.approved`
    #[serde(rename = "checkpoint.approved")]
    CheckpointApproved,
    /// `checkpoint.rejected`
    #[serde(rename = "checkpoint.rejected")]
    CheckpointRejected,
    /// `checkpoint.timeout`
    #[serde(rename = "checkpoint.timeout")]
    CheckpointTimeout,
    /// `drift.detected`
    #[serde(rename = "drift.detected")]
    DriftDetected,
    /// `run.completed`
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// `run.failed`
    #[serde(rename = "run.failed")]
    RunFailed,
}

impl EventType {
    /// Stable dotted name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::PhaseChanged => "phase.changed",
            Self::ToolCalled => "tool.called",
            Self::ToolResult => "tool.result",
            Self::FileChanged => "file.changed",
            Self::ArtifactCreated => "artifact.created",
            Self::CheckpointRequested => "checkpoint.requested",
            Self::CheckpointApproved => "checkpoint.approved",
            Self::CheckpointRejected => "checkpoint.rejected",
            Self::CheckpointTimeout => "checkpoint.timeout",
            Self::DriftDetected => "drift.detected",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "run.started" => Self::RunStarted,
            "phase.changed" => Self::PhaseChanged,
            "tool.called" => Self::ToolCalled,
            "tool.result" => Self::ToolResult,
            "file.changed" => Self::FileChanged,
            "artifact.created" => Self::ArtifactCreated,
            "checkpoint.requested" => Self::CheckpointRequested,
            "checkpoint.approved" => Self::CheckpointApproved,
            "checkpoint.rejected" => Self::CheckpointRejected,
            "checkpoint.timeout" => Self::CheckpointTimeout,
            "drift.detected" => Self::DriftDetected,
            "run.completed" => Self::RunCompleted,
            "run.failed" => Self::RunFailed,
            other => return Err(UnknownEventType(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(payload: EventPayload) -> Event {
        Event::new(Uuid::new_v4(), 0, RunState::Planning, payload)
    }

    #[test]
    fn envelope_carries_flat_type_tag() {
        let ev = sample_event(EventPayload::ToolCalled {
            tool: "write".into(),
            tool_use_id: Some("t1".into()),
            args: json!({"path": "out.md"}),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool.called");
        assert_eq!(v["tool"], "write");
        assert_eq!(v["seq"], 0);
        assert_eq!(v["phase"], "planning");
    }

    #[test]
    fn event_serde_roundtrip() {
        let ev = sample_event(EventPayload::DriftDetected {
            rule: "tool_policy".into(),
            reason: "tool 'delete' is blocked".into(),
            tool: Some("delete".into()),
            fallback: None,
        });
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), EventType::DriftDetected);
        assert_eq!(back.severity, Severity::Warning);
        assert_eq!(back.payload, ev.payload);
    }

    #[test]
    fn default_severities() {
        assert_eq!(
            EventPayload::RunStarted { goal: "g".into() }.default_severity(),
            Severity::Info
        );
        assert_eq!(
            EventPayload::RunFailed {
                error: crate::RunErrorInfo::new(crate::RunErrorKind::Timeout, "slow", false)
            }
            .default_severity(),
            Severity::Error
        );
    }

    #[test]
    fn terminal_payloads() {
        assert!(EventPayload::RunCompleted { artifact_count: 0 }.is_terminal());
        assert!(
            EventPayload::RunFailed {
                error: crate::RunErrorInfo::new(crate::RunErrorKind::AgentError, "x", false)
            }
            .is_terminal()
        );
        assert!(!EventPayload::RunStarted { goal: "g".into() }.is_terminal());
    }

    #[test]
    fn event_type_display_parse_roundtrip() {
        for t in [
            EventType::RunStarted,
            EventType::PhaseChanged,
            EventType::ToolCalled,
            EventType::ToolResult,
            EventType::FileChanged,
            EventType::ArtifactCreated,
            EventType::CheckpointRequested,
            EventType::CheckpointApproved,
            EventType::CheckpointRejected,
            EventType::CheckpointTimeout,
            EventType::DriftDetected,
            EventType::RunCompleted,
            EventType::RunFailed,
        ] {
            let s = t.to_string();
            assert_eq!(s.parse::<EventType>().unwrap(), t);
        }
        assert!("bogus.type".parse::<EventType>().is_err());
    }
}
