// SPDX-License-Identifier: MIT OR Apache-2.0
//! The raw wire model between a sandbox and the control plane.
//!
//! Sandboxes emit [`SandboxSignal`]s; the orchestrator normalizes them into
//! events. The control plane talks back with [`AgentDirective`]s: denials,
//! checkpoint resolutions, pause/resume, and stall nudges.

use acp_core::RunState;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One raw signal from a sandbox, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SandboxSignal {
    /// A structured agent message (the normalization source).
    Stdout(AgentMessage),
    /// Free-form diagnostic output; logged, never stored.
    Stderr(String),
    /// The agent produced a result.
    Result(AgentResult),
    /// The agent (or sandbox) failed.
    Error(AgentFailure),
    /// Liveness ping; updates the session, never stored.
    Heartbeat,
}

/// Structured agent messages carried on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum AgentMessage {
    /// The agent declares it has entered a lifecycle phase.
    Phase {
        /// The declared phase (`planning`, `executing`, `verifying`).
        phase: RunState,
    },
    /// The agent proposes a tool call.
    ToolCall {
        /// Tool name.
        tool: String,
        /// Correlation id chosen by the agent.
        tool_use_id: Option<String>,
        /// JSON arguments.
        args: serde_json::Value,
    },
    /// A tool call finished inside the sandbox.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Correlation id matching the call.
        tool_use_id: Option<String>,
        /// JSON output.
        output: serde_json::Value,
        /// Whether the tool reported an error.
        is_error: bool,
    },
    /// The agent changed a file in its workspace.
    FileChanged {
        /// Path relative to the sandbox workspace root.
        path: String,
        /// Human-readable summary.
        summary: String,
    },
    /// The agent raises a human checkpoint.
    Checkpoint {
        /// Stable checkpoint id chosen by the agent.
        checkpoint_id: String,
        /// Action type being gated.
        action_type: String,
        /// Opaque preview for the approver.
        preview: serde_json::Value,
    },
    /// Incremental spend report.
    Usage {
        /// Compute cents consumed since the last report.
        compute_cents: u64,
        /// API cents consumed since the last report.
        api_cents: u64,
    },
    /// Free-text progress note; logged, never stored.
    Log {
        /// The note.
        text: String,
    },
}

/// Result signals, discriminated into artifacts and completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentResult {
    /// A deliverable is ready for packaging.
    Artifact {
        /// The deliverable this artifact fulfils.
        deliverable_id: String,
        /// Where the bytes live inside the sandbox.
        sandbox_path: String,
    },
    /// The agent is done; the orchestrator moves to packaging.
    Complete {
        /// Optional summary message.
        message: Option<String>,
    },
}

/// A failure reported by the agent or the sandbox runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentFailure {
    /// Human-readable message.
    pub message: String,
    /// Sandbox-side classification hint (`"transient"`, `"crash"`, …).
    pub class: Option<String>,
}

/// Control-plane messages delivered back into the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum AgentDirective {
    /// A proposed tool call was denied; the agent may adapt.
    ToolDenied {
        /// The denied tool.
        tool: String,
        /// Why.
        reason: String,
        /// Suggested fallback, if any.
        fallback: Option<String>,
    },
    /// A checkpoint resolved; the agent may proceed or re-plan.
    CheckpointResolved {
        /// The checkpoint.
        checkpoint_id: String,
        /// `true` when approved.
        approved: bool,
        /// Rejection reason, when rejected.
        reason: Option<String>,
    },
    /// Stop dispatching new work; in-flight calls may finish.
    Pause,
    /// Resume from a pause.
    Resume,
    /// The control plane saw no progress; report in or be failed.
    Nudge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_wire_shape() {
        let signal = SandboxSignal::Stdout(AgentMessage::ToolCall {
            tool: "write".into(),
            tool_use_id: None,
            args: json!({"path": "out.md"}),
        });
        let v = serde_json::to_value(&signal).unwrap();
        assert_eq!(v["kind"], "stdout");
        assert_eq!(v["payload"]["msg"], "tool_call");
        assert_eq!(v["payload"]["tool"], "write");
    }

    #[test]
    fn heartbeat_has_no_payload() {
        let v = serde_json::to_value(SandboxSignal::Heartbeat).unwrap();
        assert_eq!(v, json!({"kind": "heartbeat"}));
    }

    #[test]
    fn result_discriminates_artifact_and_complete() {
        let artifact = SandboxSignal::Result(AgentResult::Artifact {
            deliverable_id: "D1".into(),
            sandbox_path: "/work/out.md".into(),
        });
        let v = serde_json::to_value(&artifact).unwrap();
        assert_eq!(v["payload"]["result"], "artifact");

        let complete = SandboxSignal::Result(AgentResult::Complete { message: None });
        let v = serde_json::to_value(&complete).unwrap();
        assert_eq!(v["payload"]["result"], "complete");
    }

    #[test]
    fn directive_roundtrip() {
        let d = AgentDirective::CheckpointResolved {
            checkpoint_id: "cp1".into(),
            approved: true,
            reason: None,
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: AgentDirective = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
