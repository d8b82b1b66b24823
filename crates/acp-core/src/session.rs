// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent session bookkeeping.
//!
//! One session per run, tracking the sandbox process behind it. The adapter
//! owns the process; this record is what the control plane knows about it.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bookkeeping for the sandbox process executing a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentSession {
    /// Unique session identifier.
    pub session_id: Uuid,
    /// Run this session executes.
    pub run_id: Uuid,
    /// Which agent profile is running (e.g. `"researcher"`).
    pub agent_slug: String,
    /// Opaque handle issued by the sandbox adapter.
    pub sandbox_handle: String,
    /// OS process id, when the adapter exposes one.
    pub pid: Option<u32>,
    /// Current process state.
    pub state: SessionState,
    /// When the sandbox was requested.
    pub started_at: DateTime<Utc>,
    /// When the process stopped.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Human-readable exit reason (e.g. `"completed"`, `"killed: timeout"`).
    pub exit_reason: Option<String>,
    /// Last heartbeat received from the sandbox.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AgentSession {
    /// Create a session in [`SessionState::Starting`].
    #[must_use]
    pub fn new(run_id: Uuid, agent_slug: impl Into<String>, sandbox_handle: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            run_id,
            agent_slug: agent_slug.into(),
            sandbox_handle: sandbox_handle.into(),
            pid: None,
            state: SessionState::Starting,
            started_at: Utc::now(),
            stopped_at: None,
            exit_code: None,
            exit_reason: None,
            last_heartbeat: None,
        }
    }

    /// Record a heartbeat.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    /// Mark the session stopped with an exit code and reason.
    pub fn stop(&mut self, state: SessionState, exit_code: Option<i32>, reason: impl Into<String>) {
        self.state = state;
        self.stopped_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.exit_reason = Some(reason.into());
    }
}

/// Process state of an [`AgentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Sandbox requested, process not confirmed yet.
    Starting,
    /// Process confirmed alive (first signal or heartbeat received).
    Running,
    /// Process stopped cleanly.
    Stopped,
    /// Process died without a clean exit.
    Crashed,
}

impl SessionState {
    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Crashed)
                | (Self::Starting, Self::Stopped)
                | (Self::Running, Self::Stopped)
                | (Self::Running, Self::Crashed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_starting() {
        let s = AgentSession::new(Uuid::new_v4(), "researcher", "sbx-1");
        assert_eq!(s.state, SessionState::Starting);
        assert!(s.last_heartbeat.is_none());
    }

    #[test]
    fn stop_records_exit() {
        let mut s = AgentSession::new(Uuid::new_v4(), "researcher", "sbx-1");
        s.state = SessionState::Running;
        s.stop(SessionState::Stopped, Some(0), "completed");
        assert_eq!(s.exit_code, Some(0));
        assert_eq!(s.exit_reason.as_deref(), Some("completed"));
        assert!(s.stopped_at.is_some());
    }

    #[test]
    fn stopped_is_final() {
        assert!(!SessionState::Stopped.can_transition_to(SessionState::Running));
        assert!(!SessionState::Crashed.can_transition_to(SessionState::Running));
        assert!(SessionState::Starting.can_transition_to(SessionState::Running));
        assert!(SessionState::Running.can_transition_to(SessionState::Crashed));
    }
}
