// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pure run state machine.
//!
//! [`RunState`] enumerates the lifecycle states, [`RunState::valid_transitions`]
//! is the exhaustive allowed-transition table, and [`apply_transition`] is the
//! only code that mutates a run's `state`, `previous_state`, and lifecycle
//! timestamps. Everything else requests changes through the ledger, which
//! delegates here.

use crate::run::Run;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet admitted.
    Pending,
    /// Sandbox being provisioned, inputs mounted.
    Initializing,
    /// The agent is planning.
    Planning,
    /// The agent is executing tool calls.
    Executing,
    /// Success criteria are being evaluated.
    Verifying,
    /// Deliverables are being packaged into the vault.
    Packaging,
    /// Blocked on a human checkpoint.
    AwaitingApproval,
    /// Suspended by a user or a `needs_edit` rejection.
    Paused,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: failed with a classified error.
    Failed,
    /// Terminal: cancelled by a user.
    Cancelled,
    /// Terminal: an approval checkpoint expired with `reject`.
    Timeout,
}

impl RunState {
    /// Returns `true` if this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Returns `true` for the two suspension states a run resumes out of.
    #[must_use]
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::Paused)
    }

    /// Returns the set of states that are valid successors of `self`.
    ///
    /// This table is exhaustive; [`apply_transition`] rejects anything
    /// not listed here.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Pending => &[Initializing, Cancelled],
            Initializing => &[Planning, Failed, Cancelled],
            Planning => &[Executing, AwaitingApproval, Paused, Failed, Cancelled],
            Executing => &[Verifying, AwaitingApproval, Paused, Failed, Cancelled],
            Verifying => &[Packaging, Executing, Paused, Failed, Cancelled],
            Packaging => &[Completed, Failed, Cancelled],
            AwaitingApproval => &[
                Planning, Executing, Verifying, Paused, Cancelled, Failed, Timeout,
            ],
            Paused => &[Planning, Executing, Verifying, Cancelled],
            Completed | Failed | Cancelled | Timeout => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is listed.
    #[must_use]
    pub fn can_transition_to(&self, next: RunState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Packaging => "packaging",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: RunState,
    /// State after the transition.
    pub to: RunState,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}

/// Errors from [`apply_transition`]. The run is never mutated on error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The requested transition is not in the allowed table.
    #[error("invalid transition from {from} to {to}")]
    Invalid {
        /// Current state.
        from: RunState,
        /// Requested target state.
        to: RunState,
    },

    /// Resuming must return to the state captured when the run suspended.
    #[error("resume must return to {expected}, got {requested}")]
    WrongResumeTarget {
        /// The captured previous state.
        expected: RunState,
        /// The state the caller asked for.
        requested: RunState,
    },
}

/// Apply a state transition to a run.
///
/// On success the run's `state`, `previous_state`, `updated_at`, and
/// (where the table says so) `started_at` / `completed_at` are updated and
/// the applied [`TransitionRecord`] is returned. On error nothing is
/// mutated.
///
/// `previous_state` tracks the last *active* phase: chaining one
/// suspension into another (`awaiting_approval → paused`) keeps the
/// original capture, so a later resume still lands on the phase the run
/// was actually in when it first suspended.
///
/// # Errors
///
/// [`TransitionError::Invalid`] for transitions not in the table, and
/// [`TransitionError::WrongResumeTarget`] when resuming out of
/// `awaiting_approval`/`paused` to anything but the captured phase.
pub fn apply_transition(run: &mut Run, to: RunState) -> Result<TransitionRecord, TransitionError> {
    let from = run.state;

    if !from.can_transition_to(to) {
        return Err(TransitionError::Invalid { from, to });
    }

    // Resume targets are pinned to the captured phase.
    if from.is_suspension() && matches!(to, RunState::Planning | RunState::Executing | RunState::Verifying) {
        if let Some(expected) = run.previous_state
            && expected != to
        {
            return Err(TransitionError::WrongResumeTarget {
                expected,
                requested: to,
            });
        }
    }

    let now = Utc::now();

    if !(from.is_suspension() && to.is_suspension()) {
        run.previous_state = Some(from);
    }
    run.state = to;
    run.updated_at = now;

    if from == RunState::Pending && to == RunState::Initializing {
        run.started_at = Some(now);
    }
    if to.is_terminal() {
        run.completed_at = Some(now);
    }

    Ok(TransitionRecord { from, to, at: now })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContractBuilder;

    fn test_run() -> Run {
        Run::new("ws-1", ContractBuilder::new("t").build())
    }

    fn drive(run: &mut Run, states: &[RunState]) {
        for s in states {
            apply_transition(run, *s).unwrap();
        }
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut run = test_run();
        drive(
            &mut run,
            &[
                RunState::Initializing,
                RunState::Planning,
                RunState::Executing,
                RunState::Verifying,
                RunState::Packaging,
                RunState::Completed,
            ],
        );
        assert_eq!(run.state, RunState::Completed);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn pending_cannot_jump_to_executing() {
        let mut run = test_run();
        let err = apply_transition(&mut run, RunState::Executing).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                from: RunState::Pending,
                to: RunState::Executing
            }
        );
        // No mutation on failure.
        assert_eq!(run.state, RunState::Pending);
        assert!(run.previous_state.is_none());
        assert!(run.started_at.is_none());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
            RunState::Timeout,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn resume_returns_to_captured_phase() {
        let mut run = test_run();
        drive(
            &mut run,
            &[RunState::Initializing, RunState::Planning, RunState::Executing],
        );
        apply_transition(&mut run, RunState::Paused).unwrap();
        assert_eq!(run.previous_state, Some(RunState::Executing));

        let err = apply_transition(&mut run, RunState::Planning).unwrap_err();
        assert!(matches!(err, TransitionError::WrongResumeTarget { .. }));

        apply_transition(&mut run, RunState::Executing).unwrap();
        assert_eq!(run.state, RunState::Executing);
    }

    #[test]
    fn chained_suspension_keeps_original_capture() {
        let mut run = test_run();
        drive(
            &mut run,
            &[RunState::Initializing, RunState::Planning, RunState::Executing],
        );
        // Checkpoint raised, then rejected with needs_edit.
        apply_transition(&mut run, RunState::AwaitingApproval).unwrap();
        apply_transition(&mut run, RunState::Paused).unwrap();
        assert_eq!(run.previous_state, Some(RunState::Executing));

        // Resume lands back on executing, not awaiting_approval.
        apply_transition(&mut run, RunState::Executing).unwrap();
        assert_eq!(run.state, RunState::Executing);
    }

    #[test]
    fn awaiting_approval_can_time_out() {
        let mut run = test_run();
        drive(
            &mut run,
            &[RunState::Initializing, RunState::Planning, RunState::AwaitingApproval],
        );
        apply_transition(&mut run, RunState::Timeout).unwrap();
        assert_eq!(run.state, RunState::Timeout);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn verifying_may_loop_back_to_executing() {
        let mut run = test_run();
        drive(
            &mut run,
            &[
                RunState::Initializing,
                RunState::Planning,
                RunState::Executing,
                RunState::Verifying,
                RunState::Executing,
            ],
        );
        assert_eq!(run.state, RunState::Executing);
    }

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&RunState::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        assert_eq!(RunState::AwaitingApproval.to_string(), "awaiting_approval");
    }
}
