// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval checkpoint records.

use crate::state::RunState;
use crate::TimeoutAction;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A pause point where a human must approve a proposed action.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Approval {
    /// Stable external id, chosen by the agent when raising the checkpoint.
    pub checkpoint_id: String,
    /// Run the checkpoint belongs to.
    pub run_id: Uuid,
    /// Action type the checkpoint gates (e.g. `"send_email"`).
    pub action_type: String,
    /// Opaque structured preview shown to the approver.
    pub preview: serde_json::Value,
    /// Current resolution status.
    pub status: ApprovalStatus,
    /// Run phase captured when the checkpoint was requested.
    pub requested_from_phase: RunState,
    /// When the checkpoint was raised.
    pub created_at: DateTime<Utc>,
    /// When the timeout sweep will auto-resolve it.
    pub expires_at: DateTime<Utc>,
    /// What the sweep does at expiry.
    pub timeout_action: TimeoutAction,
    /// When the checkpoint was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it (user id, or `None` for timeouts).
    pub resolved_by: Option<String>,
    /// Which surface the resolution came from.
    pub resolved_from: Option<ResolutionSource>,
    /// Why it was rejected, when it was.
    pub rejection_reason: Option<RejectionReason>,
}

impl Approval {
    /// Returns `true` while the checkpoint awaits resolution.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Returns `true` once `now` has passed the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at <= now
    }
}

/// Resolution status of an [`Approval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a human.
    Pending,
    /// Approved; the run resumed.
    Approved,
    /// Rejected; the run moved per the rejection reason.
    Rejected,
    /// Expired with `reject`; the run terminated in `timeout`.
    Timeout,
}

/// Which surface resolved a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Web dashboard.
    Web,
    /// Desktop client.
    Desktop,
    /// Mobile client.
    Mobile,
    /// Direct API call.
    Api,
    /// The timeout sweep.
    Timeout,
    /// A bulk resolution.
    Bulk,
}

/// Why a checkpoint was rejected. Each reason maps to a distinct run
/// transition target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The user cancelled the run outright.
    UserCancelled,
    /// The user wants the agent to revise; the run pauses for replanning.
    NeedsEdit,
    /// The proposed action violates policy; the run fails.
    PolicyViolation,
}

impl RejectionReason {
    /// The run state a rejection with this reason transitions to.
    #[must_use]
    pub fn target_state(&self) -> RunState {
        match self {
            Self::UserCancelled => RunState::Cancelled,
            Self::NeedsEdit => RunState::Paused,
            Self::PolicyViolation => RunState::Failed,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserCancelled => "user_cancelled",
            Self::NeedsEdit => "needs_edit",
            Self::PolicyViolation => "policy_violation",
        };
        f.write_str(s)
    }
}
