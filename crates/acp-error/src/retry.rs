// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-category retry policies with exponential backoff.
//!
//! The caps are fixed per failure kind: transient failures get three
//! attempts at 2s/4s/8s, a sandbox crash gets one recovery attempt, a stall
//! gets one nudge, and everything else is terminal on first occurrence.
//! Tool failures are retried by the agent itself, not the orchestrator, so
//! the orchestrator-side budget for them is zero.

use crate::RunError;
use acp_core::RunErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget and backoff shape for one failure category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt. `0` means fail fast.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Multiplier applied per subsequent retry.
    pub factor: u32,
    /// Cap on any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

/// Serde helper — `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            factor: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// The documented policy for a failure kind.
    #[must_use]
    pub fn for_kind(kind: RunErrorKind) -> Self {
        match kind {
            RunErrorKind::Transient => Self {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                factor: 2,
                max_delay: Duration::from_secs(8),
            },
            RunErrorKind::SandboxCrash | RunErrorKind::Stalled => Self {
                max_retries: 1,
                base_delay: Duration::from_secs(2),
                factor: 1,
                max_delay: Duration::from_secs(2),
            },
            // The agent retries its own tool failures; approval timeouts
            // are governed by the checkpoint's timeout action.
            RunErrorKind::ToolFailure
            | RunErrorKind::AgentError
            | RunErrorKind::ContractViolation
            | RunErrorKind::Timeout
            | RunErrorKind::ApprovalTimeout => Self::none(),
        }
    }

    /// Backoff delay before retry number `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.factor.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Record of a single failed attempt, kept for the run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error message from this attempt.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

/// Metadata captured across all attempts of one retried operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one).
    pub total_attempts: u32,
    /// Records of each *failed* attempt.
    pub failed_attempts: Vec<RetryAttempt>,
}

impl RetryMetadata {
    /// Flatten into key-value pairs suitable for the trace.
    #[must_use]
    pub fn to_trace_context(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert(
            "retry_total_attempts".into(),
            serde_json::json!(self.total_attempts),
        );
        if !self.failed_attempts.is_empty() {
            let attempts: Vec<_> = self
                .failed_attempts
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "attempt": a.attempt,
                        "error": a.error,
                        "delay_ms": a.delay.as_millis() as u64,
                    })
                })
                .collect();
            map.insert("retry_failed_attempts".into(), serde_json::json!(attempts));
        }
        map
    }
}

/// Result of a retried operation together with its attempt history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The operation result: `Ok` from the first successful attempt, or the
    /// last error once the budget is exhausted.
    pub result: Result<T, RunError>,
    /// Attempt history for the trace.
    pub metadata: RetryMetadata,
}

/// Run `op` under the policy for its failure kind.
///
/// The operation is invoked once, then retried with exponential backoff up
/// to the policy's budget. Each failure is recorded; the metadata is
/// returned regardless of outcome so the trace can enumerate the history.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RunError>>,
{
    let mut metadata = RetryMetadata::default();
    let mut attempt: u32 = 0;

    loop {
        metadata.total_attempts += 1;
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    metadata,
                };
            }
            Err(err) => {
                if attempt >= policy.max_retries {
                    if policy.max_retries > 0 {
                        warn!(
                            target: "acp.error",
                            kind = %err.kind,
                            attempts = metadata.total_attempts,
                            "retry budget exhausted"
                        );
                    }
                    metadata.failed_attempts.push(RetryAttempt {
                        attempt,
                        error: err.to_string(),
                        delay: Duration::ZERO,
                    });
                    return RetryOutcome {
                        result: Err(err),
                        metadata,
                    };
                }

                attempt += 1;
                let delay = policy.delay_for(attempt);
                debug!(
                    target: "acp.error",
                    kind = %err.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                metadata.failed_attempts.push(RetryAttempt {
                    attempt: attempt - 1,
                    error: err.to_string(),
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_backoff_is_2_4_8() {
        let p = RetryPolicy::for_kind(RunErrorKind::Transient);
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        // Capped beyond the table.
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn non_retryable_kinds_fail_fast() {
        for kind in [
            RunErrorKind::ToolFailure,
            RunErrorKind::AgentError,
            RunErrorKind::ContractViolation,
            RunErrorKind::Timeout,
            RunErrorKind::ApprovalTimeout,
        ] {
            assert_eq!(RetryPolicy::for_kind(kind).max_retries, 0, "{kind:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let policy = RetryPolicy::for_kind(RunErrorKind::Transient);

        let outcome = retry_with_policy(&policy, move || {
            let calls = Arc::clone(&calls2);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(RunError::new(RunErrorKind::Transient, "blip"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.metadata.total_attempts, 3);
        assert_eq!(outcome.metadata.failed_attempts.len(), 2);
        assert_eq!(outcome.metadata.failed_attempts[0].delay, Duration::from_secs(2));
        assert_eq!(outcome.metadata.failed_attempts[1].delay, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_and_reports_last_error() {
        let policy = RetryPolicy::for_kind(RunErrorKind::Transient);
        let outcome: RetryOutcome<()> = retry_with_policy(&policy, || async {
            Err(RunError::new(RunErrorKind::Transient, "still down"))
        })
        .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, RunErrorKind::Transient);
        // Initial attempt + 3 retries.
        assert_eq!(outcome.metadata.total_attempts, 4);
        assert_eq!(outcome.metadata.failed_attempts.len(), 4);
    }

    #[tokio::test]
    async fn zero_budget_runs_exactly_once() {
        let policy = RetryPolicy::none();
        let outcome: RetryOutcome<()> = retry_with_policy(&policy, || async {
            Err(RunError::new(RunErrorKind::ContractViolation, "denied"))
        })
        .await;
        assert_eq!(outcome.metadata.total_attempts, 1);
        assert!(outcome.result.is_err());
    }

    #[test]
    fn trace_context_includes_attempts() {
        let meta = RetryMetadata {
            total_attempts: 3,
            failed_attempts: vec![RetryAttempt {
                attempt: 0,
                error: "blip".into(),
                delay: Duration::from_secs(2),
            }],
        };
        let ctx = meta.to_trace_context();
        assert_eq!(ctx["retry_total_attempts"], serde_json::json!(3));
        assert!(ctx.contains_key("retry_failed_attempts"));
    }
}
