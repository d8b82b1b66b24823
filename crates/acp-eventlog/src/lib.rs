// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-eventlog
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Replay-then-tail subscriptions over the broadcast bus.
pub mod subscription;

use acp_core::{Event, EventType, PayloadError, canonical_json, validate_payload};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, trace};
use uuid::Uuid;

pub use subscription::{SubscribeOptions, Subscription, SubscriptionError};

/// Default per-subscriber buffer (events, not bytes).
const DEFAULT_BUFFER: usize = 256;

/// Errors from [`EventLog::append`] and friends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// The run was never registered with the log.
    #[error("unknown run: {0}")]
    RunUnknown(Uuid),

    /// The event's sequence number is not exactly `last + 1`.
    #[error("sequence gap: expected {expected}, got {got}")]
    SeqGap {
        /// The sequence number the log expected.
        expected: u64,
        /// The sequence number the event carried.
        got: u64,
    },

    /// An event with this id exists and differs from the new one.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(Uuid),

    /// The run reached a terminal state; its log accepts no more appends.
    #[error("event log for run {0} is frozen")]
    RunFrozen(Uuid),

    /// The event's payload does not conform to its type's schema.
    #[error("payload failed schema validation: {reasons:?}")]
    PayloadInvalid {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Errors from read-side operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The run was never registered with the log.
    #[error("unknown run: {0}")]
    RunUnknown(Uuid),
}

/// Snapshot of bus statistics for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Events published to the bus for this run.
    pub total_published: u64,
    /// Subscribers currently attached.
    pub active_subscribers: usize,
    /// Events a subscriber missed due to lag.
    pub dropped_events: u64,
}

/// Shared statistics counters, updated by appends and lagging subscribers.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub(crate) total_published: AtomicU64,
    pub(crate) dropped_events: AtomicU64,
}

/// Per-run storage plus the live fan-out channel.
struct RunLog {
    events: Vec<Event>,
    /// event_id → index into `events`, for dedup.
    by_id: HashMap<Uuid, usize>,
    frozen: bool,
    /// Dropped on freeze so tail subscriptions complete.
    tx: Option<broadcast::Sender<Event>>,
    stats: Arc<StatsInner>,
}

impl RunLog {
    fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            events: Vec::new(),
            by_id: HashMap::new(),
            frozen: false,
            tx: Some(tx),
            stats: Arc::new(StatsInner::default()),
        }
    }

    fn last_seq(&self) -> i64 {
        self.events.last().map_or(-1, |e| e.seq as i64)
    }

    /// Validate one event against the current tail. Does not mutate.
    fn check(&self, run_id: Uuid, event: &Event, expected: u64) -> Result<Appended, AppendError> {
        if self.frozen {
            return Err(AppendError::RunFrozen(run_id));
        }
        check_payload(event)?;
        if let Some(&idx) = self.by_id.get(&event.event_id) {
            // Idempotent no-op only when the stored record is identical.
            let same = canonical_json(&self.events[idx]).ok() == canonical_json(event).ok();
            if same {
                return Ok(Appended::Duplicate);
            }
            return Err(AppendError::DuplicateEventId(event.event_id));
        }
        if event.seq != expected {
            return Err(AppendError::SeqGap {
                expected,
                got: event.seq,
            });
        }
        Ok(Appended::Fresh)
    }

    fn commit(&mut self, event: Event) {
        self.by_id.insert(event.event_id, self.events.len());
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = &self.tx {
            // A send with no subscribers is fine; the event is stored.
            let _ = tx.send(event.clone());
        }
        self.events.push(event);
    }

    fn freeze(&mut self) {
        self.frozen = true;
        self.tx = None;
    }
}

enum Appended {
    Fresh,
    Duplicate,
}

/// Schema-check an event's payload at the append boundary.
///
/// The payload is re-serialized and run through the per-type schema in
/// `acp-core`, so a value that drifted from the wire contract (however it
/// was constructed) never reaches storage or subscribers.
fn check_payload(event: &Event) -> Result<(), AppendError> {
    let value = serde_json::to_value(&event.payload).map_err(|e| AppendError::PayloadInvalid {
        reasons: vec![e.to_string()],
    })?;
    validate_payload(&value).map_err(|e| match e {
        PayloadError::Schema { reasons } => AppendError::PayloadInvalid { reasons },
        PayloadError::Decode(e) => AppendError::PayloadInvalid {
            reasons: vec![e.to_string()],
        },
    })?;
    Ok(())
}

/// Process-wide append-only event store with per-run fan-out.
///
/// Constructed once at startup and shared as an `Arc`; all mutations for a
/// run serialize on that run's lock.
pub struct EventLog {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunLog>>>>,
    buffer: usize,
}

impl EventLog {
    /// Create a log with the default subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Create a log with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            buffer,
        }
    }

    /// Register a run. Idempotent; called by the ledger on run creation.
    pub async fn register_run(&self, run_id: Uuid) {
        let mut runs = self.runs.write().await;
        runs.entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunLog::new(self.buffer))));
    }

    async fn run_log(&self, run_id: Uuid) -> Option<Arc<Mutex<RunLog>>> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// Append one event.
    ///
    /// Atomically asserts `event.seq == last_seq + 1`, schema-validates the
    /// payload, stores the event, and publishes it to live subscribers.
    /// Re-appending a byte-identical event is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// [`AppendError::RunUnknown`], [`AppendError::SeqGap`],
    /// [`AppendError::DuplicateEventId`], [`AppendError::RunFrozen`], or
    /// [`AppendError::PayloadInvalid`].
    pub async fn append(&self, run_id: Uuid, event: Event) -> Result<(), AppendError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(AppendError::RunUnknown(run_id))?;
        let mut log = log.lock().await;
        let expected = (log.last_seq() + 1) as u64;
        match log.check(run_id, &event, expected)? {
            Appended::Duplicate => {
                trace!(target: "acp.eventlog", %run_id, seq = event.seq, "duplicate append ignored");
                Ok(())
            }
            Appended::Fresh => {
                log.commit(event);
                Ok(())
            }
        }
    }

    /// Append a batch atomically.
    ///
    /// Either every event is appended (in order, with consecutive sequence
    /// numbers continuing from the current tail) or none is.
    ///
    /// # Errors
    ///
    /// Same kinds as [`append`](Self::append); validation runs over the whole
    /// batch before anything is committed.
    pub async fn append_batch(&self, run_id: Uuid, events: Vec<Event>) -> Result<(), AppendError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(AppendError::RunUnknown(run_id))?;
        let mut log = log.lock().await;

        let mut expected = (log.last_seq() + 1) as u64;
        let mut fresh = Vec::with_capacity(events.len());
        for event in &events {
            match log.check(run_id, event, expected)? {
                Appended::Duplicate => {}
                Appended::Fresh => {
                    // Duplicate ids inside the batch itself are also rejected.
                    if fresh
                        .iter()
                        .any(|e: &&Event| e.event_id == event.event_id)
                    {
                        return Err(AppendError::DuplicateEventId(event.event_id));
                    }
                    expected += 1;
                    fresh.push(event);
                }
            }
        }

        let fresh: Vec<Event> = fresh.into_iter().cloned().collect();
        for event in fresh {
            log.commit(event);
        }
        Ok(())
    }

    /// Append a closing event and freeze the log in one step.
    ///
    /// Used for the terminal event of a run so no append can slip in
    /// between the last event and the freeze.
    ///
    /// # Errors
    ///
    /// Same kinds as [`append`](Self::append).
    pub async fn append_closing(&self, run_id: Uuid, event: Event) -> Result<(), AppendError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(AppendError::RunUnknown(run_id))?;
        let mut log = log.lock().await;
        let expected = (log.last_seq() + 1) as u64;
        if let Appended::Fresh = log.check(run_id, &event, expected)? {
            log.commit(event);
        }
        log.freeze();
        debug!(target: "acp.eventlog", %run_id, last_seq = log.last_seq(), "event log frozen");
        Ok(())
    }

    /// Append a payload with the next sequence number assigned under the
    /// run's lock, returning the stored event.
    ///
    /// This is the emit path used inside the control plane; the explicit
    /// [`append`](Self::append) exists for callers that replicate events
    /// with pre-assigned sequence numbers. Payloads are schema-validated
    /// before commit, like every other append path.
    ///
    /// # Errors
    ///
    /// [`AppendError::RunUnknown`], [`AppendError::RunFrozen`], or
    /// [`AppendError::PayloadInvalid`].
    pub async fn emit(
        &self,
        run_id: Uuid,
        phase: acp_core::RunState,
        payload: acp_core::EventPayload,
    ) -> Result<Event, AppendError> {
        self.emit_with_severity(run_id, phase, payload, None).await
    }

    /// [`emit`](Self::emit) with an explicit severity instead of the
    /// payload's default (e.g. an `info`-level drift entry for a local
    /// recovery).
    ///
    /// # Errors
    ///
    /// [`AppendError::RunUnknown`], [`AppendError::RunFrozen`], or
    /// [`AppendError::PayloadInvalid`].
    pub async fn emit_with_severity(
        &self,
        run_id: Uuid,
        phase: acp_core::RunState,
        payload: acp_core::EventPayload,
        severity: Option<acp_core::Severity>,
    ) -> Result<Event, AppendError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(AppendError::RunUnknown(run_id))?;
        let mut log = log.lock().await;
        if log.frozen {
            return Err(AppendError::RunFrozen(run_id));
        }
        let seq = (log.last_seq() + 1) as u64;
        let mut event = Event::new(run_id, seq, phase, payload);
        if let Some(severity) = severity {
            event.severity = severity;
        }
        check_payload(&event)?;
        log.commit(event.clone());
        Ok(event)
    }

    /// [`emit`](Self::emit), then freeze, in one step. Used for terminal
    /// events so nothing can slip in after them.
    ///
    /// # Errors
    ///
    /// [`AppendError::RunUnknown`], [`AppendError::RunFrozen`], or
    /// [`AppendError::PayloadInvalid`].
    pub async fn emit_closing(
        &self,
        run_id: Uuid,
        phase: acp_core::RunState,
        payload: acp_core::EventPayload,
    ) -> Result<Event, AppendError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(AppendError::RunUnknown(run_id))?;
        let mut log = log.lock().await;
        if log.frozen {
            return Err(AppendError::RunFrozen(run_id));
        }
        let seq = (log.last_seq() + 1) as u64;
        let event = Event::new(run_id, seq, phase, payload);
        check_payload(&event)?;
        log.commit(event.clone());
        log.freeze();
        debug!(target: "acp.eventlog", %run_id, last_seq = log.last_seq(), "event log frozen");
        Ok(event)
    }

    /// Freeze a run's log without appending (e.g. preflight rejections).
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn freeze(&self, run_id: Uuid) -> Result<(), QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        log.lock().await.freeze();
        Ok(())
    }

    /// Returns `true` once the run's log no longer accepts appends.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn is_frozen(&self, run_id: Uuid) -> Result<bool, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        Ok(log.frozen)
    }

    /// Sequence number of the last appended event, `-1` before any.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn last_seq(&self, run_id: Uuid) -> Result<i64, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        Ok(log.last_seq())
    }

    /// List events ascending, starting after `after_seq`, up to `limit`.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn list(
        &self,
        run_id: Uuid,
        after_seq: Option<i64>,
        limit: usize,
        type_filter: Option<&[EventType]>,
    ) -> Result<Vec<Event>, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        let after = after_seq.unwrap_or(-1);
        let out = log
            .events
            .iter()
            .filter(|e| (e.seq as i64) > after)
            .filter(|e| type_filter.is_none_or(|ts| ts.contains(&e.event_type())))
            .take(limit)
            .cloned()
            .collect();
        Ok(out)
    }

    /// Most recent events, descending, for previews.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn latest(&self, run_id: Uuid, limit: usize) -> Result<Vec<Event>, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        let out = log.events.iter().rev().take(limit).cloned().collect();
        Ok(out)
    }

    /// Aggregate event counts per type.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn count_by_type(&self, run_id: Uuid) -> Result<BTreeMap<EventType, u64>, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        let mut counts = BTreeMap::new();
        for e in &log.events {
            *counts.entry(e.event_type()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Bus statistics for one run.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn stats(&self, run_id: Uuid) -> Result<BusStats, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;
        Ok(BusStats {
            total_published: log.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: log.tx.as_ref().map_or(0, broadcast::Sender::receiver_count),
            dropped_events: log.stats.dropped_events.load(Ordering::Relaxed),
        })
    }

    /// Open a replay-then-tail subscription.
    ///
    /// Events with `seq > after_seq` are replayed from storage, then the
    /// subscription attaches to the live tail with no gap and no duplicates.
    /// The subscription finishes when the log freezes and yields a
    /// [`SubscriptionError::Lagged`] if the subscriber falls more than the
    /// buffer behind.
    ///
    /// # Errors
    ///
    /// [`QueryError::RunUnknown`] if the run was never registered.
    pub async fn subscribe(
        &self,
        run_id: Uuid,
        options: SubscribeOptions,
    ) -> Result<Subscription, QueryError> {
        let log = self
            .run_log(run_id)
            .await
            .ok_or(QueryError::RunUnknown(run_id))?;
        let log = log.lock().await;

        let after = options.after_seq.unwrap_or(-1);
        let replay: Vec<Event> = log
            .events
            .iter()
            .filter(|e| (e.seq as i64) > after)
            .cloned()
            .collect();
        // Subscribing under the same lock appends hold guarantees that every
        // event is either in the replay or delivered by the receiver. The
        // boundary also honours a cursor past the current tail.
        let rx = log.tx.as_ref().map(broadcast::Sender::subscribe);
        let boundary = log.last_seq().max(after);

        Ok(Subscription::new(
            replay,
            rx,
            boundary,
            options.types,
            Arc::clone(&log.stats),
        ))
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::{EventPayload, RunState};

    fn ev(run_id: Uuid, seq: u64) -> Event {
        Event::new(
            run_id,
            seq,
            RunState::Executing,
            EventPayload::FileChanged {
                path: format!("file-{seq}.txt"),
                summary: "touched".into(),
            },
        )
    }

    #[tokio::test]
    async fn append_requires_registration() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        let err = log.append(run_id, ev(run_id, 0)).await.unwrap_err();
        assert_eq!(err, AppendError::RunUnknown(run_id));
    }

    #[tokio::test]
    async fn sequential_appends_succeed() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        for seq in 0..5 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }
        assert_eq!(log.last_seq(run_id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn seq_gap_is_rejected() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        log.append(run_id, ev(run_id, 0)).await.unwrap();
        let err = log.append(run_id, ev(run_id, 2)).await.unwrap_err();
        assert_eq!(err, AppendError::SeqGap { expected: 1, got: 2 });
        // Nothing was appended.
        assert_eq!(log.last_seq(run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn identical_duplicate_is_noop() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        let event = ev(run_id, 0);
        log.append(run_id, event.clone()).await.unwrap();
        log.append(run_id, event).await.unwrap();
        assert_eq!(log.last_seq(run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conflicting_duplicate_is_rejected() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        let event = ev(run_id, 0);
        log.append(run_id, event.clone()).await.unwrap();

        let mut conflicting = ev(run_id, 1);
        conflicting.event_id = event.event_id;
        let err = log.append(run_id, conflicting).await.unwrap_err();
        assert_eq!(err, AppendError::DuplicateEventId(event.event_id));
    }

    #[tokio::test]
    async fn closing_append_freezes() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        log.append(run_id, ev(run_id, 0)).await.unwrap();
        let closing = Event::new(
            run_id,
            1,
            RunState::Completed,
            EventPayload::RunCompleted { artifact_count: 0 },
        );
        log.append_closing(run_id, closing).await.unwrap();

        let err = log.append(run_id, ev(run_id, 2)).await.unwrap_err();
        assert_eq!(err, AppendError::RunFrozen(run_id));
        assert!(log.is_frozen(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        // Second event has a gap: the whole batch must be rejected.
        let batch = vec![ev(run_id, 0), ev(run_id, 2)];
        let err = log.append_batch(run_id, batch).await.unwrap_err();
        assert_eq!(err, AppendError::SeqGap { expected: 1, got: 2 });
        assert_eq!(log.last_seq(run_id).await.unwrap(), -1);

        log.append_batch(run_id, vec![ev(run_id, 0), ev(run_id, 1)])
            .await
            .unwrap();
        assert_eq!(log.last_seq(run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        for seq in 0..10 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }

        let page = log.list(run_id, Some(3), 4, None).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);

        let none = log
            .list(run_id, None, 100, Some(&[EventType::ToolCalled]))
            .await
            .unwrap();
        assert!(none.is_empty());

        let all = log
            .list(run_id, None, 100, Some(&[EventType::FileChanged]))
            .await
            .unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn latest_is_descending() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        for seq in 0..5 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }
        let latest = log.latest(run_id, 3).await.unwrap();
        let seqs: Vec<u64> = latest.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn every_payload_kind_passes_the_append_boundary() {
        use acp_core::{
            ArtifactRef, EventPayload, RejectionReason, ResolutionSource, RunErrorInfo,
            RunErrorKind, TimeoutAction,
        };

        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        // One of each payload type flows through the schema gate on the
        // emit path; a conforming payload is never rejected.
        let payloads = vec![
            EventPayload::RunStarted { goal: "g".into() },
            EventPayload::PhaseChanged {
                from: RunState::Initializing,
                to: RunState::Planning,
            },
            EventPayload::ToolCalled {
                tool: "write".into(),
                tool_use_id: None,
                args: serde_json::json!({"path": "out.md"}),
            },
            EventPayload::ToolResult {
                tool: "write".into(),
                tool_use_id: None,
                output: serde_json::json!({"ok": true}),
                is_error: false,
            },
            EventPayload::FileChanged {
                path: "out.md".into(),
                summary: "created".into(),
            },
            EventPayload::ArtifactCreated {
                artifact: ArtifactRef {
                    id: "D1".into(),
                    kind: "markdown".into(),
                    path: "/work/out.md".into(),
                },
            },
            EventPayload::CheckpointRequested {
                checkpoint_id: "cp1".into(),
                action_type: "send_email".into(),
                preview: serde_json::json!({}),
            },
            EventPayload::CheckpointApproved {
                checkpoint_id: "cp1".into(),
                resolved_by: "u1".into(),
                source: ResolutionSource::Web,
            },
            EventPayload::CheckpointRejected {
                checkpoint_id: "cp1".into(),
                reason: RejectionReason::NeedsEdit,
                resolved_by: None,
                source: ResolutionSource::Api,
            },
            EventPayload::CheckpointTimeout {
                checkpoint_id: "cp1".into(),
                action_taken: TimeoutAction::Reject,
            },
            EventPayload::DriftDetected {
                rule: "tool_policy".into(),
                reason: "blocked".into(),
                tool: Some("delete".into()),
                fallback: None,
            },
            EventPayload::RunFailed {
                error: RunErrorInfo::new(RunErrorKind::AgentError, "x", false),
            },
            EventPayload::RunCompleted { artifact_count: 1 },
        ];

        let total = payloads.len() as i64;
        for payload in payloads {
            log.emit(run_id, RunState::Executing, payload).await.unwrap();
        }
        assert_eq!(log.last_seq(run_id).await.unwrap(), total - 1);
    }

    #[tokio::test]
    async fn count_by_type_aggregates() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        log.append(run_id, ev(run_id, 0)).await.unwrap();
        log.append(run_id, ev(run_id, 1)).await.unwrap();
        let counts = log.count_by_type(run_id).await.unwrap();
        assert_eq!(counts.get(&EventType::FileChanged), Some(&2));
    }
}
