// SPDX-License-Identifier: MIT OR Apache-2.0
//! Replay-then-tail subscriptions.
//!
//! A subscription first drains the stored events past the caller's cursor,
//! then switches to the live broadcast receiver, skipping anything already
//! covered by the replay. The concatenation of both halves is exactly the
//! run's ordered event list past the cursor.

use crate::StatsInner;
use acp_core::{Event, EventType};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tracing::warn;

/// Options for [`EventLog::subscribe`](crate::EventLog::subscribe).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay starts after this sequence number. `None` replays everything.
    pub after_seq: Option<i64>,
    /// Only yield these event types. `None` yields everything.
    pub types: Option<Vec<EventType>>,
}

/// Errors yielded by [`Subscription::recv`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscriber fell more than the buffer behind and was closed.
    /// Retryable: reconnect with `after_seq` set to the last seq received.
    #[error("subscription lagged behind the event stream")]
    Lagged,
}

/// A cancellable, finite-on-terminal event subscription.
///
/// Dropping the subscription detaches it from the bus.
pub struct Subscription {
    replay: VecDeque<Event>,
    rx: Option<broadcast::Receiver<Event>>,
    /// Highest seq covered by the replay snapshot; tail events at or below
    /// this are duplicates and skipped.
    boundary: i64,
    types: Option<Vec<EventType>>,
    stats: Arc<StatsInner>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        replay: Vec<Event>,
        rx: Option<broadcast::Receiver<Event>>,
        boundary: i64,
        types: Option<Vec<EventType>>,
        stats: Arc<StatsInner>,
    ) -> Self {
        Self {
            replay: replay.into(),
            rx,
            boundary,
            types,
            stats,
            finished: false,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        self.types
            .as_ref()
            .is_none_or(|ts| ts.contains(&event.event_type()))
    }

    /// Receive the next event in sequence order.
    ///
    /// Returns `None` once the run's log is frozen and fully delivered, or
    /// `Some(Err(Lagged))` exactly once if the subscriber overflowed its
    /// buffer, after which the subscription is closed.
    pub async fn recv(&mut self) -> Option<Result<Event, SubscriptionError>> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(event) = self.replay.pop_front() {
                if self.matches(&event) {
                    return Some(Ok(event));
                }
                continue;
            }

            // Replay exhausted. A frozen-at-snapshot log has no receiver.
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    if (event.seq as i64) <= self.boundary {
                        continue;
                    }
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.stats.dropped_events.fetch_add(missed, Ordering::Relaxed);
                    warn!(target: "acp.eventlog", missed, "closing lagged subscription");
                    self.finished = true;
                    return Some(Err(SubscriptionError::Lagged));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{EventLog, SubscribeOptions, SubscriptionError};
    use acp_core::{Event, EventPayload, EventType, RunState};
    use uuid::Uuid;

    fn ev(run_id: Uuid, seq: u64) -> Event {
        Event::new(
            run_id,
            seq,
            RunState::Executing,
            EventPayload::FileChanged {
                path: format!("f{seq}"),
                summary: "s".into(),
            },
        )
    }

    fn closing(run_id: Uuid, seq: u64) -> Event {
        Event::new(
            run_id,
            seq,
            RunState::Completed,
            EventPayload::RunCompleted { artifact_count: 0 },
        )
    }

    #[tokio::test]
    async fn replay_then_tail_covers_everything_once() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        for seq in 0..3 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }

        let mut sub = log
            .subscribe(run_id, SubscribeOptions::default())
            .await
            .unwrap();

        for seq in 3..6 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }
        log.append_closing(run_id, closing(run_id, 6)).await.unwrap();

        let mut seqs = Vec::new();
        while let Some(item) = sub.recv().await {
            seqs.push(item.unwrap().seq);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn cursor_resume_skips_delivered_events() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        for seq in 0..11 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }

        let mut sub = log
            .subscribe(
                run_id,
                SubscribeOptions {
                    after_seq: Some(10),
                    types: None,
                },
            )
            .await
            .unwrap();

        log.append(run_id, ev(run_id, 11)).await.unwrap();
        log.append_closing(run_id, closing(run_id, 12)).await.unwrap();

        let mut seqs = Vec::new();
        while let Some(item) = sub.recv().await {
            seqs.push(item.unwrap().seq);
        }
        assert_eq!(seqs, vec![11, 12]);
    }

    #[tokio::test]
    async fn type_filter_applies_to_both_halves() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        log.append(run_id, ev(run_id, 0)).await.unwrap();

        let mut sub = log
            .subscribe(
                run_id,
                SubscribeOptions {
                    after_seq: None,
                    types: Some(vec![EventType::RunCompleted]),
                },
            )
            .await
            .unwrap();

        log.append(run_id, ev(run_id, 1)).await.unwrap();
        log.append_closing(run_id, closing(run_id, 2)).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.event_type(), EventType::RunCompleted);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn frozen_log_yields_finite_subscription() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        log.append(run_id, ev(run_id, 0)).await.unwrap();
        log.append_closing(run_id, closing(run_id, 1)).await.unwrap();

        let mut sub = log
            .subscribe(run_id, SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().unwrap().seq, 0);
        assert_eq!(sub.recv().await.unwrap().unwrap().seq, 1);
        assert!(sub.recv().await.is_none());
        // Finished subscriptions stay finished.
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_closed_with_lagged() {
        let log = EventLog::with_buffer(4);
        let run_id = Uuid::new_v4();
        log.register_run(run_id).await;

        let mut sub = log
            .subscribe(run_id, SubscribeOptions::default())
            .await
            .unwrap();

        // Overflow the 4-slot buffer without draining.
        for seq in 0..32 {
            log.append(run_id, ev(run_id, seq)).await.unwrap();
        }

        let item = sub.recv().await.unwrap();
        assert_eq!(item.unwrap_err(), SubscriptionError::Lagged);
        assert!(sub.recv().await.is_none());

        let stats = log.stats(run_id).await.unwrap();
        assert!(stats.dropped_events > 0);
    }
}
