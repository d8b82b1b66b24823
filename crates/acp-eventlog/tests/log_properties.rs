// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for sequence integrity and cursor resume.

use acp_core::{Event, EventPayload, RunState};
use acp_eventlog::{AppendError, EventLog, SubscribeOptions};
use proptest::prelude::*;
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

proptest! {
    // Appended seqs are exactly 0, 1, 2, and so on; anything else is a
    // gap error that leaves the log untouched.
    #[test]
    fn seq_monotonicity(count in 1usize..50, bogus_offset in 2u64..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let log = EventLog::new();
            let run_id = Uuid::new_v4();
            log.register_run(run_id).await;

            for seq in 0..count as u64 {
                log.append(run_id, ev(run_id, seq)).await.unwrap();
            }
            prop_assert_eq!(log.last_seq(run_id).await.unwrap(), count as i64 - 1);

            // A non-consecutive seq is always rejected.
            let bogus = count as u64 + bogus_offset;
            let err = log.append(run_id, ev(run_id, bogus)).await.unwrap_err();
            prop_assert_eq!(err, AppendError::SeqGap { expected: count as u64, got: bogus });

            let stored = log.list(run_id, None, usize::MAX, None).await.unwrap();
            let seqs: Vec<u64> = stored.iter().map(|e| e.seq).collect();
            let expected: Vec<u64> = (0..count as u64).collect();
            prop_assert_eq!(seqs, expected);
            Ok(())
        })?;
    }

    // Replay + live tail equals the full ordered event list past the cursor.
    #[test]
    fn cursor_resume_equivalence(
        before in 1usize..30,
        after in 1usize..30,
        cursor in -1i64..25,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let log = EventLog::with_buffer(256);
            let run_id = Uuid::new_v4();
            log.register_run(run_id).await;

            for seq in 0..before as u64 {
                log.append(run_id, ev(run_id, seq)).await.unwrap();
            }

            let cursor = cursor.min(before as i64 - 1);
            let mut sub = log
                .subscribe(run_id, SubscribeOptions { after_seq: Some(cursor), types: None })
                .await
                .unwrap();

            let total = (before + after) as u64;
            for seq in before as u64..total {
                log.append(run_id, ev(run_id, seq)).await.unwrap();
            }
            log.append_closing(run_id, closing(run_id, total)).await.unwrap();

            let mut received = Vec::new();
            while let Some(item) = sub.recv().await {
                received.push(item.unwrap().seq);
            }
            let expected: Vec<u64> = ((cursor + 1) as u64..=total).collect();
            prop_assert_eq!(received, expected);
            Ok(())
        })?;
    }

    // Once a closing event lands, every later append fails.
    #[test]
    fn no_post_terminal_appends(count in 1usize..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let log = EventLog::new();
            let run_id = Uuid::new_v4();
            log.register_run(run_id).await;

            for seq in 0..count as u64 {
                log.append(run_id, ev(run_id, seq)).await.unwrap();
            }
            log.append_closing(run_id, closing(run_id, count as u64)).await.unwrap();

            let err = log.append(run_id, ev(run_id, count as u64 + 1)).await.unwrap_err();
            prop_assert_eq!(err, AppendError::RunFrozen(run_id));
            prop_assert_eq!(log.last_seq(run_id).await.unwrap(), count as i64);
            Ok(())
        })?;
    }
}
