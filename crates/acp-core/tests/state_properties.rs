// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the run state machine.

use acp_core::{ContractBuilder, Run, RunState, apply_transition};
use proptest::prelude::*;

const ALL_STATES: [RunState; 12] = [
    RunState::Pending,
    RunState::Initializing,
    RunState::Planning,
    RunState::Executing,
    RunState::Verifying,
    RunState::Packaging,
    RunState::AwaitingApproval,
    RunState::Paused,
    RunState::Completed,
    RunState::Failed,
    RunState::Cancelled,
    RunState::Timeout,
];

fn arb_state() -> impl Strategy<Value = RunState> {
    (0..ALL_STATES.len()).prop_map(|i| ALL_STATES[i])
}

proptest! {
    // Every state ever observed is the target of a listed transition
    // applied to the prior state, and failed attempts never mutate.
    #[test]
    fn transition_soundness(targets in proptest::collection::vec(arb_state(), 1..40)) {
        let mut run = Run::new("ws-prop", ContractBuilder::new("prop").build());
        let mut prior = run.state;

        for target in targets {
            let before = run.clone();
            match apply_transition(&mut run, target) {
                Ok(record) => {
                    prop_assert!(prior.can_transition_to(target));
                    prop_assert_eq!(record.from, prior);
                    prop_assert_eq!(record.to, target);
                    prop_assert_eq!(run.state, target);
                    prior = target;
                }
                Err(_) => {
                    // Deterministic failure: nothing mutated.
                    prop_assert_eq!(run.state, before.state);
                    prop_assert_eq!(run.previous_state, before.previous_state);
                    prop_assert_eq!(run.started_at, before.started_at);
                    prop_assert_eq!(run.completed_at, before.completed_at);
                }
            }
        }
    }

    // Terminal states never move again, no matter what is requested.
    #[test]
    fn terminal_states_are_sticky(target in arb_state()) {
        let mut run = Run::new("ws-prop", ContractBuilder::new("prop").build());
        apply_transition(&mut run, RunState::Cancelled).unwrap();
        prop_assert!(apply_transition(&mut run, target).is_err());
        prop_assert_eq!(run.state, RunState::Cancelled);
    }

    // The cost identity holds for arbitrary deltas.
    #[test]
    fn total_cents_is_the_sum(compute in 0u64..1_000_000, api in 0u64..1_000_000) {
        let mut run = Run::new("ws-prop", ContractBuilder::new("prop").build());
        run.compute_cents = compute;
        run.api_cents = api;
        prop_assert_eq!(run.total_cents(), compute + api);
    }
}
