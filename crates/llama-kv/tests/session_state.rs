//! Integration tests for llama-kv.
//!
//! Validates:
//! - Multi-turn bookkeeping (prompt, generated tokens, next prompt)
//! - Failure paths leave history and cache position equal
//! - Property: cache position never exceeds history length and advances by
//!   exactly the decoded count, over randomized turn sequences

use llama_kv::*;
use proptest::prelude::*;

#[test]
fn two_turn_conversation() {
    let mut state = SessionState::new(64);

    // turn 0: prompt, then three generated tokens decoded one at a time
    state.stage(&[1, 10, 11, 12]).unwrap();
    state.commit();
    for tok in [20, 21, 22] {
        let pos = state.stage(&[tok]).unwrap();
        assert_eq!(pos, state.len() - 1);
        state.commit();
    }
    assert_eq!(state.cache_position(), 7);

    // turn 1 starts where turn 0 left off
    assert_eq!(state.stage(&[30, 31]).unwrap(), 7);
    state.commit();
    assert_eq!(state.len(), state.cache_position());
    assert_eq!(state.tokens(), &[1, 10, 11, 12, 20, 21, 22, 30, 31]);
}

#[test]
fn failed_prompt_decode_rolls_back() {
    let mut state = SessionState::new(64);
    state.stage(&[1, 2, 3]).unwrap();
    state.commit();

    state.stage(&[4, 5]).unwrap();
    // decode failed
    state.rollback();
    assert_eq!(state.len(), 3);
    assert_eq!(state.cache_position(), 3);

    // retry lands at the same position
    assert_eq!(state.stage(&[4, 5]).unwrap(), 3);
}

#[test]
fn remaining_tracks_window() {
    let mut state = SessionState::new(5);
    state.stage(&[1, 2, 3]).unwrap();
    assert_eq!(state.remaining(), 2);
    state.commit();
    state.stage(&[4, 5]).unwrap();
    state.commit();
    assert_eq!(state.remaining(), 0);
    assert!(matches!(
        state.stage(&[6]),
        Err(KvError::CapacityExceeded { .. })
    ));
}

#[derive(Debug, Clone)]
enum Op {
    /// Stage `n` tokens, then commit (decode ok) or roll back (decode failed).
    Turn { n: usize, decoded: bool },
    /// Generate `n` tokens one by one.
    Generate { n: usize },
    Reset,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1usize..40, any::<bool>()).prop_map(|(n, decoded)| Op::Turn { n, decoded }),
        3 => (0usize..20).prop_map(|n| Op::Generate { n }),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn cache_position_invariant(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut state = SessionState::new(256);
        for op in ops {
            match op {
                Op::Turn { n, decoded } => {
                    let before = state.cache_position();
                    let tokens: Vec<i32> = (0..n as i32).collect();
                    match state.stage(&tokens) {
                        Ok(start) => {
                            prop_assert_eq!(start, before);
                            if decoded {
                                prop_assert_eq!(state.commit(), n);
                                prop_assert_eq!(state.cache_position(), before + n);
                            } else {
                                prop_assert_eq!(state.rollback(), n);
                                prop_assert_eq!(state.cache_position(), before);
                            }
                        }
                        Err(KvError::CapacityExceeded { .. }) => {
                            prop_assert_eq!(state.cache_position(), before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                Op::Generate { n } => {
                    for i in 0..n {
                        let before = state.cache_position();
                        if state.stage(&[i as i32]).is_err() {
                            break;
                        }
                        prop_assert_eq!(state.commit(), 1);
                        prop_assert_eq!(state.cache_position(), before + 1);
                    }
                }
                Op::Reset => state.reset(),
            }
            prop_assert!(state.cache_position() <= state.len());
            prop_assert!(state.len() <= state.capacity());
            prop_assert_eq!(state.pending(), 0);
        }
    }
}
