//! Loom tests for the claim protocols shared between threads.
//!
//! These check that a task or a buffer slot has exactly one owner no matter
//! how the claiming threads interleave.

use std::sync::Arc;

use remset::dirty_card_queue::BufferSlot;
use remset::{CardBuffer, CardIdx, SequentialSubTasksDone, SubTasksDone};

/// Two threads racing for the same task: exactly one wins.
#[test]
#[ignore = "loom test - run with cargo test loom_claims --release -- --ignored"]
fn test_sub_task_single_winner() {
    loom::model(|| {
        let tasks = Arc::new(SubTasksDone::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let tasks = Arc::clone(&tasks);
                loom::thread::spawn(move || !tasks.is_task_claimed(1))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "task must have exactly one owner");
    });
}

/// Sequential claims never hand out an index twice.
#[test]
#[ignore = "loom test - run with cargo test loom_claims --release -- --ignored"]
fn test_sequential_claims_unique() {
    loom::model(|| {
        let tasks = Arc::new(SequentialSubTasksDone::new(3, 2));

        let claimer = {
            let tasks = Arc::clone(&tasks);
            loom::thread::spawn(move || tasks.try_claim_task())
        };
        let mine = tasks.try_claim_task();
        let theirs = claimer.join().unwrap();

        let (Some(a), Some(b)) = (mine, theirs) else {
            panic!("both threads must get a task");
        };
        assert_ne!(a, b);
        assert!(a < 3 && b < 3);
    });
}

/// A mutator putting a buffer while the pause takes it: the buffer ends up
/// with exactly one owner and is never lost.
#[test]
#[ignore = "loom test - run with cargo test loom_claims --release -- --ignored"]
fn test_buffer_slot_single_owner() {
    loom::model(|| {
        let slot = Arc::new(BufferSlot::new());

        let mutator = {
            let slot = Arc::clone(&slot);
            loom::thread::spawn(move || {
                let mut buffer = Box::new(CardBuffer::new(4));
                buffer.push(CardIdx(7));
                slot.put(buffer).is_none()
            })
        };
        let taken = slot.take();
        assert!(mutator.join().unwrap(), "slot started empty");

        let total = usize::from(taken.is_some()) + usize::from(slot.take().is_some());
        assert_eq!(total, 1, "buffer must be owned exactly once");
    });
}
