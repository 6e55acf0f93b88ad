//! Fuzz target for `InputQueue`.
//!
//! # Properties
//! - A served input is never for a frame later than the one asked for
//! - Consuming never grows the queue

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use lockstep_netplay::{ConsumeOutcome, Frame, InputFrame, InputQueue, LocalInput};

#[derive(Debug, Arbitrary)]
enum QueueOp {
    Push { frame: u16, key_mask: u16 },
    Prefill { start: u16, lag_depth: u8 },
    Consume { frame: u16 },
    Clear,
}

fuzz_target!(|ops: Vec<QueueOp>| {
    let mut queue = InputQueue::new();
    for op in ops.into_iter().take(1000) {
        match op {
            QueueOp::Push { frame, key_mask } => queue.push(InputFrame::new(
                Frame::new(i32::from(frame)),
                LocalInput {
                    key_mask: u32::from(key_mask),
                    touch: None,
                },
            )),
            QueueOp::Prefill { start, lag_depth } => {
                queue.prefill_from(Frame::new(i32::from(start)), usize::from(lag_depth % 16));
            },
            QueueOp::Consume { frame } => {
                let current = Frame::new(i32::from(frame));
                let before = queue.len();
                match queue.consume(current) {
                    ConsumeOutcome::Starved => assert_eq!(before, 0),
                    ConsumeOutcome::Pending { next, .. } => assert!(next > current),
                    ConsumeOutcome::Ready { input, .. } => assert!(input.frame <= current),
                }
                assert!(queue.len() <= before);
            },
            QueueOp::Clear => {
                queue.clear();
                assert!(queue.is_empty());
            },
        }
    }
});
