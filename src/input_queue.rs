//! Per-player lockstep input queues.
//!
//! Each player's inputs are produced `lag_depth` frames ahead of the frame they
//! apply to. A queue holds them in arrival order and hands out exactly one per
//! simulation frame:
//!
//! - empty queue: starved, the simulation must not guess
//! - head older than the current frame: stale entries are discarded, keeping at least one
//! - head newer than the current frame: nothing yet, wait
//! - otherwise: pop and apply

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{Frame, NEUTRAL_KEY_MASK};

/// A touch-screen position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Touch {
    /// Horizontal position.
    pub x: u16,
    /// Vertical position.
    pub y: u16,
}

/// Input sampled from the local player for one tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LocalInput {
    /// Button state, active-low.
    pub key_mask: u32,
    /// Touch position, if the screen is pressed.
    pub touch: Option<Touch>,
}

impl Default for LocalInput {
    fn default() -> Self {
        Self {
            key_mask: NEUTRAL_KEY_MASK,
            touch: None,
        }
    }
}

/// One frame of one player's input, as it travels on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFrame {
    /// Frame this input applies to.
    pub frame: Frame,
    /// Button state, active-low.
    pub key_mask: u32,
    /// The touch screen is pressed.
    pub touch_active: bool,
    /// Touch x, meaningful when `touch_active`.
    pub touch_x: u16,
    /// Touch y, meaningful when `touch_active`.
    pub touch_y: u16,
}

impl InputFrame {
    /// Tags a sampled input with the frame it applies to.
    #[must_use]
    pub fn new(frame: Frame, input: LocalInput) -> Self {
        let touch = input.touch.unwrap_or_default();
        Self {
            frame,
            key_mask: input.key_mask,
            touch_active: input.touch.is_some(),
            touch_x: touch.x,
            touch_y: touch.y,
        }
    }

    /// All buttons released, no touch.
    #[must_use]
    pub fn neutral(frame: Frame) -> Self {
        Self::new(frame, LocalInput::default())
    }

    /// The touch position, if the screen is pressed.
    #[must_use]
    pub const fn touch(&self) -> Option<Touch> {
        if self.touch_active {
            Some(Touch {
                x: self.touch_x,
                y: self.touch_y,
            })
        } else {
            None
        }
    }
}

/// Result of asking a queue for the current frame's input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing queued at all.
    Starved,
    /// The next queued input is for a later frame.
    Pending {
        /// Frame of the queue head.
        next: Frame,
        /// Stale entries discarded on the way.
        dropped: usize,
    },
    /// An input was popped.
    Ready {
        /// The input to apply.
        input: InputFrame,
        /// Stale entries discarded before it.
        dropped: usize,
    },
}

/// FIFO of one player's inputs.
#[derive(Debug, Clone, Default)]
pub struct InputQueue {
    frames: VecDeque<InputFrame>,
    last_consumed: Option<Frame>,
}

impl InputQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an input. No deduplication.
    pub fn push(&mut self, input: InputFrame) {
        self.frames.push_back(input);
    }

    /// Puts neutral inputs for frames `0..lag_depth` ahead of whatever is queued.
    pub fn prefill(&mut self, lag_depth: usize) {
        self.prefill_from(Frame::ZERO, lag_depth);
    }

    /// Puts neutral inputs for frames `start..start + lag_depth` ahead of whatever is queued.
    pub fn prefill_from(&mut self, start: Frame, lag_depth: usize) {
        for offset in (0..lag_depth).rev() {
            self.frames
                .push_front(InputFrame::neutral(start.delayed_by(offset)));
        }
    }

    /// Serves the input for `current`.
    pub fn consume(&mut self, current: Frame) -> ConsumeOutcome {
        let mut dropped = 0;
        while self.frames.len() > 1 && self.frames.front().is_some_and(|f| f.frame < current) {
            self.frames.pop_front();
            dropped += 1;
        }

        let Some(head) = self.frames.front().copied() else {
            return ConsumeOutcome::Starved;
        };
        if head.frame > current {
            return ConsumeOutcome::Pending {
                next: head.frame,
                dropped,
            };
        }

        self.frames.pop_front();
        self.last_consumed = Some(head.frame);
        ConsumeOutcome::Ready {
            input: head,
            dropped,
        }
    }

    /// Frame of the last input handed out.
    #[must_use]
    pub const fn last_consumed(&self) -> Option<Frame> {
        self.last_consumed
    }

    /// The queue head.
    #[must_use]
    pub fn front(&self) -> Option<&InputFrame> {
        self.frames.front()
    }

    /// Number of queued inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.last_consumed = None;
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(frame: i32, key_mask: u32) -> InputFrame {
        InputFrame {
            frame: Frame::new(frame),
            key_mask,
            touch_active: false,
            touch_x: 0,
            touch_y: 0,
        }
    }

    #[test]
    fn empty_queue_is_starved() {
        let mut queue = InputQueue::new();
        assert_eq!(queue.consume(Frame::ZERO), ConsumeOutcome::Starved);
    }

    #[test]
    fn prefill_serves_the_first_lag_frames() {
        let mut queue = InputQueue::new();
        queue.prefill(4);
        for frame in 0..4 {
            match queue.consume(Frame::new(frame)) {
                ConsumeOutcome::Ready { input, dropped } => {
                    assert_eq!(input.frame, Frame::new(frame));
                    assert_eq!(input.key_mask, NEUTRAL_KEY_MASK);
                    assert_eq!(dropped, 0);
                },
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn prefill_goes_ahead_of_early_arrivals() {
        let mut queue = InputQueue::new();
        queue.push(input(4, 0x123));
        queue.prefill(4);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.front().unwrap().frame, Frame::ZERO);
    }

    #[test]
    fn prefill_from_starts_at_the_given_frame() {
        let mut queue = InputQueue::new();
        queue.prefill_from(Frame::new(120), 3);
        let frames: Vec<_> = queue.frames.iter().map(|f| f.frame.as_i32()).collect();
        assert_eq!(frames, vec![120, 121, 122]);
    }

    #[test]
    fn future_head_means_wait() {
        let mut queue = InputQueue::new();
        queue.push(input(6, 0));
        assert_eq!(
            queue.consume(Frame::new(5)),
            ConsumeOutcome::Pending {
                next: Frame::new(6),
                dropped: 0
            }
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stale_entries_are_dropped_but_one_is_kept() {
        let mut queue = InputQueue::new();
        for frame in 0..5 {
            queue.push(input(frame, frame as u32));
        }
        match queue.consume(Frame::new(10)) {
            ConsumeOutcome::Ready { input, dropped } => {
                assert_eq!(dropped, 4);
                assert_eq!(input.frame, Frame::new(4));
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn catching_up_lands_on_the_matching_frame() {
        let mut queue = InputQueue::new();
        for frame in 3..9 {
            queue.push(input(frame, 0));
        }
        match queue.consume(Frame::new(6)) {
            ConsumeOutcome::Ready { input, dropped } => {
                assert_eq!(dropped, 3);
                assert_eq!(input.frame, Frame::new(6));
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.last_consumed(), Some(Frame::new(6)));
    }

    #[test]
    fn touch_round_trips_through_input_frame() {
        let sampled = LocalInput {
            key_mask: 0xFFE,
            touch: Some(Touch { x: 128, y: 96 }),
        };
        let frame = InputFrame::new(Frame::new(3), sampled);
        assert!(frame.touch_active);
        assert_eq!(frame.touch(), Some(Touch { x: 128, y: 96 }));
        assert_eq!(InputFrame::neutral(Frame::ZERO).touch(), None);
    }

    proptest! {
        #[test]
        fn consumed_frames_never_go_backwards(
            gaps in proptest::collection::vec(0_i32..3, 1..64),
            advances in proptest::collection::vec(0_i32..3, 1..64),
        ) {
            let mut queue = InputQueue::new();
            let mut frame = 0;
            for gap in gaps {
                frame += gap;
                queue.push(input(frame, 0));
            }

            let mut current = 0;
            let mut last: Option<Frame> = None;
            for advance in advances {
                if let ConsumeOutcome::Ready { input, .. } = queue.consume(Frame::new(current)) {
                    if let Some(previous) = last {
                        prop_assert!(input.frame >= previous);
                    }
                    last = Some(input.frame);
                }
                current += advance;
            }
        }
    }
}
