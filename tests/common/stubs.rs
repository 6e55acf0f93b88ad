//! Simulation stubs for integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use lockstep_netplay::{Frame, Simulation, Touch};

/// One applied input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Applied {
    pub frame: Frame,
    pub key_mask: u32,
    pub touch: Option<Touch>,
}

/// A simulation whose instances only count frames and remember what was applied.
///
/// The state of instance 0 is its frame number, so a snapshot is four bytes.
#[derive(Debug, Clone)]
pub struct SimStub {
    pub frames: Vec<i32>,
    pub applied: Vec<Vec<Applied>>,
    pub cart: Option<Vec<u8>>,
    pub save: Option<Vec<u8>>,
    pub console_type: Option<u8>,
    pub resets: usize,
    /// `load_cartridge` fails while set.
    pub refuse_cart: bool,
}

impl SimStub {
    #[must_use]
    pub fn new(instances: usize) -> Self {
        Self {
            frames: vec![0; instances],
            applied: vec![Vec::new(); instances],
            cart: None,
            save: None,
            console_type: None,
            resets: 0,
            refuse_cart: false,
        }
    }

    /// Starts instance 0 at `frame`.
    #[must_use]
    pub fn at_frame(mut self, frame: i32) -> Self {
        self.frames[0] = frame;
        self
    }

    pub fn frame(&self, instance: usize) -> i32 {
        self.frames[instance]
    }

    /// Key masks applied to `instance`, in order.
    pub fn key_masks(&self, instance: usize) -> Vec<u32> {
        self.applied[instance].iter().map(|a| a.key_mask).collect()
    }
}

impl Simulation for SimStub {
    fn current_frame(&self, instance: usize) -> Frame {
        Frame::new(self.frames[instance])
    }

    fn apply_input(&mut self, instance: usize, key_mask: u32, touch: Option<Touch>) {
        let frame = Frame::new(self.frames[instance]);
        self.applied[instance].push(Applied {
            frame,
            key_mask,
            touch,
        });
        self.frames[instance] += 1;
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.frames[0] = 0;
        self.cart = None;
        self.save = None;
    }

    fn load_cartridge(&mut self, image: &[u8], save: Option<&[u8]>) -> bool {
        if self.refuse_cart {
            return false;
        }
        self.cart = Some(image.to_vec());
        self.save = save.map(<[u8]>::to_vec);
        true
    }

    fn serialize_state(&self) -> Vec<u8> {
        self.frames[0].to_le_bytes().to_vec()
    }

    fn deserialize_state(&mut self, state: &[u8]) -> bool {
        match <[u8; 4]>::try_from(state) {
            Ok(bytes) => {
                self.frames[0] = i32::from_le_bytes(bytes);
                true
            },
            Err(_) => false,
        }
    }

    fn set_console_type(&mut self, console_type: u8) {
        self.console_type = Some(console_type);
    }
}
