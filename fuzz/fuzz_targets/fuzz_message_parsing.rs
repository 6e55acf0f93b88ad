//! Fuzz target for wire message decoding.
//!
//! Every channel's decoder is handed the same arbitrary bytes. Malformed data
//! must come back as an error, and anything that decodes must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;

use lockstep_netplay::{BlobMessage, ControlMessage, InputMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = ControlMessage::decode(data) {
        let _ = message.encode();
    }
    if let Ok(message) = InputMessage::decode(data) {
        let _ = message.encode();
    }
    if let Ok(message) = BlobMessage::decode(data) {
        let _ = message.encode();
    }
});
