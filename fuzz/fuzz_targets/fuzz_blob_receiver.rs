//! Fuzz target for `BlobReceiver`.
//!
//! Arbitrary byte strings are decoded as blob-channel frames and fed to one
//! receiver. Rejections are fine; panics and overgrown buffers are not.

#![no_main]

use libfuzzer_sys::fuzz_target;

use lockstep_netplay::{BlobMessage, BlobReceiver, ReplicationConfig};

fuzz_target!(|frames: Vec<Vec<u8>>| {
    let config = ReplicationConfig {
        max_blob_length: 4096,
        ..ReplicationConfig::default()
    };
    let mut receiver = BlobReceiver::new(&config);
    for bytes in frames.iter().take(256) {
        let _ = match BlobMessage::decode(bytes) {
            Ok(BlobMessage::Begin(header)) => receiver.begin(header),
            Ok(BlobMessage::Chunk(chunk)) => receiver.chunk(&chunk),
            Ok(BlobMessage::End(header)) => receiver.end(header),
            _ => continue,
        };
        if let Some(partial) = receiver.partial() {
            assert!(partial.len() <= config.max_blob_length as usize);
        }
    }
});
