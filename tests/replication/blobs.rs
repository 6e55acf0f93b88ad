//! Chunked transfer tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::sync::Arc;

use lockstep_netplay::network::messages::{BlobChunk, BlobHeader};
use lockstep_netplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
use lockstep_netplay::{
    BlobKind, BlobMessage, BlobReceiver, BlobRejection, Channel, MemoryNetwork, NetplayError,
    ReceiveOutcome, ReplicationConfig, ReplicationOrigin, Transport, TransportEvent,
    TransportFactory, CHANNEL_COUNT,
};
use proptest::prelude::*;
use web_time::Duration;

use crate::common::ip;

const ORIGIN_PORT: u16 = 7064;

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(ip(last), ORIGIN_PORT)
}

/// An origin with one raw endpoint connected to it.
fn origin_with_raw_observer(
    network: &MemoryNetwork,
    config: ReplicationConfig,
) -> (ReplicationOrigin, Box<dyn Transport>) {
    let mut origin = ReplicationOrigin::bind(&network.factory(ip(1)), addr(1), config).unwrap();
    let mut raw = network
        .factory(ip(2))
        .create_host(addr(2), 1, CHANNEL_COUNT)
        .unwrap();
    raw.connect(addr(1)).unwrap();
    origin.pump(Duration::ZERO);
    assert_eq!(origin.observer_count(), 1);
    (origin, raw)
}

fn drain_blob_messages(raw: &mut Box<dyn Transport>) -> Vec<BlobMessage> {
    let mut messages = Vec::new();
    while let Some(event) = raw.poll(Duration::ZERO) {
        if let TransportEvent::Received {
            channel, payload, ..
        } = event
        {
            if channel == Channel::BLOB {
                messages.push(BlobMessage::decode(&payload).unwrap());
            }
        }
    }
    messages
}

fn feed(receiver: &mut BlobReceiver, message: BlobMessage) -> Result<ReceiveOutcome, BlobRejection> {
    match message {
        BlobMessage::Begin(header) => receiver.begin(header),
        BlobMessage::Chunk(chunk) => receiver.chunk(&chunk),
        BlobMessage::End(header) => receiver.end(header),
        other => panic!("unexpected {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunks_tile_the_blob_exactly(len in 0_usize..2048, chunk_size in 1_usize..300) {
        let network = MemoryNetwork::new();
        let config = ReplicationConfig {
            chunk_size,
            ..ReplicationConfig::default()
        };
        let (mut origin, mut raw) = origin_with_raw_observer(&network, config);
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        origin.send_blob(BlobKind::SaveImage, &data).unwrap();

        let messages = drain_blob_messages(&mut raw);
        let header = BlobHeader {
            kind: BlobKind::SaveImage.as_u8(),
            total_length: len as u32,
        };
        prop_assert_eq!(messages.first(), Some(&BlobMessage::Begin(header)));
        prop_assert_eq!(messages.last(), Some(&BlobMessage::End(header)));

        let chunks: Vec<&BlobChunk> = messages
            .iter()
            .filter_map(|message| match message {
                BlobMessage::Chunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect();
        prop_assert_eq!(chunks.len(), len.div_ceil(chunk_size));
        prop_assert_eq!(messages.len(), chunks.len() + 2);
        let mut next_offset = 0_usize;
        for chunk in &chunks {
            prop_assert_eq!(chunk.offset as usize, next_offset);
            prop_assert!(!chunk.bytes.is_empty());
            prop_assert!(chunk.bytes.len() <= chunk_size);
            next_offset += chunk.bytes.len();
        }
        prop_assert_eq!(next_offset, len);

        let mut receiver = BlobReceiver::new(&config);
        for message in messages {
            prop_assert!(feed(&mut receiver, message).is_ok());
        }
        prop_assert_eq!(receiver.in_progress(), None);
        prop_assert_eq!(receiver.blob(BlobKind::SaveImage), Some(&data[..]));
    }
}

#[test]
fn empty_blob_is_begin_then_end() {
    let network = MemoryNetwork::new();
    let (mut origin, mut raw) = origin_with_raw_observer(&network, ReplicationConfig::default());
    origin.send_blob(BlobKind::InitialState, &[]).unwrap();

    let header = BlobHeader {
        kind: BlobKind::InitialState.as_u8(),
        total_length: 0,
    };
    assert_eq!(
        drain_blob_messages(&mut raw),
        vec![BlobMessage::Begin(header), BlobMessage::End(header)]
    );
}

#[test]
fn oversized_blob_is_refused_before_anything_is_sent() {
    let network = MemoryNetwork::new();
    let config = ReplicationConfig {
        max_blob_length: 16,
        ..ReplicationConfig::default()
    };
    let (mut origin, mut raw) = origin_with_raw_observer(&network, config);
    let result = origin.send_blob(BlobKind::CartImage, &[0; 17]);
    assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    assert!(drain_blob_messages(&mut raw).is_empty());
}

#[test]
fn rejected_chunk_leaves_the_transfer_resumable() {
    let observer = Arc::new(CollectingObserver::new());
    let config = ReplicationConfig {
        chunk_size: 100,
        ..ReplicationConfig::default()
    };
    let mut receiver = BlobReceiver::new(&config)
        .with_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));
    let data: Vec<u8> = (0..100).collect();
    let header = BlobHeader {
        kind: BlobKind::CartImage.as_u8(),
        total_length: 100,
    };
    let chunk = |offset: u32, bytes: &[u8]| BlobChunk {
        kind: header.kind,
        total_length: 100,
        offset,
        bytes: bytes.to_vec(),
    };

    receiver.begin(header).unwrap();
    assert_eq!(
        receiver.chunk(&chunk(0, &data[..90])),
        Ok(ReceiveOutcome::Stored { len: 90 })
    );
    let before = receiver.partial().unwrap().to_vec();

    assert_eq!(
        receiver.chunk(&chunk(90, &[0xEE; 20])),
        Err(BlobRejection::OutOfBounds {
            offset: 90,
            len: 20,
            total_length: 100,
        })
    );
    assert_eq!(receiver.partial().unwrap(), &before[..]);
    assert!(observer.has_violation(ViolationKind::Replication));

    receiver.chunk(&chunk(90, &data[90..])).unwrap();
    assert_eq!(
        receiver.end(header),
        Ok(ReceiveOutcome::Completed(BlobKind::CartImage))
    );
    assert_eq!(receiver.blob(BlobKind::CartImage), Some(&data[..]));
}

#[test]
fn frames_for_another_transfer_are_dropped() {
    let mut receiver = BlobReceiver::new(&ReplicationConfig::default());
    let save = BlobHeader {
        kind: BlobKind::SaveImage.as_u8(),
        total_length: 8,
    };
    receiver.begin(save).unwrap();

    let cart = BlobHeader {
        kind: BlobKind::CartImage.as_u8(),
        total_length: 8,
    };
    assert_eq!(
        receiver.begin(cart),
        Err(BlobRejection::TransferInProgress {
            open: BlobKind::SaveImage
        })
    );
    assert!(matches!(
        receiver.end(cart),
        Err(BlobRejection::HeaderMismatch { .. })
    ));
    assert_eq!(receiver.in_progress(), Some(BlobKind::SaveImage));

    receiver.end(save).unwrap();
    assert_eq!(
        receiver.begin(save),
        Err(BlobRejection::AlreadyReceived {
            kind: BlobKind::SaveImage
        })
    );
}
