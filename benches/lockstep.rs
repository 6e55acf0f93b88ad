//! Benchmarks for the lockstep hot path: wire codecs and input queues.
//!
//! Run with: cargo bench --bench lockstep

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lockstep_netplay::network::messages::{BlobChunk, PlayerList};
use lockstep_netplay::{
    BlobMessage, ControlMessage, Frame, HostHandshake, InputFrame, InputMessage, InputQueue,
    LocalInput, PlayerId, PlayerName, PlayerRecord, PlayerRegistry, PlayerStatus, Touch,
};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};

fn full_roster() -> PlayerList {
    let registry = PlayerRegistry::new();
    for id in PlayerId::all() {
        registry.upsert(PlayerRecord {
            id,
            name: PlayerName::new(&format!("Player {id}")),
            status: if id == PlayerId::HOST {
                PlayerStatus::Host
            } else {
                PlayerStatus::Connected
            },
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, id.as_u8() + 1)),
            is_local: false,
        });
    }
    HostHandshake::roster_message(&registry)
}

fn bench_input_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputMessage");
    let message = InputMessage {
        frame: InputFrame::new(
            Frame::new(1234),
            LocalInput {
                key_mask: 0x3F0,
                touch: Some(Touch { x: 200, y: 100 }),
            },
        ),
    };
    let encoded = message.encode().unwrap_or_default();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&message).encode());
    });
    group.bench_function("decode", |b| {
        b.iter(|| InputMessage::decode(black_box(&encoded)));
    });
    group.finish();
}

fn bench_control_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("PlayerList");
    let message = ControlMessage::PlayerList(full_roster());
    let encoded = message.encode().unwrap_or_default();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&message).encode());
    });
    group.bench_function("decode", |b| {
        b.iter(|| ControlMessage::decode(black_box(&encoded)));
    });
    group.finish();
}

fn bench_blob_chunk_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("BlobChunk");
    for size in [1024_usize, 16 * 1024, 65520] {
        let message = BlobMessage::Chunk(BlobChunk {
            kind: 0,
            total_length: size as u32,
            offset: 0,
            bytes: vec![0x5A; size],
        });
        let encoded = message.encode().unwrap_or_default();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| black_box(message).encode());
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| BlobMessage::decode(black_box(encoded)));
        });
    }
    group.finish();
}

fn bench_input_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue");

    for lag_depth in [2_usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("steady_state", lag_depth),
            &lag_depth,
            |b, &lag_depth| {
                b.iter(|| {
                    let mut queue = InputQueue::new();
                    queue.prefill(lag_depth);
                    for frame in 0..256 {
                        queue.push(InputFrame::neutral(Frame::new(frame).delayed_by(lag_depth)));
                        black_box(queue.consume(Frame::new(frame)));
                    }
                });
            },
        );
    }

    group.bench_function("catch_up_after_stall", |b| {
        b.iter(|| {
            let mut queue = InputQueue::new();
            for frame in 0..128 {
                queue.push(InputFrame::neutral(Frame::new(frame)));
            }
            black_box(queue.consume(Frame::new(black_box(127))))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_input_codec,
    bench_control_codec,
    bench_blob_chunk_codec,
    bench_input_queue
);
criterion_main!(benches);
