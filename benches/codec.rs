// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame codec throughput: decoding a stream of `MESSAGE` frames back to
//! back, and encoding outgoing commands, at a few representative payload
//! sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use nsq::protocol::{Command, Frame, FrameDecoder};
use std::hint::black_box as bb;

const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

fn encode_message_frame(id: &[u8; 16], body: &[u8], timestamp: i64, attempts: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(26 + body.len());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&attempts.to_be_bytes());
    payload.extend_from_slice(id);
    payload.extend_from_slice(body);
    let size = (payload.len() + 4) as u32;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&2u32.to_be_bytes()); // FrameType::Message
    frame.extend_from_slice(&payload);
    frame
}

fn bench_decode_message_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_by_body_size");

    for size in [16, 256, 1024, 16384, 65536] {
        let body = vec![0xABu8; size];
        let single = encode_message_frame(b"0123456789abcdef", &body, 1_700_000_000_000_000_000, 1);
        // A batch of frames back to back, the way a connected socket streams them.
        let mut batch = Vec::new();
        for _ in 0..32 {
            batch.extend_from_slice(&single);
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(MAX_FRAME_SIZE);
                let mut reader = bb(batch.as_slice());
                let mut count = 0;
                while let Some(frame) = decoder.decode(&mut reader).expect("decode") {
                    bb(&frame);
                    count += 1;
                    if count == 32 {
                        break;
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_decode_response_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_response_and_heartbeat");

    let ok_frame = {
        let payload = b"OK";
        let size = (payload.len() + 4) as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&size.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    };

    group.bench_function("ok_response", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(MAX_FRAME_SIZE);
            let mut reader = bb(ok_frame.as_slice());
            let frame = decoder.decode(&mut reader).expect("decode").expect("frame");
            assert!(matches!(frame, Frame::Response(_)));
        });
    });

    group.finish();
}

fn bench_encode_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_encode_by_body_size");

    for size in [16, 256, 1024, 16384, 65536] {
        let body = vec![0xCDu8; size];
        let cmd = Command::Pub {
            topic: "bench_topic".to_string(),
            body: body.clone(),
        };

        group.bench_with_input(BenchmarkId::from_parameter(size), &cmd, |b, cmd| {
            b.iter(|| {
                let encoded = bb(cmd).encode();
                bb(&encoded);
            });
        });
    }

    group.finish();
}

criterion_group!(
    codec_benches,
    bench_decode_message_frames,
    bench_decode_response_frames,
    bench_encode_commands
);
criterion_main!(codec_benches);
