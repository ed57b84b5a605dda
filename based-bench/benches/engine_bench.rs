//! Protocol engine benchmarks.

use based_client::{ClientError, ConnectionStatus, Listener, ProtocolEngine, Responder, Transport};
use based_protocol::{obs_id, Encoder, ServerMessage};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Transport that is always open and discards everything.
struct NullTransport;

impl Transport for NullTransport {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Open
    }

    fn send(&self, frames: Bytes) -> Result<(), ClientError> {
        black_box(frames);
        Ok(())
    }
}

fn create_engine() -> ProtocolEngine {
    ProtocolEngine::new(Arc::new(NullTransport))
}

fn bench_observe_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_fan_out");

    for listeners in [1, 10, 100] {
        let engine = create_engine();
        for _ in 0..listeners {
            engine
                .observe("counter", "", Listener::new(|r| {
                    black_box(r);
                }))
                .unwrap();
        }
        let id = obs_id("counter", "");
        let mut checksum = 0u64;

        group.throughput(Throughput::Elements(listeners as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &engine,
            |b, engine| {
                b.iter(|| {
                    checksum += 1;
                    let frame = Encoder::encode_server(&ServerMessage::SubscriptionData {
                        id,
                        checksum,
                        payload: "{\"count\":1}".to_string(),
                    })
                    .unwrap();
                    engine.on_message(&frame);
                });
            },
        );
    }

    group.finish();
}

fn bench_diff_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_diff");

    let engine = create_engine();
    engine
        .observe("list", "", Listener::new(|r| {
            black_box(r);
        }))
        .unwrap();
    let id = obs_id("list", "");
    let items: Vec<u32> = (0..1000).collect();
    let seed = Encoder::encode_server(&ServerMessage::SubscriptionData {
        id,
        checksum: 1,
        payload: serde_json::json!({ "items": items }).to_string(),
    })
    .unwrap();
    engine.on_message(&seed);

    let mut checksum = 1u64;
    group.bench_function("replace_last_item", |b| {
        b.iter(|| {
            let patch = serde_json::json!({ "items": [2, 1000, [1, 999, 0], [0, checksum]] });
            let frame = Encoder::encode_server(&ServerMessage::SubscriptionDiff {
                id,
                checksum: checksum + 1,
                prev_checksum: checksum,
                patch: patch.to_string(),
            })
            .unwrap();
            engine.on_message(&frame);
            checksum += 1;
        });
    });

    group.finish();
}

fn bench_call_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_call");
    let engine = create_engine();

    group.throughput(Throughput::Elements(1));
    group.bench_function("call_and_resolve", |b| {
        b.iter(|| {
            let request_id = engine
                .call("echo", "{\"a\":1}", Responder::new(|r| {
                    black_box(r);
                }))
                .unwrap();
            let frame = Encoder::encode_server(&ServerMessage::FunctionData {
                request_id,
                payload: "{\"a\":1}".to_string(),
            })
            .unwrap();
            engine.on_message(&frame);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_observe_fan_out,
    bench_diff_apply,
    bench_call_resolve,
);

criterion_main!(benches);
