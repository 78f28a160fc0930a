use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::collections::HashMap;

use serde_json::json;

use meridian_core::{CorrelationId, UserId};
use meridian_events::{Envelope, Stream, wire};
use meridian_infra::tasks::{BackoffStrategy, RetryConfig};

fn bench_envelope(c: &mut Criterion) {
    let envelope = Envelope::new(
        Stream::Market,
        "market.data.collected",
        1,
        json!({
            "symbols": ["NVDA", "TSLA", "AAPL", "MSFT"],
            "source": "primary",
            "quotes": {"NVDA": 905.4, "TSLA": 244.1, "AAPL": 228.9, "MSFT": 431.0},
        }),
    )
    .correlated(CorrelationId::new())
    .from_user(UserId::new())
    .with_metadata("collector", "bench");

    let fields: HashMap<String, String> = wire::marshal(&envelope).into_iter().collect();

    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Elements(1));
    group.bench_function("marshal", |b| {
        b.iter(|| wire::marshal(black_box(&envelope)));
    });
    group.bench_function("unmarshal", |b| {
        b.iter(|| wire::unmarshal(black_box(&fields)).expect("unmarshal"));
    });
    group.bench_function("round_trip", |b| {
        b.iter(|| {
            let fields: HashMap<String, String> =
                wire::marshal(black_box(&envelope)).into_iter().collect();
            wire::unmarshal(&fields).expect("unmarshal")
        });
    });
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryConfig {
        max_attempts: 10,
        backoff: BackoffStrategy::Exponential,
        base_delay_ms: 100,
        max_delay_ms: 10_000,
        jitter: true,
    };

    c.bench_function("backoff/delay_for_attempt", |b| {
        b.iter(|| {
            for attempt in 1..=10u32 {
                black_box(policy.delay_for_attempt(black_box(attempt)));
            }
        });
    });
}

criterion_group!(benches, bench_envelope, bench_backoff);
criterion_main!(benches);
