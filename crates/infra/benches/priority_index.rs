use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use augur_core::OrderId;
use augur_infra::queue::{simulated_slot, RankedEntry, RankedQueue};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 2, 12, 0, 0).unwrap()
}

/// Deterministic spread of amounts, urgency and ages.
fn entries(count: usize) -> Vec<RankedEntry> {
    (0..count)
        .map(|i| RankedEntry {
            order_id: OrderId::new(),
            normalized_amount: 20.0 + (i * 37 % 500) as f64,
            urgent: i % 7 == 0,
            created_at: now() - Duration::minutes((i * 13 % 4_000) as i64),
            score: 0.0,
        })
        .collect()
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_rebuild");

    for count in [100usize, 1_000, 5_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("build", count), count, |b, &count| {
            let input = entries(count);
            b.iter(|| RankedQueue::build(black_box(input.clone()), now()));
        });
    }

    group.finish();
}

fn bench_simulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_simulation");

    for count in [100usize, 1_000, 5_000].iter() {
        group.bench_with_input(BenchmarkId::new("simulate", count), count, |b, &count| {
            let queue = RankedQueue::build(entries(count), now());
            b.iter(|| simulated_slot(&queue, black_box(180.0), black_box(false), now()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rebuild, bench_simulation);
criterion_main!(benches);
