use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use precipice::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    guard_rail::GuardRail,
    metrics::{IntervalLatency, RollingCounts},
    outcome::{Rejected, TimeoutableResult},
    rate_limiter::RateLimiter,
    semaphore::Semaphore,
    time::{Clock, SystemClock},
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

type Rail = GuardRail<TimeoutableResult, Rejected>;

/// Rail with a semaphore, a generous rate limiter and a breaker
fn full_rail(clock: Arc<SystemClock>) -> Rail {
    let now = clock.nanos();
    let metrics = Arc::new(RollingCounts::new(60, Duration::from_secs(1), now).unwrap());
    let semaphore = Semaphore::new("pool", 1_000, Rejected::MaxConcurrencyLevelExceeded).unwrap();
    let limiter = RateLimiter::new(
        "limiter",
        u64::MAX / 2,
        Duration::from_secs(1),
        Rejected::RateLimited,
        now,
    )
    .unwrap();
    let breaker = CircuitBreaker::new(
        "breaker",
        CircuitBreakerConfig::default(),
        Rejected::CircuitOpen,
        Arc::clone(&metrics),
    )
    .unwrap();

    GuardRail::builder("bench")
        .clock(clock)
        .result_metrics(metrics)
        .add_backpressure(Arc::new(semaphore))
        .add_backpressure(Arc::new(limiter))
        .add_backpressure(Arc::new(breaker))
        .build()
        .unwrap()
}

/// Benchmark one admitted acquire/release cycle
fn bench_acquire_release(c: &mut Criterion) {
    let clock = Arc::new(SystemClock::new());
    let empty: Rail = GuardRail::builder("empty")
        .clock(clock.clone())
        .build()
        .unwrap();
    let full = full_rail(clock.clone());

    let mut group = c.benchmark_group("acquire_release");
    group.throughput(Throughput::Elements(1));

    for (label, rail) in [("empty_chain", &empty), ("full_chain", &full)] {
        group.bench_with_input(BenchmarkId::from_parameter(label), rail, |b, rail| {
            b.iter(|| {
                let now = clock.nanos();
                let rejected = rail.acquire_permits(black_box(1), now);
                if rejected.is_none() {
                    rail.release_permits(1, TimeoutableResult::Success, now, clock.nanos());
                }
                black_box(rejected);
            });
        });
    }

    group.bench_function("promise", |b| {
        b.iter(|| {
            let promise = full
                .acquire_promise::<u64, ()>(1, clock.nanos())
                .unwrap();
            black_box(promise.complete(TimeoutableResult::Success, 1));
        });
    });

    group.finish();
}

/// Benchmark the metric hot paths on their own
fn bench_metrics(c: &mut Criterion) {
    let clock = SystemClock::new();
    let counts = RollingCounts::<TimeoutableResult>::new(60, Duration::from_secs(1), clock.nanos()).unwrap();
    let latency = IntervalLatency::<TimeoutableResult>::new().unwrap();

    let mut group = c.benchmark_group("metrics");

    group.bench_function("rolling_counts_add", |b| {
        b.iter(|| counts.add(TimeoutableResult::Success, black_box(1), clock.nanos()));
    });

    group.bench_function("interval_latency_record", |b| {
        let mut value = 1u64;
        b.iter(|| {
            value = value.wrapping_mul(6364136223846793005).wrapping_add(1);
            latency.record(TimeoutableResult::Success, black_box(value % 10_000_000));
        });
    });

    group.bench_function("interval_latency_snapshot", |b| {
        b.iter(|| black_box(latency.interval_snapshot().merged().count()));
    });

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_metrics);
criterion_main!(benches);
