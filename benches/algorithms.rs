#![allow(clippy::all)]
//! Benchmarks for the algorithm cores and request routing.
//!
//! Tests: token/leaky bucket evaluation throughput, counter carry-forward,
//! consistent-hash lookup and batch splitting.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gubernator::algorithms;
use gubernator::router::Router;
use gubernator::types::{Algorithm, Counter, RateLimitReq, SECOND};
use gubernator::PeerInfo;
use std::hint::black_box;

fn request(algorithm: Algorithm) -> RateLimitReq {
    RateLimitReq {
        name: "bench".to_string(),
        unique_key: "account:1234".to_string(),
        hits: 1,
        limit: 1_000_000,
        duration: 60 * SECOND,
        algorithm,
        ..Default::default()
    }
}

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("algorithms/token_bucket");
    let req = request(Algorithm::TokenBucket);
    let now = 1_000_000_000;

    group.bench_function("apply_fresh", |b| {
        b.iter(|| black_box(algorithms::apply(None, &req, now)));
    });

    group.bench_function("apply_carried", |b| {
        let (counter, _) = algorithms::apply(None, &req, now);
        b.iter(|| black_box(algorithms::apply(Some(&counter), &req, now)));
    });

    group.finish();
}

fn bench_leaky_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("algorithms/leaky_bucket");
    let req = request(Algorithm::LeakyBucket);
    let now = 1_000_000_000;

    group.bench_function("apply_fresh", |b| {
        b.iter(|| black_box(algorithms::apply(None, &req, now)));
    });

    group.bench_function("apply_with_leak", |b| {
        let (counter, _) = algorithms::apply(None, &req, now);
        let mut t = now;
        b.iter(|| {
            t += 1;
            black_box(algorithms::apply(Some(&counter), &req, t))
        });
    });

    group.finish();
}

fn bench_counter_carry(c: &mut Criterion) {
    let mut group = c.benchmark_group("algorithms/carry_chain");
    let req = request(Algorithm::TokenBucket);
    let now = 1_000_000_000;

    for chain in [10u64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("sequential_hits", chain), &chain, |b, &n| {
            b.iter(|| {
                let mut state: Option<Counter> = None;
                for _ in 0..n {
                    let (counter, resp) = algorithms::apply(state.as_ref(), &req, now);
                    black_box(&resp);
                    state = Some(counter);
                }
            });
        });
    }

    group.finish();
}

fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    let router = Router::new("127.0.0.1:9000");
    router.set_peers(
        (0..10)
            .map(|i| {
                PeerInfo::new(
                    format!("127.0.0.1:{}", 9000 + i),
                    format!("127.0.0.1:{}", 8000 + i),
                )
            })
            .collect(),
    );
    let snapshot = router.snapshot();

    group.bench_function("owner_of", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(snapshot.owner_of("bench", &format!("account:{i}")))
        });
    });

    for size in [10usize, 100, 1000] {
        let batch: Vec<RateLimitReq> = (0..size)
            .map(|i| {
                let mut r = request(Algorithm::TokenBucket);
                r.unique_key = format!("account:{i}");
                r
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("split_batch", size), &batch, |b, batch| {
            b.iter(|| black_box(snapshot.split_batch(batch)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_token_bucket,
    bench_leaky_bucket,
    bench_counter_carry,
    bench_router
);
criterion_main!(benches);
