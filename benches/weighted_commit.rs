//! Micro-benchmark for the hot weighted-commit computation. Benchmarks
//! only -- behavioral coverage lives in `consensus::replication`'s own
//! `#[cfg(test)]` module.

use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vraft::consensus::{weighted_commit, NodeId, VoteRecord};

fn sample_votes(n: usize) -> Vec<VoteRecord> {
    (0..n as NodeId)
        .map(|i| VoteRecord {
            round_id: 1,
            voter: i + 1,
            granted: i % 3 != 0,
            observed_snr_db: 10.0 + i as f32,
            received_at: Instant::now(),
        })
        .collect()
}

fn bench_weighted_commit(c: &mut Criterion) {
    let votes = sample_votes(32);
    c.bench_function("weighted_commit_32_voters", |b| {
        b.iter(|| weighted_commit(black_box(&votes), 0, 22.0, black_box(24)))
    });
}

criterion_group!(benches, bench_weighted_commit);
criterion_main!(benches);
