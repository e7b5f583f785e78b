//! Flow fingerprint benchmark
//!
//! The fingerprint hash sits on the dispatch hot path: one canonicalization
//! plus one hash per packet.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dpi_common::FlowFingerprint;

fn fingerprint_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_fingerprint");

    group.bench_function("canonicalize_v4", |b| {
        b.iter(|| {
            FlowFingerprint::new_v4(
                black_box(0xc0a80101),
                black_box(0x0a000001),
                black_box(12345),
                black_box(443),
                black_box(6),
            )
        })
    });

    let fp = FlowFingerprint::new_v4(0xc0a80101, 0x0a000001, 12345, 443, 6);
    group.bench_function("hash", |b| b.iter(|| black_box(fp).hash()));

    group.bench_function("partition", |b| b.iter(|| black_box(fp).partition(black_box(14))));

    group.finish();
}

criterion_group!(benches, fingerprint_benchmark);
criterion_main!(benches);
