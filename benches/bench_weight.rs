//! Micro benchmarks for the control-plane weight computer.
//! Pure CPU - no network, no IO, no kernel involved.
//!
//! ```bash
//! cargo bench --bench bench_weight
//! ```

use criterion::{criterion_group, criterion_main, Criterion};
use fluxlb_control::circuit::CircuitState;
use fluxlb_control::weight_computer::{compute_group, TargetSignal};
use fluxlb_ebpf_common::Addr;

fn sample_signals(n: usize) -> Vec<TargetSignal> {
    (0..n)
        .map(|i| TargetSignal {
            ip: Addr::from_v4_octets([10, 0, 0, i as u8 + 1]),
            port: 8080,
            original_weight: (100 / n) as u8,
            healthy: i % 5 != 0,
            draining: false,
            circuit: CircuitState::Closed,
            recovery_step: None,
            active_connections: (i as u32) * 3,
        })
        .collect()
}

fn bench_compute_group_weighted(c: &mut Criterion) {
    let signals = sample_signals(8);
    c.bench_function("compute_group_weighted", |b| {
        b.iter(|| compute_group(&signals, false, false));
    });
}

fn bench_compute_group_least_conn(c: &mut Criterion) {
    let signals = sample_signals(8);
    c.bench_function("compute_group_least_conn", |b| {
        b.iter(|| compute_group(&signals, true, false));
    });
}

criterion_group!(benches, bench_compute_group_weighted, bench_compute_group_least_conn);
criterion_main!(benches);
