//! Micro benchmarks for the packet-parsing and checksum hot path.
//! Pure CPU - no network, no IO, no kernel involved.
//!
//! ```bash
//! cargo bench --bench bench_pipeline
//! ```

use criterion::{criterion_group, criterion_main, Criterion};
use fluxlb_core::pipeline::{parse_ipv4_tcp, rewrite_destination};

fn sample_packet() -> Vec<u8> {
    let mut buf = vec![0u8; 14 + 20 + 20];
    buf[12] = 0x08;
    buf[13] = 0x00;
    buf[14] = 0x45;
    buf[14 + 9] = 6;
    buf[14 + 12..14 + 16].copy_from_slice(&[10, 0, 0, 1]);
    buf[14 + 16..14 + 20].copy_from_slice(&[10, 0, 0, 100]);
    buf[14 + 20 + 12] = 5 << 4;
    buf
}

fn bench_parse(c: &mut Criterion) {
    let buf = sample_packet();
    c.bench_function("parse_ipv4_tcp", |b| {
        b.iter(|| parse_ipv4_tcp(&buf).unwrap());
    });
}

fn bench_rewrite_destination(c: &mut Criterion) {
    let buf = sample_packet();
    let view = parse_ipv4_tcp(&buf).unwrap();
    c.bench_function("rewrite_destination", |b| {
        b.iter(|| {
            let mut packet = buf.clone();
            rewrite_destination(&mut packet, &view, u32::from_be_bytes([10, 0, 1, 5]), 8443);
        });
    });
}

criterion_group!(benches, bench_parse, bench_rewrite_destination);
criterion_main!(benches);
