//! Criterion benchmarks for data-channel chunking.
//!
//! Measures splitting an outbound clipboard payload into wire strings and
//! reassembling it on the receiving side.
//!
//! Run with:
//! ```bash
//! cargo bench --package clipscape-core --bench chunk_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use clipscape_core::protocol::channel::split_message_with;
use clipscape_core::{ChannelMessage, ChunkReassembler, CHUNK_SIZE};

fn payload(len: usize) -> String {
    (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect()
}

fn sizes() -> [usize; 4] {
    [1_024, CHUNK_SIZE, 4 * CHUNK_SIZE, 64 * CHUNK_SIZE]
}

/// Benchmarks `split_message_with` across payload sizes.
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    for size in sizes() {
        let text = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &text, |b, text| {
            b.iter(|| split_message_with(black_box(text), "bench001", CHUNK_SIZE));
        });
    }
    group.finish();
}

/// Benchmarks decode + reassembly of a pre-split payload.
fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");
    for size in sizes() {
        let wire = split_message_with(&payload(size), "bench001", CHUNK_SIZE);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut reassembler = ChunkReassembler::new();
                let mut out = None;
                for text in wire {
                    match ChannelMessage::decode(black_box(text)) {
                        Ok(ChannelMessage::Chunk(env)) => out = reassembler.accept(env).ok().flatten(),
                        Ok(ChannelMessage::Plain(msg)) => out = Some(msg),
                        _ => {}
                    }
                }
                out
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_split, bench_reassemble);
criterion_main!(benches);
