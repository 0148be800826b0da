use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use tessera_mem::{MemoryConfig, RawMemory};

const OPS: u64 = 10_000;

/// Alloc/free pairs of a fixed size.
fn malloc_free(memory: &RawMemory, size: u32) {
    for _ in 0..OPS {
        let address = memory.malloc(size).expect("malloc");
        black_box(address);
        memory.free(address).expect("free");
    }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
    let config = MemoryConfig::new(64 * 1024 * 1024, 8 * 1024 * 1024);
    let memory = RawMemory::with_heap(&config).expect("initialize");

    let mut group = c.benchmark_group("malloc_throughput");
    for size in [16u32, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));
        group.bench_with_input(BenchmarkId::new("malloc_free", size), &size, |b, &size| {
            b.iter(|| malloc_free(&memory, size));
        });
    }
    group.finish();
}

fn benchmark_read_write(c: &mut Criterion) {
    let config = MemoryConfig::new(64 * 1024 * 1024, 8 * 1024 * 1024);
    let memory = RawMemory::with_heap(&config).expect("initialize");
    let address = memory.malloc(4096).expect("malloc");

    let mut group = c.benchmark_group("block_access");
    group.throughput(Throughput::Elements(OPS));
    group.bench_function("write_read_long", |b| {
        b.iter(|| {
            for i in 0..OPS {
                let offset = (i % 512) * 8;
                memory.write_long(address, offset, i).expect("write");
                black_box(memory.read_long(address, offset).expect("read"));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_read_write);
criterion_main!(benches);
