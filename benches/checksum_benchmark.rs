use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use orbit_transfer::{
    crc64, crc64_combine, ChecksumAccumulator, MemoryStore, TransferConfig, UploadOptions,
    UploadSource, Uploader,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::hint::black_box;
use std::sync::Arc;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(42).fill(&mut data[..]);
    data
}

/// Raw CRC-64 throughput over a single buffer
fn bench_crc64(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc64");

    for size_kb in [4usize, 256, 4096].iter() {
        let data = random_bytes(size_kb * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size_kb), &data, |b, data| {
            b.iter(|| black_box(crc64(black_box(data))));
        });
    }

    group.finish();
}

/// Folding per-part checksums vs hashing the whole object again
fn bench_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc64_combine");
    let part_size = 64 * 1024;

    for parts in [16usize, 256, 1024].iter() {
        let crcs: Vec<u64> = (0..*parts as u64)
            .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .collect();

        group.bench_with_input(BenchmarkId::new("accumulator", parts), &crcs, |b, crcs| {
            b.iter(|| {
                let mut acc = ChecksumAccumulator::new();
                for crc in crcs {
                    acc.push(*crc, part_size);
                }
                black_box(acc.value())
            });
        });

        group.bench_with_input(BenchmarkId::new("pairwise", parts), &crcs, |b, crcs| {
            b.iter(|| {
                let folded = crcs
                    .iter()
                    .fold(0u64, |acc, crc| crc64_combine(acc, *crc, part_size));
                black_box(folded)
            });
        });
    }

    group.finish();
}

/// End-to-end multipart upload into the in-memory store
fn bench_multipart_upload(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let data = random_bytes(8 * 1024 * 1024);

    let mut group = c.benchmark_group("multipart_upload");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.sample_size(20);

    for parallelism in [1usize, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("parallelism", parallelism),
            parallelism,
            |b, &parallelism| {
                b.iter(|| {
                    runtime.block_on(async {
                        let store = Arc::new(MemoryStore::new());
                        let result = Uploader::new(store, TransferConfig::default())
                            .upload(
                                "bench",
                                "object",
                                UploadSource::bytes(data.clone()),
                                UploadOptions::default()
                                    .with_part_size(512 * 1024)
                                    .with_parallelism(parallelism),
                            )
                            .await
                            .unwrap();
                        black_box(result.hash_crc64)
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_crc64, bench_combine, bench_multipart_upload);
criterion_main!(benches);
