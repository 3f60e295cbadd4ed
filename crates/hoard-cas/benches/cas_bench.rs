use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hoard_cas::{calculate_cas_key, Storage};
use hoard_config::testing::TestEnvironment;

fn bench_hash(c: &mut Criterion) {
    let data = vec![7u8; 1024 * 1024]; // 1MB

    c.bench_function("cas_key_1mb", |b| {
        b.iter(|| calculate_cas_key(black_box(&data), false))
    });
}

fn bench_store_dedup(c: &mut Criterion) {
    let env = TestEnvironment::new().unwrap();
    let storage = Storage::open(env.storage_config(0)).unwrap();
    let data = vec![0u8; 1024 * 10]; // 10KB

    // Same content every iteration: measures the dedup path.
    c.bench_function("store_dedup_10kb", |b| {
        b.iter(|| storage.store_cas_file_from_memory(black_box(&data), "bench").unwrap())
    });
}

fn bench_retrieve(c: &mut Criterion) {
    let env = TestEnvironment::new().unwrap();
    let storage = Storage::open(env.storage_config(0)).unwrap();
    let data = vec![1u8; 1024 * 1024]; // 1MB
    let key = storage.store_cas_file_from_memory(&data, "bench").unwrap();

    c.bench_function("retrieve_mmap_1mb", |b| {
        b.iter(|| storage.retrieve_cas_file(black_box(&key), "bench").unwrap().len())
    });
}

fn bench_retrieve_compressed(c: &mut Criterion) {
    let env = TestEnvironment::new().unwrap();
    let mut config = env.storage_config(0);
    config.store_compressed = true;
    let storage = Storage::open(config).unwrap();
    let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 97) as u8).collect();
    let key = storage.store_cas_file_from_memory(&data, "bench").unwrap();

    c.bench_function("retrieve_compressed_1mb", |b| {
        b.iter(|| storage.retrieve_cas_file(black_box(&key), "bench").unwrap().len())
    });
}

criterion_group!(
    benches,
    bench_hash,
    bench_store_dedup,
    bench_retrieve,
    bench_retrieve_compressed
);
criterion_main!(benches);
