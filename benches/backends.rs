use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use custocrypt::accel::Dispatcher;
use custocrypt::chunk::Chunk;
use custocrypt::config::AccelerationConfig;
use custocrypt::crypto::SymmetricKey;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn bench_backends(c: &mut Criterion) {
    let dispatcher = Dispatcher::probe(&AccelerationConfig::default());
    let key = [0x42u8; 32];
    let iv = [0x24u8; 16];

    let mut group = c.benchmark_group("aes256_cbc_encrypt");
    for size in [64 * 1024, 1024 * 1024] {
        let data = make_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        for kind in dispatcher.capabilities().iter() {
            group.bench_with_input(BenchmarkId::new(kind.as_str(), size), &data, |b, data| {
                b.iter(|| dispatcher.encrypt_with(kind, &key, &iv, black_box(data)));
            });
        }
    }
    group.finish();
}

fn bench_chunk_pipeline(c: &mut Criterion) {
    let dispatcher = Dispatcher::software();
    let key = SymmetricKey::random();
    let base_iv = [7u8; 16];
    let data = make_data(1024 * 1024 - 5);

    let mut group = c.benchmark_group("final_chunk");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("encrypt_pad", |b| {
        b.iter(|| {
            let chunk = Chunk {
                index: 3,
                data: data.clone(),
                is_final: true,
            };
            dispatcher.encrypt_chunk(black_box(chunk), &key, &base_iv)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_backends, bench_chunk_pipeline);
criterion_main!(benches);
