use bytes::Bytes;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput,
};
use firkin::{Bitcask, Config, Handle, KeyValueStorage};
use pprof::criterion::{Output, PProfProfiler};
use rand::prelude::*;
use tempfile::TempDir;

const ITER: usize = 10000;
const KEY_SIZE: usize = 1000;
const VAL_SIZE: usize = 10000;

fn prebuilt_kv_pairs(size: usize, key_size: usize, val_size: usize) -> Vec<(Bytes, Bytes)> {
    let mut rng = StdRng::seed_from_u64(0xb1ca5c);
    (0..size)
        .map(|_| {
            let mut key = vec![0u8; key_size];
            let mut val = vec![0u8; val_size];
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut val);
            (Bytes::from(key), Bytes::from(val))
        })
        .collect()
}

fn get_bitcask() -> (Bitcask, Handle, TempDir) {
    let tmpdir = TempDir::new().unwrap();
    let kv = Config::default().open(tmpdir.path()).unwrap();
    let handle = kv.get_handle();
    (kv, handle, tmpdir)
}

/// Call set on the same key-value store instance for every benchmark
/// iteration, the key and value will be randomly generated byte sequences
/// with size of `KEY_SIZE` and `VAL_SIZE`.
pub fn bench_write(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let mut nbytes = 0;
    for (k, v) in kv_pairs.iter() {
        nbytes += k.len() + v.len();
    }

    let mut g = c.benchmark_group("bitcask_sequential_write");
    g.throughput(Throughput::Bytes(nbytes as u64));
    g.bench_with_input("bitcask", &kv_pairs, |b, kv_pairs| {
        b.iter_batched(
            || {
                let (kv, handle, tmpdir) = get_bitcask();
                (kv, handle, kv_pairs.to_vec(), tmpdir)
            },
            |(_kv, handle, kv_pairs, _tmpdir)| {
                kv_pairs.into_iter().for_each(|(k, v)| {
                    handle.set(black_box(k), black_box(v)).unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

/// Call get on a pre-populated key-value store instance for every benchmark
/// iteration, the key and value will be randomly generated byte sequences
/// with size of `KEY_SIZE` and `VAL_SIZE`.
pub fn bench_read(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let mut nbytes = 0;
    for (k, v) in kv_pairs.iter() {
        nbytes += k.len() + v.len();
    }

    let (_kv, handle, _tmpdir) = get_bitcask();
    kv_pairs.iter().cloned().for_each(|(k, v)| {
        handle.set(k, v).unwrap();
    });

    let mut g = c.benchmark_group("bitcask_sequential_read");
    g.throughput(Throughput::Bytes(nbytes as u64));
    g.bench_with_input("bitcask", &kv_pairs, |b, kv_pairs| {
        b.iter_batched(
            || {
                let mut kv_pairs = kv_pairs.to_vec();
                kv_pairs.shuffle(&mut rand::thread_rng());
                kv_pairs
            },
            |kv_pairs| {
                kv_pairs.into_iter().for_each(|(k, _)| {
                    handle.get(black_box(k)).unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(100, Output::Flamegraph(None)));
    targets = bench_write, bench_read
);
criterion_main!(benches);
