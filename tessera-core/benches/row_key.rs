//! Bench key encoding and row array inserts

use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

use tessera_core::key::RowKey;
use tessera_core::rowset::RowArray;
use tessera_core::schema::{DimensionDesc, Dimensions, KeyType};
use tessera_core::Datum;

const N: usize = 10_000;

fn dims() -> Dimensions {
    Dimensions::new(vec![
        DimensionDesc::new(KeyType::Utf8),
        DimensionDesc::descending(KeyType::Int64),
    ])
    .unwrap()
}

fn make_values(n: usize) -> Vec<[Datum; 2]> {
    (0..n)
        .map(|i| [Datum::from(format!("series-{:04}", i % 97)), Datum::Int64(i as i64)])
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let dims = dims();
    let values = make_values(N);
    c.bench_function("row_key_encode", |b| {
        b.iter(|| {
            for v in &values {
                black_box(RowKey::encode(&dims, v).unwrap());
            }
        })
    });

    let keys: Vec<RowKey> = values.iter().map(|v| RowKey::encode(&dims, v).unwrap()).collect();
    c.bench_function("row_key_decode", |b| {
        b.iter(|| {
            for k in &keys {
                black_box(k.decode(&dims).unwrap());
            }
        })
    });
}

fn bench_row_array(c: &mut Criterion) {
    let dims = dims();
    let mut keys: Vec<RowKey> = make_values(N)
        .iter()
        .map(|v| RowKey::encode(&dims, v).unwrap())
        .collect();
    keys.shuffle(&mut StdRng::seed_from_u64(0xC0FF_EE00));
    let value = Bytes::from_static(b"value");

    c.bench_function("row_array_insert_shuffled", |b| {
        b.iter_batched(
            || keys.clone(),
            |keys| {
                let mut array = RowArray::new();
                for (i, key) in keys.into_iter().enumerate() {
                    array.insert(key, value.clone(), i as u64 + 1);
                }
                black_box(array.len())
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_encode, bench_row_array);
criterion_main!(benches);
