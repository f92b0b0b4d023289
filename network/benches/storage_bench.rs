// Data storage benchmarks for the Tessera data plane.
//
// Covers inserts into a store with headroom, inserts at capacity (every
// add evicts), duplicate detection, and item id hashing.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tessera_network::clock::ManualClock;
use tessera_network::crypto::{KeyPair, Signature};
use tessera_network::data::pow::ProofOfWork;
use tessera_network::data::{
    AuthenticatedData, Authorization, DataStorage, DistributedDataItem, ListenerRegistry,
    MetaData,
};

const T0: u64 = 1_700_000_000_000;

fn meta(max_map_size: usize) -> MetaData {
    MetaData::new(60_000, 1_000, "Bench").with_max_map_size(max_map_size)
}

/// `n` distinct items. Storage does not check authorization, so one dummy
/// proof is shared.
fn items(n: usize) -> Vec<AuthenticatedData> {
    let authorization = Authorization {
        owner: KeyPair::from_seed(&[7; 32]).public_key(),
        signature: Signature::from_bytes(vec![0; 64]),
        proof_of_work: ProofOfWork {
            nonce: 0,
            difficulty: 0,
        },
    };
    (0..n)
        .map(|i| AuthenticatedData {
            item: DistributedDataItem::new(
                (i as u64).to_be_bytes().to_vec(),
                meta(1_000),
                T0,
                i as u64,
            ),
            authorization: authorization.clone(),
        })
        .collect()
}

fn store(max_map_size: usize) -> DataStorage {
    DataStorage::new(
        meta(max_map_size),
        600_000,
        Arc::new(ManualClock::new(T0)),
        Arc::new(ListenerRegistry::new()),
    )
    .unwrap()
}

fn bench_add_with_headroom(c: &mut Criterion) {
    let data = items(1_000);
    let mut group = c.benchmark_group("storage/add_headroom");
    group.throughput(Throughput::Elements(data.len() as u64));
    group.bench_function("1000_items", |b| {
        b.iter(|| {
            let store = store(10_000);
            for d in &data {
                store.add(d.clone()).unwrap();
            }
        });
    });
    group.finish();
}

fn bench_add_under_eviction(c: &mut Criterion) {
    let data = items(2_000);
    let mut group = c.benchmark_group("storage/add_evicting");

    for capacity in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let store = store(capacity);
                    for d in &data {
                        store.add(d.clone()).unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_duplicate_add(c: &mut Criterion) {
    let data = items(1_000);
    let store = store(10_000);
    for d in &data {
        store.add(d.clone()).unwrap();
    }
    let existing = data[500].clone();

    c.bench_function("storage/add_duplicate", |b| {
        b.iter(|| store.add(existing.clone()).unwrap());
    });
}

fn bench_item_id(c: &mut Criterion) {
    let item = DistributedDataItem::new(vec![0xAB; 1_000], meta(1_000), T0, 1);

    c.bench_function("item/id_1kb", |b| {
        b.iter(|| item.id());
    });
}

criterion_group!(
    benches,
    bench_add_with_headroom,
    bench_add_under_eviction,
    bench_duplicate_add,
    bench_item_id,
);
criterion_main!(benches);
