use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use strata_cache::{CacheManager, CacheStore, ManagerConfig, SetOptions, StoreConfig};

fn store(max_size: usize) -> CacheStore<String, String> {
    CacheStore::new(StoreConfig::new(Duration::from_secs(300), max_size)).unwrap()
}

fn bench_store_set(c: &mut Criterion) {
    let store = store(100_000);
    let mut i = 0u64;

    c.bench_function("store_set", |b| {
        b.iter(|| {
            i += 1;
            store.set(
                black_box(format!("key:{}", i % 50_000)),
                black_box("value".to_string()),
                SetOptions::default(),
            );
        });
    });
}

fn bench_store_get(c: &mut Criterion) {
    let store = store(100_000);
    for i in 0..10_000 {
        store.set(format!("key:{i}"), "value".to_string(), SetOptions::default());
    }
    let hit = "key:5000".to_string();
    let miss = "absent".to_string();

    c.bench_function("store_get_hit", |b| {
        b.iter(|| store.get(black_box(&hit)));
    });
    c.bench_function("store_get_miss", |b| {
        b.iter(|| store.get(black_box(&miss)));
    });
}

fn bench_store_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_set_at_capacity");

    for max_size in [100usize, 1_000, 10_000] {
        let store = store(max_size);
        for i in 0..max_size {
            store.set(format!("seed:{i}"), "value".to_string(), SetOptions::default());
        }
        let mut i = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(max_size), &max_size, |b, _| {
            b.iter(|| {
                i += 1;
                store.set(format!("key:{i}"), "value".to_string(), SetOptions::default());
            });
        });
    }

    group.finish();
}

fn bench_manager_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager: CacheManager<String> = CacheManager::builder(ManagerConfig::default())
        .local(100, StoreConfig::default())
        .build()
        .unwrap();

    rt.block_on(async {
        manager
            .set("test_key", "test_value".to_string(), SetOptions::default())
            .await;
    });

    c.bench_function("manager_get", |b| {
        b.to_async(&rt).iter(|| async {
            manager.get(black_box("test_key")).await;
        });
    });
}

criterion_group!(
    benches,
    bench_store_set,
    bench_store_get,
    bench_store_eviction,
    bench_manager_get
);
criterion_main!(benches);
