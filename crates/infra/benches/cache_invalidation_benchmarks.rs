use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::collections::HashMap;
use std::time::Duration;

use scribe_infra::cache::{CacheKey, VersionedCache};
use scribe_infra::kv::InMemoryKvStore;

const TTL: Duration = Duration::from_secs(300);
const NAMESPACE: &str = "articles:bench-user";

/// Prefix invalidation the way a plain key/value cache does it: walk every
/// key and delete the matching ones.
#[derive(Debug, Clone, Default)]
struct ScanDeleteCache {
    entries: HashMap<String, String>,
}

impl ScanDeleteCache {
    fn seeded(matching: usize, unrelated: usize) -> Self {
        let mut entries = HashMap::with_capacity(matching + unrelated);
        for i in 0..matching {
            entries.insert(format!("{NAMESPACE}:{i}"), format!("value-{i}"));
        }
        for i in 0..unrelated {
            entries.insert(format!("articles:other-{i}:{i}"), format!("value-{i}"));
        }
        Self { entries }
    }

    fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len()
    }
}

async fn seeded_versioned(entries: usize) -> VersionedCache {
    let cache = VersionedCache::new(InMemoryKvStore::arc());
    for i in 0..entries {
        let key = CacheKey::new(NAMESPACE, i.to_string());
        cache.set(&key, &format!("value-{i}"), TTL).await;
    }
    cache
}

fn bench_namespace_invalidation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("namespace_invalidation");

    for entries in [10usize, 100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(entries as u64));

        let cache = rt.block_on(seeded_versioned(entries));
        group.bench_with_input(BenchmarkId::new("version_bump", entries), &entries, |b, _| {
            b.to_async(&rt)
                .iter(|| async { black_box(cache.invalidate_version(NAMESPACE).await) });
        });

        let template = ScanDeleteCache::seeded(entries, entries);
        group.bench_with_input(BenchmarkId::new("scan_and_delete", entries), &entries, |b, _| {
            b.iter_batched(
                || template.clone(),
                |mut store| black_box(store.invalidate_prefix(NAMESPACE)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_versioned_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("versioned_read");
    let cache = rt.block_on(seeded_versioned(100));
    let hit = CacheKey::new(NAMESPACE, "42");

    group.bench_function("hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get::<String>(&hit).await) });
    });

    rt.block_on(cache.invalidate_version(NAMESPACE));
    group.bench_function("stale_after_bump", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get::<String>(&hit).await) });
    });

    group.finish();
}

criterion_group!(benches, bench_namespace_invalidation, bench_versioned_read);
criterion_main!(benches);
