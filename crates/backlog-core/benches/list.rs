//! Listing cost: full directory scan versus the derived index.

use backlog_core::facade::ScanSource;
use backlog_core::{CreateOptions, InitOptions, ItemFilter, Kind, RecordSource, Store};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

const SIZES: [usize; 3] = [100, 500, 2_000];

fn populated(size: usize) -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = InitOptions {
        index: true,
        ..InitOptions::default()
    };
    let store = Store::init(dir.path(), "bench", &options).expect("init");
    for n in 0..size {
        let kind = if n % 5 == 0 { Kind::Bug } else { Kind::Task };
        store
            .create(
                kind,
                &format!("Generated item {n}"),
                "bench",
                CreateOptions {
                    tags: vec![format!("shard-{}", n % 8)],
                    ..CreateOptions::default()
                },
            )
            .expect("create");
    }
    store.rebuild_index().expect("rebuild");
    (dir, store)
}

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("list");
    group.sample_size(20);
    let filter = ItemFilter {
        kind: Some(Kind::Bug),
        tag: Some("shard-0".into()),
        ..ItemFilter::default()
    };

    for size in SIZES {
        let (_dir, store) = populated(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("scan", size), &store, |b, store| {
            let scan = ScanSource::new(store.layout(), store.profile());
            b.iter(|| black_box(scan.list(&filter).expect("scan").rows.len()));
        });
        group.bench_with_input(BenchmarkId::new("index", size), &store, |b, store| {
            b.iter(|| black_box(store.list(&filter).expect("index").rows.len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_list);
criterion_main!(benches);
