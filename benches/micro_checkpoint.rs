#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use umbra::storage::{
    ArrayStore, BlobCatalog, Checkpointer, DiskArray, StorageManager, StorageOptions, TxnKind,
};

const ARRAY_LEN: u64 = 100_000;

fn micro_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/checkpoint");
    group.sample_size(20);
    for updates in [16u64, 1024] {
        let harness = CheckpointHarness::new();
        group.throughput(Throughput::Elements(updates));
        group.bench_with_input(
            BenchmarkId::new("update_and_checkpoint", updates),
            &updates,
            |b, &updates| {
                b.iter(|| harness.update_and_checkpoint(updates));
            },
        );
    }
    group.finish();

    let mut group = c.benchmark_group("micro/disk_array");
    group.throughput(Throughput::Elements(4096));
    group.bench_function("push_back_4096", |b| {
        b.iter_with_setup(CheckpointHarness::new, |harness| harness.push_back(4096));
    });
    group.finish();
}

struct CheckpointHarness {
    _tmpdir: TempDir,
    storage: StorageManager,
    catalog: BlobCatalog,
    store: ArrayStore,
    array: DiskArray<u64>,
}

impl CheckpointHarness {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let options = StorageOptions {
            buffer_pool_pages: 4096,
            ..StorageOptions::default()
        };
        let storage = StorageManager::open(tmpdir.path().join("bench.umbra"), options).expect("open");
        let catalog = BlobCatalog::default();
        let store = ArrayStore::new(true);
        let (_, array) = store.create_array::<u64>(&storage).expect("array");
        array
            .resize(storage.allocator(), TxnKind::Write, ARRAY_LEN, 0)
            .expect("resize");
        Checkpointer::new(&storage, &catalog, &store)
            .write_checkpoint()
            .expect("checkpoint");
        Self {
            _tmpdir: tmpdir,
            storage,
            catalog,
            store,
            array,
        }
    }

    fn update_and_checkpoint(&self, updates: u64) {
        let stride = ARRAY_LEN / updates;
        for i in 0..updates {
            self.array
                .update(TxnKind::Write, i * stride, i)
                .expect("update");
        }
        Checkpointer::new(&self.storage, &self.catalog, &self.store)
            .write_checkpoint()
            .expect("checkpoint");
    }

    fn push_back(&self, count: u64) {
        let mut iter = self.array.iter_mut(self.storage.allocator()).expect("iter");
        for i in 0..count {
            iter.push_back(i).expect("push");
        }
    }
}

criterion_group!(benches, micro_checkpoint);
criterion_main!(benches);
