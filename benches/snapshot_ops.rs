use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

use diffsnap::blockdev::{BlockDevice, FileBackedBlockDevice, SECTOR_SIZE};
use diffsnap::config::SnapshotEngineConfig;
use diffsnap::{attach_tracker, SnapshotManager};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn benchmark_cow_write(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let rt = runtime();

    let (manager, tracker) = rt.block_on(async {
        let original = Arc::new(
            FileBackedBlockDevice::create(temp_dir.path().join("orig.img"), SECTOR_SIZE * 4096)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;

        let manager = SnapshotManager::new(SnapshotEngineConfig::default());
        let id = manager.create(temp_dir.path().join("diff.img"), 1 << 20).await.unwrap();
        let tracker = attach_tracker(original, &SnapshotEngineConfig::default());
        manager.add_device(id, tracker.clone()).unwrap();
        manager.take(id).await.unwrap();
        (manager, tracker)
    });
    let _ = &manager;

    c.bench_function("cow_write_first_touch_1_sector", |b| {
        b.iter(|| {
            rt.block_on(async {
                let range = diffsnap::SectorRange::new(black_box(0), 1);
                tracker.submit_write(range, false).await.unwrap();
            })
        });
    });
}

fn benchmark_image_read(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let rt = runtime();

    let image = rt.block_on(async {
        let original = Arc::new(
            FileBackedBlockDevice::create(temp_dir.path().join("orig.img"), SECTOR_SIZE * 4096)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;

        let manager = SnapshotManager::new(SnapshotEngineConfig::default());
        let id = manager.create(temp_dir.path().join("diff.img"), 1 << 20).await.unwrap();
        let tracker = attach_tracker(original, &SnapshotEngineConfig::default());
        manager.add_device(id, tracker.clone()).unwrap();
        manager.take(id).await.unwrap();

        manager.get(id).unwrap().image_for(&tracker).unwrap()
    });

    c.bench_function("image_read_through_1_sector", |b| {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        b.iter(|| {
            rt.block_on(async {
                image.read_at(black_box(0), &mut buf).await.unwrap();
            })
        });
    });
}

criterion_group!(benches, benchmark_cow_write, benchmark_image_read);
criterion_main!(benches);
