//! Snapshot lifecycle: create / add-device / take / wait-event / destroy.
//!
//! Grounded on `examples/original_source/module/snapshot.c`. A snapshot
//! owns one diff storage shared across every device added to it and one
//! tracker (hence one diff area, once taken) per device.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use crate::blockdev::{BlockDevice, Sector};
use crate::config::SnapshotEngineConfig;
use crate::diff_area::DiffArea;
use crate::diff_storage::{DiffStorage, DiffStorageError};
use crate::event::{Event, EventError, EventQueue};
use crate::snapshot_image::SnapshotImage;
use crate::tracker::{Tracker, TrackerError};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot {0} not found")]
    NotFound(Uuid),
    #[error("device already belongs to a snapshot")]
    DeviceAlreadyTracked,
    #[error("snapshot already taken")]
    AlreadyTaken,
    #[error("snapshot not taken yet")]
    NotTaken,
    #[error("wait interrupted")]
    Interrupted,
    #[error("device {0} not registered")]
    DeviceNotFound(String),
    #[error("diff storage error: {0}")]
    DiffStorage(#[from] DiffStorageError),
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

impl From<EventError> for SnapshotError {
    fn from(_: EventError) -> Self {
        SnapshotError::Interrupted
    }
}

enum LifecycleState {
    Populated,
    Taken,
}

struct Member {
    tracker: Arc<Tracker>,
    image: RwLock<Option<Arc<SnapshotImage>>>,
}

/// One snapshot: a diff storage, an event queue, and the set of devices
/// added to it. States: `(empty) -> (populated) -> (taken) -> (destroyed)`.
pub struct Snapshot {
    id: Uuid,
    diff_storage: Arc<DiffStorage>,
    events: Arc<EventQueue>,
    members: RwLock<Vec<Member>>,
    state: RwLock<LifecycleState>,
    config: SnapshotEngineConfig,
}

impl Snapshot {
    async fn new(diff_storage_path: PathBuf, limit: Sector, config: SnapshotEngineConfig) -> Result<Arc<Self>> {
        let events = Arc::new(EventQueue::new());
        let initial = config.diff_storage_minimum.min(limit.max(1));
        let diff_storage = Arc::new(
            DiffStorage::open_file(diff_storage_path, initial, config.diff_storage_minimum, events.clone())
                .await?,
        );
        diff_storage.set_limit(limit);
        diff_storage.spawn_reallocate_worker();

        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            diff_storage,
            events,
            members: RwLock::new(Vec::new()),
            state: RwLock::new(LifecycleState::Populated),
            config,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_taken(&self) -> bool {
        matches!(*self.state.read(), LifecycleState::Taken)
    }

    /// Attach a device whose tracker has already been installed. A device
    /// may only be added to one snapshot.
    pub fn add_device(&self, tracker: Arc<Tracker>) -> Result<()> {
        if matches!(*self.state.read(), LifecycleState::Taken) {
            return Err(SnapshotError::AlreadyTaken);
        }
        self.members.write().push(Member {
            tracker,
            image: RwLock::new(None),
        });
        Ok(())
    }

    /// Freeze every member device: install a fresh diff area per tracker,
    /// switch its CBT map, and mark the snapshot taken. Matches
    /// `spec.md` §4.5's `take` contract; queue freeze/unfreeze are modeled
    /// implicitly since readers/writers already serialize through each
    /// chunk's own lock.
    pub async fn take(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, LifecycleState::Taken) {
                return Err(SnapshotError::AlreadyTaken);
            }
            *state = LifecycleState::Taken;
        }

        let members = self.members.read().iter().map(|m| m.tracker.clone()).collect::<Vec<_>>();
        for tracker in members {
            let original = tracker.original().clone();
            let diff_area = DiffArea::new(original.clone(), self.diff_storage.clone(), self.events.clone(), &self.config);
            tracker.install_diff_area(diff_area.clone()).await?;
            tracker.cbt().switch();

            let image = Arc::new(SnapshotImage::new(original, diff_area, tracker.cbt().clone()));
            let members = self.members.read();
            if let Some(member) = members.iter().find(|m| Arc::ptr_eq(&m.tracker, &tracker)) {
                *member.image.write() = Some(image);
            }
        }
        Ok(())
    }

    /// The snapshot image bdev for a member device, once taken.
    pub fn image_for(&self, tracker: &Arc<Tracker>) -> Option<Arc<SnapshotImage>> {
        self.members
            .read()
            .iter()
            .find(|m| Arc::ptr_eq(&m.tracker, tracker))
            .and_then(|m| m.image.read().clone())
    }

    pub async fn wait_event(&self, timeout: Duration) -> Result<Event> {
        Ok(self.events.wait(timeout).await?)
    }

    /// Tear down every member's diff area and flip `snapshot_is_taken`
    /// back to false. Must be called before the last `Arc<Snapshot>` is
    /// dropped, since Rust has no async `Drop`.
    pub async fn destroy(&self) -> Result<()> {
        let members = self.members.read().iter().map(|m| m.tracker.clone()).collect::<Vec<_>>();
        for tracker in members {
            if let Some(area) = tracker.diff_area().await {
                area.flush_and_shutdown().await;
            }
            tracker.clear_diff_area().await;
        }
        for member in self.members.write().iter() {
            *member.image.write() = None;
        }
        self.diff_storage.shutdown();
        Ok(())
    }
}

/// Process-wide registry of live snapshots. Per `spec.md` §9, "Design
/// Notes", this is the engine's only piece of global mutable state.
pub struct SnapshotManager {
    snapshots: RwLock<HashMap<Uuid, Arc<Snapshot>>>,
    /// Devices reachable by the string id an external control surface
    /// addresses them with (`spec.md` §6's `device_id`-keyed opcodes).
    devices: RwLock<HashMap<String, Arc<Tracker>>>,
    config: SnapshotEngineConfig,
}

impl SnapshotManager {
    pub fn new(config: SnapshotEngineConfig) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Make a tracker reachable by `device_id` for the control-plane ops
    /// that address a device by name rather than by snapshot UUID.
    pub fn register_device(&self, device_id: impl Into<String>, tracker: Arc<Tracker>) {
        self.devices.write().insert(device_id.into(), tracker);
    }

    pub fn device(&self, device_id: &str) -> Result<Arc<Tracker>> {
        self.devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| SnapshotError::DeviceNotFound(device_id.to_string()))
    }

    /// Allocate a fresh UUID, diff storage, and event queue.
    pub async fn create(&self, diff_storage_path: PathBuf, limit: Sector) -> Result<Uuid> {
        let snapshot = Snapshot::new(diff_storage_path, limit, self.config).await?;
        let id = snapshot.id();
        self.snapshots.write().insert(id, snapshot);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<Snapshot>> {
        self.snapshots.read().get(&id).cloned().ok_or(SnapshotError::NotFound(id))
    }

    pub fn add_device(&self, id: Uuid, tracker: Arc<Tracker>) -> Result<()> {
        self.get(id)?.add_device(tracker)
    }

    pub async fn take(&self, id: Uuid) -> Result<()> {
        self.get(id)?.take().await
    }

    pub async fn wait_event(&self, id: Uuid, timeout: Duration) -> Result<Event> {
        self.get(id)?.wait_event(timeout).await
    }

    /// List live snapshot UUIDs.
    pub fn collect(&self) -> Vec<Uuid> {
        self.snapshots.read().keys().copied().collect()
    }

    pub async fn destroy(&self, id: Uuid) -> Result<()> {
        let snapshot = self.snapshots.write().remove(&id).ok_or(SnapshotError::NotFound(id))?;
        snapshot.destroy().await
    }
}

/// Attach a tracker to an original device, outside of any snapshot. The
/// resulting tracker can later be added to at most one snapshot.
pub fn attach_tracker(original: Arc<dyn BlockDevice>, config: &SnapshotEngineConfig) -> Arc<Tracker> {
    Arc::new(Tracker::attach(original, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    #[tokio::test]
    async fn full_lifecycle_create_add_take_destroy() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(SnapshotEngineConfig::default());

        let original = Arc::new(
            FileBackedBlockDevice::create(dir.path().join("orig.img"), crate::blockdev::SECTOR_SIZE * 64)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;
        original.write_at(0, &[0x5Au8; crate::blockdev::SECTOR_SIZE as usize]).await.unwrap();

        let id = manager
            .create(dir.path().join("diff.img"), 4096)
            .await
            .unwrap();
        let tracker = attach_tracker(original, &SnapshotEngineConfig::default());
        manager.add_device(id, tracker.clone()).unwrap();

        manager.take(id).await.unwrap();
        assert!(manager.get(id).unwrap().is_taken());

        let snapshot = manager.get(id).unwrap();
        let image = snapshot.image_for(&tracker).unwrap();
        let mut buf = [0u8; crate::blockdev::SECTOR_SIZE as usize];
        image.read_at(0, &mut buf).await.unwrap();
        assert_eq!(buf, [0x5Au8; crate::blockdev::SECTOR_SIZE as usize]);

        manager.destroy(id).await.unwrap();
        assert!(manager.get(id).is_err());
        assert!(!tracker.is_taken().await);
    }

    #[tokio::test]
    async fn adding_device_after_take_fails() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(SnapshotEngineConfig::default());
        let id = manager.create(dir.path().join("diff.img"), 4096).await.unwrap();
        manager.take(id).await.unwrap();

        let original = Arc::new(
            FileBackedBlockDevice::create(dir.path().join("orig2.img"), crate::blockdev::SECTOR_SIZE * 8)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;
        let tracker = attach_tracker(original, &SnapshotEngineConfig::default());
        let result = manager.add_device(id, tracker);
        assert!(matches!(result, Err(SnapshotError::AlreadyTaken)));
    }

    #[tokio::test]
    async fn collect_lists_live_snapshots() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(SnapshotEngineConfig::default());
        let a = manager.create(dir.path().join("a.img"), 4096).await.unwrap();
        let b = manager.create(dir.path().join("b.img"), 4096).await.unwrap();

        let mut ids = manager.collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
