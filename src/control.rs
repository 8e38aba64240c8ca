//! Control-surface payloads.
//!
//! `spec.md` §1 places "the control transport (ioctl/character-device
//! surface), argument marshalling, user-space CLI and examples" outside
//! this engine's scope. This module carries only the data shapes each
//! opcode in §6 exchanges, plus a [`ControlPlane`] trait an external
//! transport can implement against — no ioctl numbers, no wire framing.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockdev::Sector;
use crate::error::Result;
use crate::event::Event;
use crate::snapshot::{SnapshotError, SnapshotManager};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionInfo {
    pub major: u16,
    pub minor: u16,
    pub rev: u16,
    pub build: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateArgs {
    pub diff_storage_path: String,
    pub limit_sectors: Sector,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotCreateReply {
    pub id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotTakeArgs {
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCollectReply {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotWaitEventArgs {
    pub id: Uuid,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWaitEventReply {
    pub event: Option<Event>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CbtInfoReply {
    pub device_capacity: Sector,
    pub block_size: u32,
    pub block_count: u64,
    pub generation_id: Uuid,
    pub changes_number: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CbtMapArgs {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtMapReply {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtDirtyArgs {
    pub ranges: Vec<(Sector, Sector)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotAddArgs {
    pub snapshot_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfoReply {
    pub error_code: i32,
    pub image_name: String,
}

/// The operation set an external control transport (character device,
/// gRPC, whatever the host chooses) drives against the engine. Each
/// method corresponds to one opcode in `spec.md` §6; this crate supplies
/// only the implementation behind the trait, not the transport.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn version(&self) -> VersionInfo;

    async fn snapshot_create(&self, args: SnapshotCreateArgs) -> Result<SnapshotCreateReply>;
    async fn snapshot_destroy(&self, id: Uuid) -> Result<()>;
    async fn snapshot_take(&self, args: SnapshotTakeArgs) -> Result<()>;
    async fn snapshot_collect(&self) -> SnapshotCollectReply;
    async fn snapshot_wait_event(&self, args: SnapshotWaitEventArgs) -> Result<SnapshotWaitEventReply>;
    async fn snapshot_add(&self, device_id: &str, args: SnapshotAddArgs) -> Result<()>;
    async fn snapshot_info(&self, device_id: &str) -> Result<SnapshotInfoReply>;

    async fn cbt_info(&self, device_id: &str) -> Result<CbtInfoReply>;
    async fn cbt_map(&self, device_id: &str, args: CbtMapArgs) -> Result<CbtMapReply>;
    async fn cbt_dirty(&self, device_id: &str, args: CbtDirtyArgs) -> Result<()>;
}

/// [`SnapshotManager`] is the engine's control plane: snapshot-lifecycle
/// opcodes map directly onto its own methods, and device-addressed opcodes
/// (`CBT_*`, `SNAPSHOT_ADD`, `SNAPSHOT_INFO`) look the device up in its
/// registry and delegate to the matching [`crate::tracker::Tracker`]
/// method, which serializes them through that tracker's control mutex.
#[async_trait]
impl ControlPlane for SnapshotManager {
    async fn version(&self) -> VersionInfo {
        VersionInfo { major: 0, minor: 1, rev: 0, build: 0 }
    }

    async fn snapshot_create(&self, args: SnapshotCreateArgs) -> Result<SnapshotCreateReply> {
        let id = self.create(PathBuf::from(args.diff_storage_path), args.limit_sectors).await?;
        Ok(SnapshotCreateReply { id })
    }

    async fn snapshot_destroy(&self, id: Uuid) -> Result<()> {
        self.destroy(id).await?;
        Ok(())
    }

    async fn snapshot_take(&self, args: SnapshotTakeArgs) -> Result<()> {
        self.take(args.id).await?;
        Ok(())
    }

    async fn snapshot_collect(&self) -> SnapshotCollectReply {
        SnapshotCollectReply { ids: self.collect() }
    }

    async fn snapshot_wait_event(&self, args: SnapshotWaitEventArgs) -> Result<SnapshotWaitEventReply> {
        match self.wait_event(args.id, Duration::from_millis(args.timeout_ms)).await {
            Ok(event) => Ok(SnapshotWaitEventReply { event: Some(event) }),
            Err(SnapshotError::Interrupted) => Ok(SnapshotWaitEventReply { event: None }),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot_add(&self, device_id: &str, args: SnapshotAddArgs) -> Result<()> {
        let tracker = self.device(device_id)?;
        self.add_device(args.snapshot_id, tracker)?;
        Ok(())
    }

    async fn snapshot_info(&self, device_id: &str) -> Result<SnapshotInfoReply> {
        let tracker = self.device(device_id)?;
        let taken = tracker.is_taken().await;
        Ok(SnapshotInfoReply {
            error_code: if taken { 0 } else { -1 },
            image_name: if taken { format!("{device_id}-image") } else { String::new() },
        })
    }

    async fn cbt_info(&self, device_id: &str) -> Result<CbtInfoReply> {
        Ok(self.device(device_id)?.cbt_info().await)
    }

    async fn cbt_map(&self, device_id: &str, args: CbtMapArgs) -> Result<CbtMapReply> {
        Ok(self.device(device_id)?.cbt_map(args.offset, args.length).await)
    }

    async fn cbt_dirty(&self, device_id: &str, args: CbtDirtyArgs) -> Result<()> {
        self.device(device_id)?.cbt_dirty(&args.ranges).await?;
        Ok(())
    }
}
