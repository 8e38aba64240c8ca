//! Block-device snapshots with copy-on-write semantics and change-block
//! tracking.
//!
//! Intercepts writes to "original" block devices, preserves pre-write
//! contents in a separate diff area, and exposes each frozen snapshot as a
//! virtual read/write block device whose contents reflect the original at
//! the moment the snapshot was taken. See the individual modules for the
//! pipeline each write and read passes through:
//! [`tracker`] intercepts, [`diff_area`] and [`chunk`] preserve, and
//! [`snapshot_image`] serves the frozen view.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdev;
pub mod cbt;
pub mod chunk;
pub mod config;
pub mod control;
pub mod diff_area;
pub mod diff_storage;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod snapshot_image;
pub mod tracker;

pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, Sector, SectorRange};
pub use config::SnapshotEngineConfig;
pub use error::{Error, Result};
pub use event::{Event, EventQueue};
pub use snapshot::{attach_tracker, Snapshot, SnapshotManager};
pub use snapshot_image::SnapshotImage;
pub use tracker::Tracker;

/// Commonly used types for a binary embedding this engine.
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, Sector, SectorRange};
    pub use crate::config::SnapshotEngineConfig;
    pub use crate::control::ControlPlane;
    pub use crate::error::{Error, Result};
    pub use crate::event::Event;
    pub use crate::snapshot::{attach_tracker, Snapshot, SnapshotManager};
}
