//! Crate-wide error taxonomy.
//!
//! Every module defines its own `thiserror` error enum for its failure
//! modes; this type aggregates them into the error kinds a caller actually
//! needs to branch on.

use std::fmt;
use std::io;

use crate::blockdev::BlockDeviceError;
use crate::cbt::CbtError;
use crate::chunk::ChunkError;
use crate::diff_storage::DiffStorageError;
use crate::snapshot::SnapshotError;
use crate::tracker::TrackerError;

#[derive(Debug)]
pub enum Error {
    /// Unknown snapshot UUID or tracker device id.
    NotFound(String),
    /// Adding the same device twice, or a name collision.
    AlreadyExists(String),
    /// Malformed input.
    InvalidArg(String),
    /// Chunk lock contended under NOWAIT.
    Again,
    /// Diff storage is full.
    NoSpace,
    /// Underlying read/write failure.
    Io(io::Error),
    /// An interruptible wait returned early.
    Interrupted,
    /// The diff area (or its snapshot) is corrupted and no longer usable.
    Corrupted(String),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::AlreadyExists(what) => write!(f, "already exists: {}", what),
            Error::InvalidArg(msg) => write!(f, "invalid argument: {}", msg),
            Error::Again => write!(f, "resource temporarily unavailable"),
            Error::NoSpace => write!(f, "diff storage exhausted"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::Corrupted(msg) => write!(f, "corrupted: {}", msg),
            Error::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<BlockDeviceError> for Error {
    fn from(err: BlockDeviceError) -> Self {
        match err {
            BlockDeviceError::Io(e) => Error::Io(e),
            BlockDeviceError::ReadOnly => Error::InvalidArg("device is read-only".into()),
            BlockDeviceError::DeviceClosed => Error::Other("device is already closed".into()),
            other @ (BlockDeviceError::OutOfBounds { .. } | BlockDeviceError::Misaligned(_, _)) => {
                Error::InvalidArg(other.to_string())
            }
        }
    }
}

impl From<ChunkError> for Error {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::WouldBlock => Error::Again,
            ChunkError::Io(e) => Error::Io(e),
            ChunkError::Failed => Error::Corrupted("chunk failed".into()),
            ChunkError::NoSpace => Error::NoSpace,
            ChunkError::BlockDevice(e) => Error::from(e),
        }
    }
}

impl From<DiffStorageError> for Error {
    fn from(err: DiffStorageError) -> Self {
        match err {
            DiffStorageError::NoSpace => Error::NoSpace,
            DiffStorageError::Io(e) => Error::Io(e),
            DiffStorageError::InvalidArg(msg) => Error::InvalidArg(msg),
            DiffStorageError::BlockDevice(e) => Error::from(e),
        }
    }
}

impl From<CbtError> for Error {
    fn from(err: CbtError) -> Self {
        match err {
            CbtError::OutOfRange => Error::InvalidArg("sector range outside device capacity".into()),
            CbtError::Corrupted => Error::Corrupted("CBT map corrupted".into()),
        }
    }
}

impl From<TrackerError> for Error {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Again => Error::Again,
            TrackerError::AlreadyAttached => Error::AlreadyExists("tracker already attached".into()),
            TrackerError::NotAttached => Error::NotFound("tracker not attached".into()),
            TrackerError::Chunk(e) => Error::from(e),
            TrackerError::BlockDevice(e) => Error::from(e),
            TrackerError::Cbt(e) => Error::from(e),
        }
    }
}

impl From<SnapshotError> for Error {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::NotFound(id) => Error::NotFound(format!("snapshot {}", id)),
            SnapshotError::DeviceAlreadyTracked => {
                Error::AlreadyExists("device already belongs to a snapshot".into())
            }
            SnapshotError::AlreadyTaken => Error::InvalidArg("snapshot already taken".into()),
            SnapshotError::NotTaken => Error::InvalidArg("snapshot not taken yet".into()),
            SnapshotError::Interrupted => Error::Interrupted,
            SnapshotError::DeviceNotFound(id) => Error::NotFound(format!("device {}", id)),
            SnapshotError::DiffStorage(e) => Error::from(e),
            SnapshotError::Tracker(e) => Error::from(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
