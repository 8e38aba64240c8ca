//! Original-device I/O for the snapshot engine.

mod blockdev_trait;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{
    BlockDevice, BlockDeviceError, Result, Sector, SectorRange, SECTOR_SHIFT, SECTOR_SIZE,
};

/// A block device backed by a regular file or a raw block-device node.
///
/// Mirrors the behaviour the snapshot engine needs from an "original
/// device": fixed capacity, exclusive-open semantics, sector-addressed
/// reads and writes.
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    capacity_sectors: Sector,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new file-backed device of `size` bytes, truncating any
    /// existing contents.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            capacity_sectors: size / SECTOR_SIZE,
            read_only: false,
        })
    }

    /// Determine the size of a path that may be a regular file or a raw
    /// block device, using platform-specific ioctls for the latter.
    fn probe_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::probe_size_unix(path)
        }
        #[cfg(windows)]
        {
            Self::probe_size_windows(path)
        }
    }

    #[cfg(unix)]
    fn probe_size_unix(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 on Linux.
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    #[cfg(windows)]
    fn probe_size_windows(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::GetFileSizeEx;
        use winapi::um::winnt::LARGE_INTEGER;

        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let handle = file.as_raw_handle();
        let mut size: LARGE_INTEGER = unsafe { std::mem::zeroed() };

        unsafe {
            if GetFileSizeEx(handle as _, &mut size) != 0 {
                Ok(*size.QuadPart() as u64)
            } else {
                Ok(metadata.len())
            }
        }
    }

    /// Open an existing file or block device. Block devices must be opened
    /// exclusively by the caller; this type does not itself enforce
    /// `O_EXCL`.
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::probe_size(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            capacity_sectors: size / SECTOR_SIZE,
            read_only,
        })
    }

    /// Path this device is backed by.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(&self, start: Sector, buf_len: usize) -> Result<()> {
        if buf_len % self.logical_block_size() != 0 {
            return Err(BlockDeviceError::Misaligned(buf_len, self.logical_block_size()));
        }
        let count = buf_len as u64 / SECTOR_SIZE;
        if start + count > self.capacity_sectors {
            return Err(BlockDeviceError::OutOfBounds {
                start,
                count,
                capacity: self.capacity_sectors,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_at(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        self.validate(start, buf.len())?;

        let offset = start * SECTOR_SIZE;
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&self, start: Sector, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        self.validate(start, buf.len())?;

        let offset = start * SECTOR_SIZE;
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;
        Ok(())
    }

    fn capacity_sectors(&self) -> Sector {
        self.capacity_sectors
    }

    async fn sync(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.sync_all().await?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
