//! Asynchronous FAT16/FAT32 driver.
//!
//! The back-end of the server. It is deliberately written against the
//! [`DiskOps`] seam so its sector I/O can suspend the calling worker
//! coroutine — the reason a synchronous FAT library cannot sit here. The
//! driver keeps no sector cache: every FAT, directory and data access goes
//! straight through the adapter, which makes concurrent workers safe to
//! interleave at suspension points without shared buffer state.
//!
//! One [`FatVolume`] describes a mounted volume. Its geometry is immutable
//! after mount; the only shared mutable state is the free-cluster search
//! hint, kept in a `Cell` so concurrent allocations stay well-formed.

mod bpb;
mod dir;
mod file;
mod table;

pub use dir::{Attributes, DirEntryInfo, DirHandle};
pub use file::{FatFile, FileMode};

use std::cell::Cell;
use std::fmt;

use dir::DirStorage;

/// A failed block transport request, carrying the native status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskError(pub u32);

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block transport error (status {})", self.0)
    }
}

impl std::error::Error for DiskError {}

/// Sector-granular disk access, as the FAT driver sees it.
///
/// `buf` lengths are always a multiple of [`DiskOps::sector_size`]; the
/// implementation owns any re-shaping the real transport needs. Reads and
/// writes suspend the calling coroutine until the transfer completes.
///
/// The whole stack is single-threaded by construction, so the futures
/// carry no auto-trait bounds.
#[allow(async_fn_in_trait)]
pub trait DiskOps {
    /// Native sector size in bytes; a power of two.
    fn sector_size(&self) -> u32;

    /// Read `buf.len() / sector_size` sectors starting at `sector`.
    async fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DiskError>;

    /// Write `buf.len() / sector_size` sectors starting at `sector`.
    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DiskError>;

    /// Flush the device's volatile write state.
    async fn flush(&self) -> Result<(), DiskError>;
}

/// FAT driver errors.
///
/// The variants mirror the classic FAT library result vocabulary; the
/// numeric codes surface on the wire through `wire_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// A disk transfer failed; carries the transport status word.
    Disk(DiskError),
    /// On-disk structures are inconsistent (broken chain, bad FAT entry).
    Internal,
    /// The path's leaf does not exist.
    NoFile,
    /// An interior path component is missing or not a directory.
    NoPath,
    /// The name is syntactically invalid or too long.
    InvalidName,
    /// The operation is denied: read-only file, non-empty directory,
    /// volume full, or an object of the wrong kind.
    Denied,
    /// The target of a create or rename already exists.
    Exists,
    /// The boot sector does not describe a usable FAT16/FAT32 volume.
    NoFilesystem,
    /// A parameter is out of range for the volume.
    InvalidParameter,
    /// The file was opened without read permission.
    ReadDenied,
    /// The file was opened without write permission.
    WriteDenied,
    /// The directory cannot hold another entry.
    DirectoryFull,
}

impl From<DiskError> for FatError {
    fn from(e: DiskError) -> FatError {
        FatError::Disk(e)
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatError::Disk(e) => write!(f, "{e}"),
            FatError::Internal => write!(f, "inconsistent filesystem structures"),
            FatError::NoFile => write!(f, "no such file"),
            FatError::NoPath => write!(f, "no such path"),
            FatError::InvalidName => write!(f, "invalid name"),
            FatError::Denied => write!(f, "operation denied"),
            FatError::Exists => write!(f, "already exists"),
            FatError::NoFilesystem => write!(f, "not a FAT volume"),
            FatError::InvalidParameter => write!(f, "parameter out of range"),
            FatError::ReadDenied => write!(f, "file not opened for reading"),
            FatError::WriteDenied => write!(f, "file not opened for writing"),
            FatError::DirectoryFull => write!(f, "directory full"),
        }
    }
}

impl std::error::Error for FatError {}

/// FAT flavour, decided by the data-cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatType {
    Fat16,
    Fat32,
}

/// A mounted FAT volume.
pub struct FatVolume {
    pub(crate) kind: FatType,
    pub(crate) bytes_per_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) fat_start: u64,
    pub(crate) sectors_per_fat: u32,
    pub(crate) fat_count: u32,
    /// First sector of the fixed FAT16 root directory (0 on FAT32).
    pub(crate) root_start: u64,
    /// Entry capacity of the fixed FAT16 root directory (0 on FAT32).
    pub(crate) root_entries: u32,
    /// Root directory cluster (FAT32 only).
    pub(crate) root_cluster: u32,
    /// First sector of the data area (cluster 2).
    pub(crate) data_start: u64,
    /// Number of data clusters.
    pub(crate) cluster_count: u32,
    /// Rolling free-cluster search hint.
    pub(crate) next_free: Cell<u32>,
}

impl FatVolume {
    /// Mount the volume found in sector 0 of `disk`.
    pub async fn mount(disk: &impl DiskOps) -> Result<FatVolume, FatError> {
        let sector_size = disk.sector_size();
        let mut boot = vec![0u8; sector_size as usize];
        disk.read(0, &mut boot).await?;
        let layout = bpb::layout(&boot)?;
        if layout.bytes_per_sector != sector_size {
            // the volume was formatted for a different sector size than
            // the transport reports; nothing sensible can be done with it
            log::warn!(
                "volume sector size {} does not match device sector size {}",
                layout.bytes_per_sector,
                sector_size
            );
            return Err(FatError::NoFilesystem);
        }
        log::debug!(
            "mounted {:?}: {} clusters of {} bytes",
            layout.kind,
            layout.cluster_count,
            layout.bytes_per_sector * layout.sectors_per_cluster
        );
        Ok(FatVolume {
            kind: layout.kind,
            bytes_per_sector: layout.bytes_per_sector,
            sectors_per_cluster: layout.sectors_per_cluster,
            fat_start: layout.fat_start,
            sectors_per_fat: layout.sectors_per_fat,
            fat_count: layout.fat_count,
            root_start: layout.root_start,
            root_entries: layout.root_entries,
            root_cluster: layout.root_cluster,
            data_start: layout.data_start,
            cluster_count: layout.cluster_count,
            next_free: Cell::new(2),
        })
    }

    /// Flush the device ahead of releasing the volume.
    pub async fn unmount(&self, disk: &impl DiskOps) -> Result<(), FatError> {
        disk.flush().await?;
        Ok(())
    }

    /// The volume's sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        self.bytes_per_sector
    }

    /// Bytes per cluster.
    pub(crate) fn cluster_bytes(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// First device sector of a data cluster.
    pub(crate) fn cluster_first_sector(&self, cluster: u32) -> u64 {
        self.data_start + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster)
    }

    /// Highest valid cluster number.
    pub(crate) fn max_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    /// Where the root directory's entries live.
    pub(crate) fn root_dir(&self) -> DirStorage {
        match self.kind {
            FatType::Fat16 => DirStorage::Root16,
            FatType::Fat32 => DirStorage::Chain(self.root_cluster),
        }
    }
}

impl fmt::Debug for FatVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatVolume")
            .field("kind", &self.kind)
            .field("bytes_per_sector", &self.bytes_per_sector)
            .field("sectors_per_cluster", &self.sectors_per_cluster)
            .field("cluster_count", &self.cluster_count)
            .finish()
    }
}
