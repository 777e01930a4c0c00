//! File handles and byte-granular file I/O.
//!
//! A [`FatFile`] owns its cursor and the location of its directory entry;
//! all shared volume state stays in [`FatVolume`]. Reads and writes move
//! through the disk adapter in cluster-bounded sector spans, with
//! read-modify-write for partially covered sectors. Metadata changes are
//! held in the handle (`dirty`) until `sync` rewrites the directory entry.

use super::dir::{Attributes, DirStorage};
use super::{DiskOps, FatError, FatVolume};

bitflags::bitflags! {
    /// Access granted at open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// An open file.
#[derive(Debug)]
pub struct FatFile {
    pub(crate) mode: FileMode,
    /// First data cluster; 0 while the file is empty.
    pub(crate) start_cluster: u32,
    pub(crate) size: u32,
    pub(crate) parent: DirStorage,
    pub(crate) entry_index: u32,
    /// Byte cursor.
    pub(crate) pos: u32,
    /// Cached cluster covering `cluster_pos`; 0 when invalid.
    pub(crate) cur_cluster: u32,
    /// Byte offset at which `cur_cluster` begins.
    pub(crate) cluster_pos: u32,
    pub(crate) dirty: bool,
}

impl FatFile {
    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        u64::from(self.size)
    }

    fn invalidate_cache(&mut self) {
        self.cur_cluster = 0;
        self.cluster_pos = 0;
    }
}

impl FatVolume {
    /// Open `path`, creating it when `create` is set and the leaf is
    /// missing (open-or-create; an existing file is opened untouched).
    pub(crate) async fn open(
        &self,
        disk: &impl DiskOps,
        path: &str,
        mode: FileMode,
        create: bool,
    ) -> Result<FatFile, FatError> {
        match self.lookup(disk, path).await {
            Ok(info) => {
                if info.is_root() || info.is_dir() {
                    return Err(FatError::Denied);
                }
                if info.attr.contains(Attributes::READ_ONLY) && mode.contains(FileMode::WRITE) {
                    return Err(FatError::Denied);
                }
                Ok(FatFile {
                    mode,
                    start_cluster: info.first_cluster,
                    size: info.size,
                    parent: info.parent,
                    entry_index: info.entry_index,
                    pos: 0,
                    cur_cluster: 0,
                    cluster_pos: 0,
                    dirty: false,
                })
            }
            Err(FatError::NoFile) if create => {
                let (parent, leaf) = self.resolve_parent(disk, path).await?;
                let entry_index = self
                    .create_entry(disk, parent, leaf, Attributes::ARCHIVE, 0, 0)
                    .await?;
                Ok(FatFile {
                    mode,
                    start_cluster: 0,
                    size: 0,
                    parent,
                    entry_index,
                    pos: 0,
                    cur_cluster: 0,
                    cluster_pos: 0,
                    dirty: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// The cluster covering byte `pos`, walking (and optionally growing)
    /// the chain from the handle's cached position.
    async fn cluster_for_pos(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
        pos: u32,
        extend: bool,
    ) -> Result<u32, FatError> {
        if file.start_cluster == 0 {
            return Err(FatError::Internal);
        }
        let cb = self.cluster_bytes();
        let target = pos / cb;
        let (mut index, mut cluster) = if file.cur_cluster != 0 && file.cluster_pos / cb <= target {
            (file.cluster_pos / cb, file.cur_cluster)
        } else {
            (0, file.start_cluster)
        };
        while index < target {
            match self.next_cluster(disk, cluster).await? {
                Some(next) => cluster = next,
                None if extend => {
                    let fresh = self.alloc_cluster(disk, Some(cluster)).await?;
                    self.zero_cluster(disk, fresh).await?;
                    cluster = fresh;
                }
                None => return Err(FatError::Internal),
            }
            index += 1;
        }
        file.cur_cluster = cluster;
        file.cluster_pos = target * cb;
        Ok(cluster)
    }

    async fn read_cluster_range(
        &self,
        disk: &impl DiskOps,
        cluster: u32,
        offset: u32,
        out: &mut [u8],
    ) -> Result<(), FatError> {
        let bps = self.bytes_per_sector;
        let first = offset / bps;
        let last = (offset + out.len() as u32 - 1) / bps;
        let mut span = vec![0u8; ((last - first + 1) * bps) as usize];
        disk.read(self.cluster_first_sector(cluster) + u64::from(first), &mut span)
            .await?;
        let at = (offset - first * bps) as usize;
        out.copy_from_slice(&span[at..at + out.len()]);
        Ok(())
    }

    async fn write_cluster_range(
        &self,
        disk: &impl DiskOps,
        cluster: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FatError> {
        let bps = self.bytes_per_sector;
        let sector = self.cluster_first_sector(cluster) + u64::from(offset / bps);
        if offset % bps == 0 && data.len() % bps as usize == 0 {
            disk.write(sector, data).await?;
            return Ok(());
        }
        // partially covered sectors: read the span, patch, write it back
        let first = offset / bps;
        let last = (offset + data.len() as u32 - 1) / bps;
        let mut span = vec![0u8; ((last - first + 1) * bps) as usize];
        let base = self.cluster_first_sector(cluster) + u64::from(first);
        disk.read(base, &mut span).await?;
        let at = (offset - first * bps) as usize;
        span[at..at + data.len()].copy_from_slice(data);
        disk.write(base, &span).await?;
        Ok(())
    }

    /// Position the cursor. Seeking past the end of a writable file grows
    /// it with zeroed clusters; on a read-only handle the seek clamps.
    pub(crate) async fn seek(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
        offset: u64,
    ) -> Result<(), FatError> {
        if offset > u64::from(u32::MAX) {
            return Err(FatError::InvalidParameter);
        }
        let mut offset = offset as u32;
        if offset > file.size {
            if !file.mode.contains(FileMode::WRITE) {
                offset = file.size;
            } else {
                if file.start_cluster == 0 {
                    let first = self.alloc_cluster(disk, None).await?;
                    self.zero_cluster(disk, first).await?;
                    file.start_cluster = first;
                    file.cur_cluster = first;
                    file.cluster_pos = 0;
                }
                self.cluster_for_pos(disk, file, offset - 1, true).await?;
                file.size = offset;
                file.dirty = true;
            }
        }
        file.pos = offset;
        if file.cur_cluster != 0 && file.cluster_pos > file.pos {
            file.invalidate_cache();
        }
        Ok(())
    }

    /// Read from the cursor; short counts only at end of file.
    pub(crate) async fn read(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
        buf: &mut [u8],
    ) -> Result<usize, FatError> {
        if !file.mode.contains(FileMode::READ) {
            return Err(FatError::ReadDenied);
        }
        if file.pos >= file.size || buf.is_empty() {
            return Ok(0);
        }
        let cb = self.cluster_bytes();
        let total = buf.len().min((file.size - file.pos) as usize);
        let mut done = 0;
        while done < total {
            let cluster = self.cluster_for_pos(disk, file, file.pos, false).await?;
            let offset = file.pos % cb;
            let run = ((cb - offset) as usize).min(total - done);
            self.read_cluster_range(disk, cluster, offset, &mut buf[done..done + run])
                .await?;
            file.pos += run as u32;
            done += run;
        }
        Ok(total)
    }

    /// Write at the cursor, extending the chain and the recorded size as
    /// needed.
    pub(crate) async fn write(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
        buf: &[u8],
    ) -> Result<usize, FatError> {
        if !file.mode.contains(FileMode::WRITE) {
            return Err(FatError::WriteDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if u64::from(file.pos) + buf.len() as u64 > u64::from(u32::MAX) {
            return Err(FatError::InvalidParameter);
        }
        if file.start_cluster == 0 {
            let first = self.alloc_cluster(disk, None).await?;
            self.zero_cluster(disk, first).await?;
            file.start_cluster = first;
            file.cur_cluster = first;
            file.cluster_pos = 0;
        }
        let cb = self.cluster_bytes();
        let mut done = 0;
        while done < buf.len() {
            let cluster = self.cluster_for_pos(disk, file, file.pos, true).await?;
            let offset = file.pos % cb;
            let run = ((cb - offset) as usize).min(buf.len() - done);
            self.write_cluster_range(disk, cluster, offset, &buf[done..done + run])
                .await?;
            file.pos += run as u32;
            done += run;
            if file.pos > file.size {
                file.size = file.pos;
            }
        }
        file.dirty = true;
        Ok(buf.len())
    }

    /// Cut the file at the cursor, freeing the tail of the chain.
    pub(crate) async fn truncate(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
    ) -> Result<(), FatError> {
        if !file.mode.contains(FileMode::WRITE) {
            return Err(FatError::WriteDenied);
        }
        if file.pos >= file.size {
            return Ok(());
        }
        if file.pos == 0 {
            if file.start_cluster != 0 {
                self.free_chain(disk, file.start_cluster).await?;
                file.start_cluster = 0;
            }
            file.invalidate_cache();
        } else {
            let last = self.cluster_for_pos(disk, file, file.pos - 1, false).await?;
            let tail = self.next_cluster(disk, last).await?;
            self.set_fat_entry(disk, last, self.eoc()).await?;
            if let Some(tail) = tail {
                self.free_chain(disk, tail).await?;
            }
        }
        file.size = file.pos;
        file.dirty = true;
        Ok(())
    }

    /// Push the handle's metadata into its directory entry and flush the
    /// device.
    pub(crate) async fn sync(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
    ) -> Result<(), FatError> {
        if file.dirty {
            self.update_entry(disk, file.parent, file.entry_index, file.start_cluster, file.size)
                .await?;
            file.dirty = false;
        }
        disk.flush().await?;
        Ok(())
    }

    /// Close is sync; the handle is dropped by the caller on success.
    pub(crate) async fn close(
        &self,
        disk: &impl DiskOps,
        file: &mut FatFile,
    ) -> Result<(), FatError> {
        self.sync(disk, file).await
    }
}
