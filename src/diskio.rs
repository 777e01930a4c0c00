//! The disk I/O adapter.
//!
//! Implements the FAT driver's [`DiskOps`] downcalls on top of the block
//! transport. The driver thinks in native sectors; the transport accepts
//! only whole transfer units at aligned offsets. The adapter widens each
//! request to the covering aligned extent, stages it in the calling
//! worker's private bounce window, and suspends the worker until the
//! dispatcher delivers the transport's completion status through the
//! pool's argument word.
//!
//! Writes that are not aligned on both ends first read the covering
//! extent, patch the caller's bytes into it, and write it back; if the
//! covering read fails its status is surfaced and the write is never
//! issued. Errors are returned verbatim and never retried here.

use std::rc::Rc;

use crate::fat::{DiskError, DiskOps};
use crate::ll::blk::{BLK_RESP_ERROR, BLK_RESP_OK, BLK_TRANSFER_SIZE, BlkOp};
use crate::pool::CoroHandle;
use crate::server::Server;

/// Compute the covering aligned extent of `count` sectors at `sector`,
/// with `spt` sectors per transfer unit. Returns the first transfer unit
/// and the unit count.
///
/// The middle term can go negative when an unaligned request sits inside
/// a single transfer unit; Euclidean division keeps the correction exact
/// before the head/tail units are added back.
pub(crate) fn aligned_extent(sector: u64, count: u64, spt: u64) -> (u64, u64) {
    if spt <= 1 {
        return (sector, count);
    }
    let head = (spt - sector % spt) % spt;
    let tail = (sector + count) % spt;
    let middle = count as i64 - head as i64 - tail as i64;
    let mut units = middle.div_euclid(spt as i64);
    if head != 0 {
        units += 1;
    }
    if tail != 0 {
        units += 1;
    }
    (sector / spt, units as u64)
}

/// One worker's view of the disk. Owns nothing; borrows the transport,
/// the bounce window and the suspension machinery from the server.
pub(crate) struct BlockDisk {
    server: Rc<Server>,
    handle: CoroHandle,
}

impl BlockDisk {
    pub(crate) fn new(server: Rc<Server>, handle: CoroHandle) -> BlockDisk {
        BlockDisk { server, handle }
    }

    /// Start of this worker's bounce window in the block data region.
    fn bounce_off(&self) -> u64 {
        u64::from(self.handle.get() - 1) * self.server.bounce_window()
    }

    /// Enqueue one transport request tagged with this worker's handle,
    /// raise the pending-notify flag, and suspend until the completion
    /// status lands in the argument word.
    async fn submit(&self, op: BlkOp, sector: u64, units: u64) -> Result<(), DiskError> {
        let count = u16::try_from(units).map_err(|_| DiskError(BLK_RESP_ERROR))?;
        log::trace!(
            "blk enqueue {:?}: unit {} count {} id {}",
            op,
            sector,
            count,
            self.handle.get()
        );
        self.server
            .blk
            .enqueue_req(op, self.bounce_off(), sector, count, self.handle.get())
            .map_err(|_| DiskError(BLK_RESP_ERROR))?;
        self.server.blk_requests_pushed.set(true);
        self.server.pool.wait(self.handle).await;
        let status = self.server.pool.arg(self.handle) as u32;
        if status == BLK_RESP_OK {
            Ok(())
        } else {
            Err(DiskError(status))
        }
    }

    fn check_window(&self, units: u64) -> Result<(), DiskError> {
        if units * BLK_TRANSFER_SIZE <= self.server.bounce_window() {
            Ok(())
        } else {
            log::error!("transfer of {units} units exceeds the bounce window");
            Err(DiskError(BLK_RESP_ERROR))
        }
    }
}

impl DiskOps for BlockDisk {
    fn sector_size(&self) -> u32 {
        u32::from(self.server.blk_info.sector_size())
    }

    async fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        let sector_size = u64::from(self.sector_size());
        debug_assert_eq!(buf.len() as u64 % sector_size, 0);
        let count = buf.len() as u64 / sector_size;
        if count == 0 {
            return Ok(());
        }
        let spt = BLK_TRANSFER_SIZE / sector_size;
        let (unit, units) = aligned_extent(sector, count, spt);
        self.check_window(units)?;
        self.submit(BlkOp::Read, unit, units).await?;
        let skew = sector % spt * sector_size;
        self.server
            .blk_data
            .read(self.bounce_off() + skew, buf)
            .map_err(|_| DiskError(BLK_RESP_ERROR))?;
        Ok(())
    }

    async fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DiskError> {
        let sector_size = u64::from(self.sector_size());
        debug_assert_eq!(buf.len() as u64 % sector_size, 0);
        let count = buf.len() as u64 / sector_size;
        if count == 0 {
            return Ok(());
        }
        let stage = |at: u64| {
            self.server
                .blk_data
                .write(self.bounce_off() + at, buf)
                .map_err(|_| DiskError(BLK_RESP_ERROR))
        };
        if sector_size == BLK_TRANSFER_SIZE {
            self.check_window(count)?;
            stage(0)?;
            return self.submit(BlkOp::Write, sector, count).await;
        }
        let spt = BLK_TRANSFER_SIZE / sector_size;
        let (unit, units) = aligned_extent(sector, count, spt);
        self.check_window(units)?;
        let head = (spt - sector % spt) % spt;
        let tail = (sector + count) % spt;
        if head == 0 && tail == 0 {
            stage(0)?;
        } else {
            // read-modify-write: fetch the covering extent, then patch the
            // caller's sectors into place at their skew
            self.submit(BlkOp::Read, unit, units).await?;
            stage(sector % spt * sector_size)?;
        }
        self.submit(BlkOp::Write, unit, units).await
    }

    async fn flush(&self) -> Result<(), DiskError> {
        self.submit(BlkOp::Flush, 0, 0).await
    }
}

impl std::fmt::Debug for BlockDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDisk").field("handle", &self.handle.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::aligned_extent;

    #[test]
    fn unaligned_read_collapses_to_one_covering_extent() {
        // 512-byte sectors in 4096-byte units: sectors 7..10 straddle the
        // first unit boundary and need exactly units 0 and 1
        assert_eq!(aligned_extent(7, 3, 8), (0, 2));
    }

    #[test]
    fn aligned_requests_need_no_correction() {
        assert_eq!(aligned_extent(0, 8, 8), (0, 1));
        assert_eq!(aligned_extent(8, 8, 8), (1, 1));
        assert_eq!(aligned_extent(16, 24, 8), (2, 3));
    }

    #[test]
    fn single_unit_straddle_goes_negative_internally() {
        // interior range: head and tail corrections overlap in one unit
        assert_eq!(aligned_extent(1, 2, 8), (0, 1));
        assert_eq!(aligned_extent(9, 6, 8), (1, 1));
    }

    #[test]
    fn unit_sized_sectors_pass_through() {
        assert_eq!(aligned_extent(5, 3, 1), (5, 3));
    }

    #[test]
    fn extent_covers_and_is_tight() {
        for spt in [1u64, 2, 4, 8] {
            for sector in 0..40 {
                for count in 1..40 {
                    let (unit, units) = aligned_extent(sector, count, spt);
                    let lo = unit * spt;
                    let hi = (unit + units) * spt;
                    assert!(lo <= sector, "low cover {sector},{count},{spt}");
                    assert!(hi >= sector + count, "high cover {sector},{count},{spt}");
                    assert!(lo + spt > sector, "low tight {sector},{count},{spt}");
                    assert!(hi - spt < sector + count, "high tight {sector},{count},{spt}");
                }
            }
        }
    }
}
