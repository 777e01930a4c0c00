//! Server state: descriptor tables and per-worker request records.
//!
//! All module-level state of the original design lives in one [`Server`]
//! value owned by the event dispatcher and shared with worker futures.
//! Descriptor tables are fixed parallel arrays — a status word plus an
//! object slot per descriptor — so descriptors are stable small integers
//! and the server allocates nothing per command. Interior mutability is
//! cell-grained: status words are `Cell`s, objects sit behind `RefCell`s
//! that workers hold across their disk suspensions, which is precisely
//! what turns a concurrent command on a busy descriptor into a clean
//! `OUTSTANDING_OPERATIONS` failure instead of shared-state corruption.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::fat::{DirHandle, FatFile, FatVolume};
use crate::ll::blk::{BlkQueueHandle, BlkStorageInfo};
use crate::ll::protocol::CmplData;
use crate::ll::queue::FsQueue;
use crate::pool::{CoroHandle, CoroPool};
use crate::shm::DataRegion;
use crate::{MAX_OPEN_DIRS, MAX_OPEN_FILES, MAX_VOLUMES, WORKER_COUNT};

/// Descriptor slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescStatus {
    Free,
    InUse,
    /// Transient marker around a close/unmount call; rejects a concurrent
    /// second close of the same descriptor.
    Cleanup,
}

/// A fixed table of descriptors: parallel status and object arrays,
/// first-free allocation.
pub(crate) struct DescTable<T, const N: usize> {
    status: [Cell<DescStatus>; N],
    objs: [RefCell<Option<T>>; N],
}

impl<T, const N: usize> DescTable<T, N> {
    fn new() -> DescTable<T, N> {
        DescTable {
            status: [(); N].map(|_| Cell::new(DescStatus::Free)),
            objs: [(); N].map(|_| RefCell::new(None)),
        }
    }

    /// Index of the first free slot.
    pub(crate) fn find_free(&self) -> Option<usize> {
        self.status.iter().position(|s| s.get() == DescStatus::Free)
    }

    pub(crate) fn status(&self, index: usize) -> DescStatus {
        self.status[index].get()
    }

    pub(crate) fn set_status(&self, index: usize, status: DescStatus) {
        self.status[index].set(status);
    }

    /// Map a wire descriptor to a table index, requiring an in-use slot.
    pub(crate) fn validate(&self, fd: u64) -> Option<usize> {
        let index = usize::try_from(fd).ok()?;
        if index < N && self.status[index].get() == DescStatus::InUse {
            Some(index)
        } else {
            None
        }
    }

    pub(crate) fn obj(&self, index: usize) -> &RefCell<Option<T>> {
        &self.objs[index]
    }
}

/// One worker's request record: the command identity captured at dispatch
/// and the result captured at completion, read back by the event loop.
pub(crate) struct RequestRecord {
    pub(crate) id: Cell<u64>,
    pub(crate) cmd: Cell<u64>,
    pub(crate) status: Cell<u64>,
    pub(crate) data: Cell<CmplData>,
    pub(crate) in_use: Cell<bool>,
}

impl RequestRecord {
    fn new() -> RequestRecord {
        RequestRecord {
            id: Cell::new(0),
            cmd: Cell::new(0),
            status: Cell::new(0),
            data: Cell::new(CmplData::zeroed()),
            in_use: Cell::new(false),
        }
    }

    pub(crate) fn assign(&self, id: u64, cmd: u64) {
        self.id.set(id);
        self.cmd.set(cmd);
        self.status.set(0);
        self.data.set(CmplData::zeroed());
        self.in_use.set(true);
    }

    pub(crate) fn complete(&self, status: u64, data: CmplData) {
        self.status.set(status);
        self.data.set(data);
    }
}

/// The server: every piece of state the dispatcher and the workers share.
pub struct Server {
    pub(crate) pool: Rc<CoroPool>,
    pub(crate) cmd_queue: Rc<FsQueue>,
    pub(crate) cmpl_queue: Rc<FsQueue>,
    pub(crate) blk: BlkQueueHandle,
    pub(crate) blk_info: Rc<BlkStorageInfo>,
    /// The client data region: paths in, file data in and out.
    pub(crate) data: DataRegion,
    /// The block data region, partitioned into per-worker bounce windows.
    pub(crate) blk_data: DataRegion,
    /// Set by the disk adapter when a request was enqueued; the
    /// dispatcher notifies the driver once per activation and clears it.
    pub(crate) blk_requests_pushed: Cell<bool>,
    pub(crate) volumes: DescTable<Rc<FatVolume>, MAX_VOLUMES>,
    pub(crate) files: DescTable<FatFile, MAX_OPEN_FILES>,
    pub(crate) dirs: DescTable<DirHandle, MAX_OPEN_DIRS>,
    /// Indexed by worker handle; slot 0 is unused.
    pub(crate) requests: Vec<RequestRecord>,
}

impl Server {
    /// Assemble a server over its shared resources.
    pub fn new(
        cmd_queue: Rc<FsQueue>,
        cmpl_queue: Rc<FsQueue>,
        blk: BlkQueueHandle,
        blk_info: Rc<BlkStorageInfo>,
        data: DataRegion,
        blk_data: DataRegion,
    ) -> Rc<Server> {
        debug_assert!(
            blk_data.len() % WORKER_COUNT == 0,
            "block data region must split evenly into bounce windows"
        );
        Rc::new(Server {
            pool: CoroPool::new(WORKER_COUNT),
            cmd_queue,
            cmpl_queue,
            blk,
            blk_info,
            data,
            blk_data,
            blk_requests_pushed: Cell::new(false),
            volumes: DescTable::new(),
            files: DescTable::new(),
            dirs: DescTable::new(),
            requests: (0..=WORKER_COUNT).map(|_| RequestRecord::new()).collect(),
        })
    }

    /// Size of one worker's bounce window; bounds the largest cluster the
    /// volume may use.
    pub(crate) fn bounce_window(&self) -> u64 {
        (self.blk_data.len() / WORKER_COUNT) as u64
    }

    pub(crate) fn record(&self, handle: CoroHandle) -> &RequestRecord {
        &self.requests[handle.get() as usize]
    }

    /// The mounted volume, if any.
    pub(crate) fn mounted_volume(&self) -> Option<Rc<FatVolume>> {
        if self.volumes.status(0) != DescStatus::InUse {
            return None;
        }
        self.volumes.obj(0).borrow().clone()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("pool", &self.pool)
            .field("blk_requests_pushed", &self.blk_requests_pushed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_table_allocation() {
        let table: DescTable<u32, 3> = DescTable::new();
        assert_eq!(table.find_free(), Some(0));
        table.set_status(0, DescStatus::InUse);
        assert_eq!(table.find_free(), Some(1));
        table.set_status(1, DescStatus::Cleanup);
        assert_eq!(table.find_free(), Some(2));
        table.set_status(0, DescStatus::Free);
        assert_eq!(table.find_free(), Some(0));
    }

    #[test]
    fn desc_table_validation() {
        let table: DescTable<u32, 2> = DescTable::new();
        assert_eq!(table.validate(0), None);
        table.set_status(0, DescStatus::InUse);
        assert_eq!(table.validate(0), Some(0));
        // cleanup slots are not valid targets for further operations
        table.set_status(0, DescStatus::Cleanup);
        assert_eq!(table.validate(0), None);
        assert_eq!(table.validate(2), None);
        assert_eq!(table.validate(u64::MAX), None);
    }
}
