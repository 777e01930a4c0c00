//! Block transport.
//!
//! The server talks to the block-device driver through a second pair of
//! SPSC rings: a request ring the server produces and the driver consumes,
//! and a response ring flowing the other way. Requests address the disk in
//! fixed [`BLK_TRANSFER_SIZE`] transfer units and carry a data offset into
//! the shared block data region; the `id` of a request is echoed unchanged
//! in its response and is, by convention, the issuing worker's coroutine
//! handle.
//!
//! Unlike the filesystem rings, block entries are published one at a time —
//! a request is visible to the driver as soon as it is enqueued, and the
//! batched channel notification is the only thing deferred.

use std::cell::UnsafeCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The transport's aligned transfer unit, in bytes. Every request's extent
/// and data offset are multiples of this.
pub const BLK_TRANSFER_SIZE: u64 = 4096;

/// Default capacity of the request and response rings, in entries.
pub const BLK_QUEUE_CAPACITY: u64 = 1024;

/// Response status: request completed successfully.
pub const BLK_RESP_OK: u32 = 0;

/// Response status: the driver failed the request.
pub const BLK_RESP_ERROR: u32 = 1;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BlkOp {
    Read = 0,
    Write = 1,
    Flush = 2,
}

/// One request ring entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BlkRequest {
    /// Offset of the transfer's staging area inside the block data region.
    pub data_offset: u64,
    /// First transfer unit on the device.
    pub sector: u64,
    /// Opcode, a [`BlkOp`] value.
    pub code: u32,
    /// Echoed in the response; the issuing worker's handle.
    pub id: u32,
    /// Extent in transfer units.
    pub count: u16,
    pub _pad: [u8; 6],
}

/// One response ring entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BlkResponse {
    pub status: u32,
    pub id: u32,
    pub success_count: u16,
    pub _pad: [u8; 6],
}

const _: () = assert!(size_of::<BlkRequest>() == 32);
const _: () = assert!(size_of::<BlkResponse>() == 16);

/// Read-only device description published by the driver.
#[derive(Debug)]
pub struct BlkStorageInfo {
    ready: AtomicBool,
    sector_size: u16,
    /// Device capacity in transfer units.
    pub capacity: u64,
}

impl BlkStorageInfo {
    pub fn new(sector_size: u16, capacity: u64) -> Rc<BlkStorageInfo> {
        Rc::new(BlkStorageInfo {
            ready: AtomicBool::new(false),
            sector_size,
            capacity,
        })
    }

    /// The device's native sector size in bytes. A power of two dividing
    /// [`BLK_TRANSFER_SIZE`].
    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// SPSC ring of fixed-size copyable entries, publish-per-operation.
struct Ring<T: Copy> {
    head: AtomicU64,
    tail: AtomicU64,
    slots: Box<[UnsafeCell<T>]>,
}

impl<T: Copy + Default> Ring<T> {
    fn new(capacity: u64) -> Ring<T> {
        let slots = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
        Ring {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            slots,
        }
    }

    fn len(&self) -> u64 {
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Acquire)
    }

    fn push(&self, entry: T) -> Result<(), QueueFull> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail - self.head.load(Ordering::Acquire) == self.slots.len() as u64 {
            return Err(QueueFull);
        }
        let at = (tail % self.slots.len() as u64) as usize;
        unsafe {
            *self.slots[at].get() = entry;
        }
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if self.tail.load(Ordering::Acquire) == head {
            return None;
        }
        let at = (head % self.slots.len() as u64) as usize;
        let entry = unsafe { *self.slots[at].get() };
        self.head.store(head + 1, Ordering::Release);
        Some(entry)
    }
}

impl Default for BlkRequest {
    fn default() -> BlkRequest {
        BlkRequest {
            data_offset: 0,
            sector: 0,
            code: 0,
            id: 0,
            count: 0,
            _pad: [0; 6],
        }
    }
}

impl Default for BlkResponse {
    fn default() -> BlkResponse {
        BlkResponse {
            status: 0,
            id: 0,
            success_count: 0,
            _pad: [0; 6],
        }
    }
}

/// The transport rings were full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block transport queue full")
    }
}

impl std::error::Error for QueueFull {}

/// The server's end of the transport: produces requests, consumes
/// responses.
#[derive(Clone)]
pub struct BlkQueueHandle {
    req: Rc<Ring<BlkRequest>>,
    resp: Rc<Ring<BlkResponse>>,
}

impl BlkQueueHandle {
    pub fn enqueue_req(
        &self,
        code: BlkOp,
        data_offset: u64,
        sector: u64,
        count: u16,
        id: u32,
    ) -> Result<(), QueueFull> {
        self.req.push(BlkRequest {
            data_offset,
            sector,
            code: code.into(),
            id,
            count,
            _pad: [0; 6],
        })
    }

    pub fn resp_empty(&self) -> bool {
        self.resp.len() == 0
    }

    pub fn dequeue_resp(&self) -> Option<BlkResponse> {
        self.resp.pop()
    }
}

impl fmt::Debug for BlkQueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlkQueueHandle")
            .field("pending_req", &self.req.len())
            .field("pending_resp", &self.resp.len())
            .finish()
    }
}

/// The driver's end of the transport: consumes requests, produces
/// responses. In this crate it is exercised by the test harness; in a
/// deployment it describes what the real driver does.
#[derive(Clone)]
pub struct BlkDriverHandle {
    req: Rc<Ring<BlkRequest>>,
    resp: Rc<Ring<BlkResponse>>,
}

impl BlkDriverHandle {
    pub fn dequeue_req(&self) -> Option<BlkRequest> {
        self.req.pop()
    }

    pub fn enqueue_resp(&self, status: u32, success_count: u16, id: u32) -> Result<(), QueueFull> {
        self.resp.push(BlkResponse {
            status,
            id,
            success_count,
            _pad: [0; 6],
        })
    }
}

impl fmt::Debug for BlkDriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlkDriverHandle")
            .field("pending_req", &self.req.len())
            .field("pending_resp", &self.resp.len())
            .finish()
    }
}

/// Create a connected pair of transport ends.
pub fn blk_queue_pair(capacity: u64) -> (BlkQueueHandle, BlkDriverHandle) {
    let req = Rc::new(Ring::new(capacity));
    let resp = Rc::new(Ring::new(capacity));
    (
        BlkQueueHandle {
            req: req.clone(),
            resp: resp.clone(),
        },
        BlkDriverHandle { req, resp },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let (server, driver) = blk_queue_pair(4);
        server.enqueue_req(BlkOp::Read, 0x1000, 7, 2, 3).unwrap();
        let req = driver.dequeue_req().unwrap();
        assert_eq!(req.code, u32::from(BlkOp::Read));
        assert_eq!(req.data_offset, 0x1000);
        assert_eq!(req.sector, 7);
        assert_eq!(req.count, 2);
        assert_eq!(req.id, 3);

        driver.enqueue_resp(BLK_RESP_OK, 2, req.id).unwrap();
        assert!(!server.resp_empty());
        let resp = server.dequeue_resp().unwrap();
        assert_eq!(resp.status, BLK_RESP_OK);
        assert_eq!(resp.id, 3);
        assert!(server.resp_empty());
    }

    #[test]
    fn full_ring_rejects() {
        let (server, driver) = blk_queue_pair(2);
        server.enqueue_req(BlkOp::Flush, 0, 0, 0, 1).unwrap();
        server.enqueue_req(BlkOp::Flush, 0, 0, 0, 2).unwrap();
        assert_eq!(server.enqueue_req(BlkOp::Flush, 0, 0, 0, 3), Err(QueueFull));
        driver.dequeue_req().unwrap();
        server.enqueue_req(BlkOp::Flush, 0, 0, 0, 3).unwrap();
    }
}
