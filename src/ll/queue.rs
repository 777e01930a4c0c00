//! Command and completion rings.
//!
//! Two single-producer/single-consumer rings connect the server to its
//! client: the client produces commands, the server produces completions.
//! Head and tail are monotonically increasing 64-bit counters; the slot for
//! counter `c` is `c % FS_QUEUE_CAPACITY`. A producer stages messages into
//! empty slots and then publishes them in one release-store of `tail`; a
//! consumer reads filled slots and publishes consumption in one
//! release-store of `head`. The batched publish is what lets the event loop
//! drain and refill without a fence per message.
//!
//! Roles are fixed at wiring time: exactly one side may call the producer
//! methods of a given ring and exactly one side the consumer methods. The
//! ring itself cannot enforce that contract across protection domains any
//! more than the shared memory can; it is part of the transport definition.

use std::cell::UnsafeCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::protocol::{FS_QUEUE_CAPACITY, FsMsg};

/// One shared message ring.
pub struct FsQueue {
    head: AtomicU64,
    tail: AtomicU64,
    buffer: Box<[UnsafeCell<FsMsg>]>,
}

impl FsQueue {
    /// Allocate an empty ring of [`FS_QUEUE_CAPACITY`] slots.
    pub fn new() -> Rc<FsQueue> {
        let buffer = (0..FS_QUEUE_CAPACITY)
            .map(|_| UnsafeCell::new(FsMsg::zeroed()))
            .collect();
        Rc::new(FsQueue {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            buffer,
        })
    }

    /// Number of filled slots visible to the consumer.
    pub fn length_consumer(&self) -> u64 {
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Relaxed)
    }

    /// Number of filled slots from the producer's point of view; the free
    /// space is `FS_QUEUE_CAPACITY` minus this.
    pub fn length_producer(&self) -> u64 {
        self.tail.load(Ordering::Relaxed) - self.head.load(Ordering::Acquire)
    }

    /// Copy out the `index`-th filled message (0 is the oldest unconsumed).
    ///
    /// Consumer-side. `index` must be below [`Self::length_consumer`].
    pub fn idx_filled(&self, index: u64) -> FsMsg {
        let at = (self.head.load(Ordering::Relaxed) + index) % FS_QUEUE_CAPACITY;
        unsafe { *self.buffer[at as usize].get() }
    }

    /// Stage `msg` into the `index`-th empty slot past the tail.
    ///
    /// Producer-side. Not visible to the consumer until
    /// [`Self::publish_production`].
    pub fn idx_empty_write(&self, index: u64, msg: FsMsg) {
        let at = (self.tail.load(Ordering::Relaxed) + index) % FS_QUEUE_CAPACITY;
        unsafe {
            *self.buffer[at as usize].get() = msg;
        }
    }

    /// Publish the consumption of `amount` messages.
    pub fn publish_consumption(&self, amount: u64) {
        let head = self.head.load(Ordering::Relaxed);
        self.head.store(head + amount, Ordering::Release);
    }

    /// Publish `amount` staged messages.
    pub fn publish_production(&self, amount: u64) {
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(tail + amount, Ordering::Release);
    }
}

impl std::fmt::Debug for FsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}
