//! Cooperative FAT filesystem server.
//!
//! This crate implements the core of a single-client filesystem server for
//! shared-memory microkernel systems. Commands arrive on an SPSC ring, are
//! dispatched onto a fixed pool of worker coroutines, and run against an
//! asynchronous FAT16/FAT32 back-end whose sector I/O is re-shaped into the
//! block transport's aligned transfer units and serviced by an external
//! block-device driver through a second pair of rings.
//!
//! The crate deliberately contains no platform glue: mapping the shared
//! regions, wiring the two notification channels and calling
//! [`Session::notified`] on every notification is the job of the embedding
//! component. Everything else — scheduling, descriptor management, the FAT
//! volume, the alignment adapter — lives here and is testable on a host.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub use crate::channel::ChannelId;
pub use crate::channel::Notify;
pub use crate::pool::CoroHandle;
pub use crate::pool::CoroPool;
pub use crate::server::Server;
pub use crate::session::Session;
pub use crate::shm::DataRegion;

pub mod channel;
mod diskio;
pub mod fat;
mod handlers;
pub mod ll;
pub mod pool;
pub mod server;
pub mod session;
pub mod shm;

/// Number of worker coroutines. Slot 0 is the event loop itself, so worker
/// handles run from 1 to `WORKER_COUNT` inclusive and double as block
/// transport request ids and bounce-buffer indices.
pub const WORKER_COUNT: usize = 4;

/// Number of FAT volume slots. The protocol assumes a single volume.
pub const MAX_VOLUMES: usize = 1;

/// Maximum concurrently open files.
pub const MAX_OPEN_FILES: usize = 32;

/// Maximum concurrently open directories.
pub const MAX_OPEN_DIRS: usize = 16;
