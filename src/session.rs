//! The event dispatcher.
//!
//! [`Session::notified`] is the server's single entry point: the platform
//! glue calls it whenever either channel is raised. One activation drains
//! block completions and wakes the suspended workers, then alternates
//! between letting every runnable worker progress, harvesting finished
//! workers into staged completions, and spawning workers for newly
//! arrived commands — until the worker pool is quiescent and the command
//! queue cannot be drained further. Only then are the rings published and
//! the channels notified, once each.
//!
//! The loop exits exactly when every in-use worker is blocked in the disk
//! adapter or already harvested, and either no command is waiting, the
//! completion ring has no reservable slot, or the pool is saturated — in
//! each case no progress is possible until an external event arrives, so
//! returning to the host's wait is safe.

use std::fmt;
use std::rc::Rc;

use crate::channel::{ChannelId, Notify};
use crate::handlers;
use crate::ll::protocol::{CmdType, FS_QUEUE_CAPACITY, FsCmpl, FsMsg};
use crate::server::Server;

/// The running server session: state plus the outgoing notification hook.
pub struct Session<N: Notify> {
    server: Rc<Server>,
    notify: N,
}

impl<N: Notify> Session<N> {
    pub fn new(server: Rc<Server>, notify: N) -> Session<N> {
        Session { server, notify }
    }

    pub fn server(&self) -> &Rc<Server> {
        &self.server
    }

    /// Handle one notification on `ch`.
    pub fn notified(&mut self, ch: ChannelId) {
        let server = &self.server;
        log::trace!("notified on {ch:?}");

        if !server.blk_info.ready() {
            // the device channel is level-triggered; the driver's
            // readiness publication will re-raise it, so defer instead of
            // spinning
            log::warn!("block transport not ready, deferring");
            return;
        }

        if ch == ChannelId::Device {
            while let Some(resp) = server.blk.dequeue_resp() {
                let Some(handle) = server.pool.handle(resp.id) else {
                    log::warn!("block response for unknown worker {}", resp.id);
                    continue;
                };
                log::trace!(
                    "block response: status {} count {} id {}",
                    resp.status,
                    resp.success_count,
                    resp.id
                );
                server.pool.set_arg(handle, u64::from(resp.status));
                server.pool.wake(handle);
            }
        }

        let mut dequeued: u64 = 0;
        let mut enqueued: u64 = 0;
        // queue lengths are read lazily, once per activation
        let mut sizes_known = false;
        let mut cmd_len: u64 = 0;
        let mut cmpl_len: u64 = 0;

        let mut new_request_popped = true;
        while new_request_popped {
            // give every runnable worker the chance to finish or block in
            // the disk adapter
            server.pool.run_until_blocked();

            new_request_popped = false;

            // harvest: finished workers become staged completions
            for id in 1..=server.pool.worker_count() as u32 {
                let Some(handle) = server.pool.handle(id) else {
                    continue;
                };
                let record = server.record(handle);
                if record.in_use.get() && server.pool.is_finished(handle) {
                    let cmpl = FsCmpl {
                        id: record.id.get(),
                        status: record.status.get(),
                        data: record.data.get(),
                    };
                    log::trace!(
                        "completion staged: id {} cmd {} status {}",
                        cmpl.id,
                        record.cmd.get(),
                        cmpl.status
                    );
                    server.cmpl_queue.idx_empty_write(enqueued, FsMsg::from(cmpl));
                    enqueued += 1;
                    record.in_use.set(false);
                    server.pool.recycle(handle);
                }
            }

            // refill: spawn workers for waiting commands while a slot is
            // free and a completion slot can be reserved
            loop {
                if server.pool.free_slot().is_none() {
                    break;
                }
                if !sizes_known {
                    cmd_len = server.cmd_queue.length_consumer();
                    // reserve room for the completions staged above and
                    // for workers still in flight from earlier
                    // activations, so a harvested worker always finds a
                    // ring slot
                    let in_flight = server.requests[1..]
                        .iter()
                        .filter(|record| record.in_use.get())
                        .count() as u64;
                    cmpl_len = server.cmpl_queue.length_producer() + enqueued + in_flight;
                    sizes_known = true;
                }
                if cmd_len == 0 || cmpl_len >= FS_QUEUE_CAPACITY {
                    break;
                }

                let cmd = server.cmd_queue.idx_filled(dequeued).cmd();
                dequeued += 1;
                cmd_len -= 1;

                // invalid command types are consumed without a completion
                let Ok(ty) = CmdType::try_from(cmd.ty) else {
                    log::warn!("dropping command {} with invalid type {}", cmd.id, cmd.ty);
                    continue;
                };

                let spawned = server.pool.spawn({
                    let server = server.clone();
                    let params = cmd.params;
                    move |handle| handlers::worker_entry(server, handle, ty, params)
                });
                match spawned {
                    Ok(handle) => {
                        log::debug!("dispatch id {} {:?} -> worker {}", cmd.id, ty, handle.get());
                        server.record(handle).assign(cmd.id, cmd.ty);
                        new_request_popped = true;
                        cmpl_len += 1;
                    }
                    Err(e) => {
                        // cannot happen: slot availability was checked at
                        // the top of this loop
                        log::error!("spawn failed after free-slot check: {e}");
                        break;
                    }
                }
            }
        }

        if dequeued > 0 {
            server.cmd_queue.publish_consumption(dequeued);
        }
        if enqueued > 0 {
            server.cmpl_queue.publish_production(enqueued);
            log::trace!("publishing {enqueued} completions");
            self.notify.notify(ChannelId::Client);
        }
        if server.blk_requests_pushed.replace(false) {
            self.notify.notify(ChannelId::Device);
        }
    }
}

impl<N: Notify> fmt::Debug for Session<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("server", &self.server).finish()
    }
}
