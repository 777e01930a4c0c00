//! The worker coroutine pool.
//!
//! A strictly cooperative scheduler over a fixed set of worker slots.
//! Workers are plain futures; the event loop drives them with
//! [`CoroPool::run_until_blocked`], which polls every runnable worker until
//! each has either finished or suspended in the disk adapter. Suspension is
//! explicit: a worker awaits [`CoroPool::wait`] after enqueueing a block
//! request, and only the event loop's [`CoroPool::wake`] — issued when the
//! matching block response arrives — makes it runnable again. There is no
//! other wake source, so the pool polls with a no-op waker and keeps all
//! readiness in its own slot state.
//!
//! Each slot carries a one-word argument cell. It is the only cross-
//! coroutine data channel: the event loop stores the block response status
//! there before waking, and the suspended worker reads it after resuming.
//!
//! Handles are 1-based; handle 0 is morally the event loop, which runs on
//! the host thread and needs no slot. The handle value doubles as the
//! block-transport request id and selects the worker's bounce buffer.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::task::noop_waker;

/// A worker slot identifier, `1..=worker_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroHandle(u32);

impl CoroHandle {
    /// The raw handle value (also the block request id).
    pub fn get(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

/// Externally visible worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroState {
    /// Spawned and runnable.
    Active,
    /// Suspended in [`CoroPool::wait`].
    Blocked,
    /// Finished; the slot awaits harvesting.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Vacant,
    Runnable,
    Blocked,
    Done,
}

/// No worker slot was free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFreeSlot;

impl fmt::Display for NoFreeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no free worker slot")
    }
}

impl std::error::Error for NoFreeSlot {}

struct Slot {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    run: Cell<RunState>,
    notified: Cell<bool>,
    arg: Cell<u64>,
}

/// The fixed pool of worker slots.
pub struct CoroPool {
    slots: Box<[Slot]>,
}

impl CoroPool {
    /// Create a pool with `workers` slots, handles `1..=workers`.
    pub fn new(workers: usize) -> Rc<CoroPool> {
        let slots = (0..workers)
            .map(|_| Slot {
                future: RefCell::new(None),
                run: Cell::new(RunState::Vacant),
                notified: Cell::new(false),
                arg: Cell::new(0),
            })
            .collect();
        Rc::new(CoroPool { slots })
    }

    /// First vacant slot, if any. Peeking only; the slot stays vacant.
    pub fn free_slot(&self) -> Option<CoroHandle> {
        self.slots
            .iter()
            .position(|s| s.run.get() == RunState::Vacant)
            .map(|i| CoroHandle(i as u32 + 1))
    }

    /// Spawn a worker. The closure receives the assigned handle so the
    /// future can name itself when issuing disk requests.
    pub fn spawn<F>(&self, make: impl FnOnce(CoroHandle) -> F) -> Result<CoroHandle, NoFreeSlot>
    where
        F: Future<Output = ()> + 'static,
    {
        let handle = self.free_slot().ok_or(NoFreeSlot)?;
        let slot = &self.slots[handle.index()];
        *slot.future.borrow_mut() = Some(Box::pin(make(handle)));
        slot.run.set(RunState::Runnable);
        slot.notified.set(false);
        slot.arg.set(0);
        Ok(handle)
    }

    /// Poll every runnable worker until each is blocked or done. This is
    /// the event loop's yield point: on return, no worker can make
    /// progress without an external wake.
    pub fn run_until_blocked(&self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            let mut progressed = false;
            for slot in self.slots.iter() {
                if slot.run.get() != RunState::Runnable {
                    continue;
                }
                progressed = true;
                let mut future = slot.future.borrow_mut();
                let Some(fut) = future.as_mut() else {
                    slot.run.set(RunState::Vacant);
                    continue;
                };
                match fut.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        *future = None;
                        slot.run.set(RunState::Done);
                    }
                    // the worker marked itself blocked before yielding
                    Poll::Pending => {}
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Suspend the calling worker until [`CoroPool::wake`].
    pub fn wait(&self, handle: CoroHandle) -> Wait<'_> {
        Wait { pool: self, handle }
    }

    /// Make a blocked worker runnable. A wake aimed at a worker that is
    /// not blocked is a no-op.
    pub fn wake(&self, handle: CoroHandle) {
        let slot = &self.slots[handle.index()];
        if slot.run.get() == RunState::Blocked {
            slot.notified.set(true);
            slot.run.set(RunState::Runnable);
        }
    }

    /// Store the one-word argument for `handle`.
    pub fn set_arg(&self, handle: CoroHandle, arg: u64) {
        self.slots[handle.index()].arg.set(arg);
    }

    /// Read the one-word argument for `handle`.
    pub fn arg(&self, handle: CoroHandle) -> u64 {
        self.slots[handle.index()].arg.get()
    }

    /// Worker state, or `None` for a vacant slot.
    pub fn state(&self, handle: CoroHandle) -> Option<CoroState> {
        match self.slots[handle.index()].run.get() {
            RunState::Vacant => None,
            RunState::Runnable => Some(CoroState::Active),
            RunState::Blocked => Some(CoroState::Blocked),
            RunState::Done => Some(CoroState::Done),
        }
    }

    /// Whether the worker has run to completion.
    pub fn is_finished(&self, handle: CoroHandle) -> bool {
        self.slots[handle.index()].run.get() == RunState::Done
    }

    /// Free a finished worker's slot. Called only by the event loop once
    /// the worker's completion has been emitted.
    pub fn recycle(&self, handle: CoroHandle) {
        let slot = &self.slots[handle.index()];
        debug_assert_eq!(slot.run.get(), RunState::Done);
        *slot.future.borrow_mut() = None;
        slot.run.set(RunState::Vacant);
        slot.notified.set(false);
    }

    /// Number of worker slots.
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Reconstruct a handle from its raw value (a transport request id).
    pub fn handle(&self, id: u32) -> Option<CoroHandle> {
        if id >= 1 && id as usize <= self.slots.len() {
            Some(CoroHandle(id))
        } else {
            None
        }
    }
}

impl fmt::Debug for CoroPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<RunState> = self.slots.iter().map(|s| s.run.get()).collect();
        f.debug_struct("CoroPool").field("slots", &states).finish()
    }
}

/// Future returned by [`CoroPool::wait`].
#[derive(Debug)]
pub struct Wait<'a> {
    pool: &'a CoroPool,
    handle: CoroHandle,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let slot = &self.pool.slots[self.handle.index()];
        if slot.notified.replace(false) {
            Poll::Ready(())
        } else {
            slot.run.set(RunState::Blocked);
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let pool = CoroPool::new(2);
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

        let p = pool.clone();
        let l = log.clone();
        let handle = pool
            .spawn(move |h| async move {
                l.borrow_mut().push("start".into());
                p.wait(h).await;
                l.borrow_mut().push(format!("arg={}", p.arg(h)));
            })
            .unwrap();
        assert_eq!(handle.get(), 1);
        assert_eq!(pool.state(handle), Some(CoroState::Active));

        pool.run_until_blocked();
        assert_eq!(*log.borrow(), vec!["start"]);
        assert_eq!(pool.state(handle), Some(CoroState::Blocked));

        pool.set_arg(handle, 17);
        pool.wake(handle);
        assert_eq!(pool.state(handle), Some(CoroState::Active));
        pool.run_until_blocked();
        assert_eq!(pool.state(handle), Some(CoroState::Done));
        assert!(pool.is_finished(handle));
        assert_eq!(log.borrow().last().map(String::as_str), Some("arg=17"));

        pool.recycle(handle);
        assert_eq!(pool.state(handle), None);
        assert_eq!(pool.free_slot(), Some(handle));
    }

    #[test]
    fn wake_before_block_is_a_noop() {
        let pool = CoroPool::new(1);
        let p = pool.clone();
        let handle = pool
            .spawn(move |h| {
                let p = p.clone();
                async move {
                    p.wait(h).await;
                }
            })
            .unwrap();
        // the worker has not reached its wait yet; this wake must not be
        // remembered
        pool.wake(handle);
        pool.run_until_blocked();
        assert_eq!(pool.state(handle), Some(CoroState::Blocked));
        pool.wake(handle);
        pool.run_until_blocked();
        assert!(pool.is_finished(handle));
    }

    #[test]
    fn saturation() {
        let pool = CoroPool::new(2);
        for expect in 1..=2u32 {
            let p = pool.clone();
            let h = pool
                .spawn(move |h| {
                    let p = p.clone();
                    async move {
                        p.wait(h).await;
                    }
                })
                .unwrap();
            assert_eq!(h.get(), expect);
        }
        assert_eq!(pool.free_slot(), None);
        assert!(pool.spawn(|_| async {}).is_err());
    }

    #[test]
    fn workers_interleave_independently() {
        let pool = CoroPool::new(2);
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let p = pool.clone();
            let o = order.clone();
            handles.push(
                pool.spawn(move |h| async move {
                    p.wait(h).await;
                    o.borrow_mut().push(h.get());
                })
                .unwrap(),
            );
        }
        pool.run_until_blocked();
        // wake in reverse order; completion order must follow the wakes
        pool.wake(handles[1]);
        pool.run_until_blocked();
        assert!(pool.is_finished(handles[1]));
        assert!(!pool.is_finished(handles[0]));
        pool.wake(handles[0]);
        pool.run_until_blocked();
        assert_eq!(*order.borrow(), vec![2, 1]);
    }
}
