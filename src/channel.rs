//! Notification channels.
//!
//! The server is connected to exactly two peers: the client that submits
//! filesystem commands and the block-device driver that services disk
//! requests. Both are reached through one-shot, level-triggered
//! notifications delivered by the host system. The [`Notify`] trait is the
//! seam where that host primitive plugs in; tests substitute a recording
//! implementation.

/// The two channels the server is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    /// The filesystem client (command and completion rings).
    Client,
    /// The block-device driver (request and response rings).
    Device,
}

/// Outgoing notification hook.
///
/// `notify` must be a one-shot wakeup with level-trigger semantics on the
/// recipient: notifying an already-pending channel is a no-op.
pub trait Notify {
    /// Raise a notification on `ch`.
    fn notify(&self, ch: ChannelId);
}

impl<F: Fn(ChannelId)> Notify for F {
    fn notify(&self, ch: ChannelId) {
        self(ch)
    }
}
