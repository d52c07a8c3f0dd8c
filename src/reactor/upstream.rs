use std::sync::Arc;

use crate::sys;

/// Stable address of an upstream channel, generation-checked like
/// [`ItemId`](crate::ItemId).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpstreamId(u64);

impl UpstreamId {
    pub(crate) fn new(index: usize, generation: u32) -> UpstreamId {
        UpstreamId((u64::from(generation) << 32) | index as u64)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub(crate) fn from_key(key: u64) -> UpstreamId {
        UpstreamId(key & !super::UPSTREAM_KEY_BIT)
    }

    pub(crate) fn key(self) -> u64 {
        self.0 | super::UPSTREAM_KEY_BIT
    }
}

pub(crate) type UpstreamCallback = Box<dyn FnMut(u64) + Send>;

/// A cross-thread wake channel.
///
/// Producers write a fixed 64-bit token into the pipe; single-token writes
/// are atomic, so the reactor never surfaces a partial token. The write end
/// is blocking: a full kernel buffer stalls the producer instead of losing
/// a token.
pub(crate) struct Upstream {
    pub(crate) id: UpstreamId,
    pub(crate) receiver: sys::pipe::Receiver,
    /// Shared so `notify` can write without holding the reactor state lock;
    /// a blocked producer must never stall the consumer's drain.
    pub(crate) sender: Arc<sys::pipe::Sender>,
    pub(crate) callback: Option<UpstreamCallback>,
    /// Partial token carried between reads; pipes may split the 8 bytes on
    /// the read side even though writes are atomic.
    pub(crate) pending: [u8; 8],
    pub(crate) filled: usize,
}

impl Upstream {
    pub(crate) fn socket(&self) -> sys::OsSocket {
        self.receiver.as_raw()
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("id", &self.id)
            .field("filled", &self.filled)
            .finish()
    }
}
