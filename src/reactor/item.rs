use std::time::{Duration, Instant};

use crate::sys;

/// The readiness classes a monitored item can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The socket has bytes (or a pending accept) to read.
    Read,
    /// The socket can accept more outbound bytes.
    Write,
    /// The peer closed, or the socket entered an error state.
    Close,
    /// The item's timer elapsed.
    Timer,
}

/// Enablement state of one readiness class on one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Enabled,
    Disabled,
}

/// Stable address of a monitored item.
///
/// Packs the slab index together with a generation counter, so a stale id
/// held after `del` can never resolve to a recycled slot. The raw key is
/// what travels through the OS selector as user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl ItemId {
    pub(crate) fn new(index: usize, generation: u32) -> ItemId {
        ItemId((u64::from(generation) << 32) | index as u64)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub(crate) fn from_key(key: u64) -> ItemId {
        ItemId(key)
    }

    pub(crate) fn key(self) -> u64 {
        self.0
    }
}

/// Callback invoked on the reactor thread for every dispatched readiness
/// class of one item.
pub(crate) type Callback = Box<dyn FnMut(ItemId, Kind) + Send>;

#[derive(Debug)]
pub(crate) struct TimerState {
    pub(crate) delay: Duration,
    pub(crate) series: bool,
    /// Armed when `Some`; the loop self-writes the pipe once it passes.
    pub(crate) deadline: Option<Instant>,
    pub(crate) sender: sys::pipe::Sender,
}

/// One monitored resource.
///
/// Owned by the reactor. Socket items borrow the caller's descriptor; timer
/// items own both ends of their internal pipe and drop them on removal.
pub(crate) struct Item {
    pub(crate) id: ItemId,
    pub(crate) socket: sys::OsSocket,
    /// Timer pipe read end; `None` for socket items.
    pub(crate) receiver: Option<sys::pipe::Receiver>,
    pub(crate) timer: Option<TimerState>,
    pub(crate) read: Mode,
    pub(crate) write: Mode,
    pub(crate) close: Mode,
    pub(crate) timer_mode: Mode,
    /// Taken out for the duration of a user callback so the state lock is
    /// never held across user code.
    pub(crate) callback: Option<Callback>,
}

impl Item {
    pub(crate) fn is_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn mode_of(&self, kind: Kind) -> Mode {
        match kind {
            Kind::Read => self.read,
            Kind::Write => self.write,
            Kind::Close => self.close,
            Kind::Timer => self.timer_mode,
        }
    }

    /// Flip one readiness class, reporting whether anything changed.
    pub(crate) fn set_mode(&mut self, kind: Kind, mode: Mode) -> bool {
        let slot = match kind {
            Kind::Read => &mut self.read,
            Kind::Write => &mut self.write,
            Kind::Close => &mut self.close,
            Kind::Timer => &mut self.timer_mode,
        };
        if *slot == mode {
            return false;
        }
        *slot = mode;

        if kind == Kind::Timer {
            if let Some(timer) = self.timer.as_mut() {
                timer.deadline = match mode {
                    Mode::Enabled => Some(Instant::now() + timer.delay),
                    Mode::Disabled => None,
                };
            }
        }
        true
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("timer", &self.timer)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("close", &self.close)
            .field("timer_mode", &self.timer_mode)
            .finish()
    }
}
