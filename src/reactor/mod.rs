//! The event reactor.
//!
//! A [`Reactor`] demultiplexes readiness for thousands of sockets and timers
//! through the platform selector (epoll, kqueue or `WSAPoll`) and dispatches
//! them as callbacks on the single thread that called [`Reactor::run`].
//!
//! Mutations ([`Handle::add`], [`Handle::del`], [`Handle::mode`], ...) are
//! allowed from any thread and take effect before or between dispatches,
//! never during one. Callbacks for one item are strictly serialized.
//!
//! # Examples
//!
//! A periodic timer stopped from its own callback:
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::time::Duration;
//! use rookery::{Kind, Reactor};
//!
//! let reactor = Reactor::new()?;
//! let handle = reactor.handle();
//!
//! let stopper = reactor.handle();
//! handle.add_timer(Duration::from_millis(100), true, move |id, _kind| {
//!     stopper.del(id);
//!     stopper.stop();
//! })?;
//!
//! reactor.run()?;
//! # Ok(())
//! # }
//! ```

mod item;
mod upstream;
mod watcher;

pub use self::item::{ItemId, Kind, Mode};
pub use self::upstream::UpstreamId;
pub use self::watcher::{Watcher, WatcherKind};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{trace, warn};
use slab::Slab;

use crate::sys;
use crate::OsSocket;

use self::item::{Callback, Item, TimerState};
use self::upstream::{Upstream, UpstreamCallback};

/// Default ceiling on concurrently monitored items.
const DEFAULT_MAX_ITEMS: usize = 65_536;

/// Upper bound on one blocking wait; idle housekeeping cadence.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Readiness events collected per selector pass.
const EVENTS_CAPACITY: usize = 1024;

/// Selector keys with this bit identify upstream channels rather than items.
pub(crate) const UPSTREAM_KEY_BIT: u64 = 1 << 63;

/// Selector key of the internal control pipe.
const CONTROL_KEY: u64 = u64::MAX;

/// The event reactor; see the [module documentation](self).
pub struct Reactor {
    inner: Arc<Inner>,
}

/// Cloneable, thread-safe mutation surface of a [`Reactor`].
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

struct Inner {
    /// Swapped wholesale by `rebase`; readers never block each other and the
    /// writer only runs on the loop thread while the loop is not waiting.
    selector: RwLock<sys::Selector>,
    state: Mutex<State>,
    /// Control pipe: `stop`, `kick` and timer re-arms write one byte to pull
    /// the loop out of its OS wait.
    control_rx: sys::pipe::Receiver,
    control_tx: sys::pipe::Sender,
    running: AtomicBool,
    stop: AtomicBool,
    frozen: AtomicBool,
    easy: AtomicBool,
    base_delay_ms: AtomicU64,
    /// Fingerprint of the owning thread, claimed by the first `run`.
    owner: AtomicU64,
    max_items: usize,
}

struct State {
    items: Slab<Item>,
    /// fd -> slab index. Invariant: no two items share a socket.
    sockets: HashMap<OsSocket, usize>,
    upstreams: Slab<Upstream>,
    generation: u32,
}

impl State {
    fn next_generation(&mut self) -> u32 {
        // Keep bit 63 of packed keys free for the upstream discriminator.
        self.generation = (self.generation + 1) & 0x7fff_ffff;
        self.generation
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.items
            .get_mut(id.index())
            .filter(|item| item.id == id)
    }

    fn upstream_mut(&mut self, id: UpstreamId) -> Option<&mut Upstream> {
        self.upstreams
            .get_mut(id.index())
            .filter(|up| up.id == id)
    }
}

fn fingerprint() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    // Zero means "unclaimed".
    hasher.finish() | 1
}

fn limit_reached() -> io::Error {
    // A try-again condition, not a hard fault: callers may defer and retry
    // once monitored items go away.
    io::Error::new(io::ErrorKind::WouldBlock, "monitored item limit reached")
}

impl Reactor {
    /// Create a reactor with the default item capacity.
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_capacity(DEFAULT_MAX_ITEMS)
    }

    /// Create a reactor monitoring at most `max_items` items.
    pub fn with_capacity(max_items: usize) -> io::Result<Reactor> {
        sys::init();
        let selector = sys::Selector::new()?;
        let (control_rx, control_tx) = sys::pipe::new(true)?;
        selector.register(control_rx.as_raw(), CONTROL_KEY, true, false)?;

        Ok(Reactor {
            inner: Arc::new(Inner {
                selector: RwLock::new(selector),
                state: Mutex::new(State {
                    items: Slab::new(),
                    sockets: HashMap::new(),
                    upstreams: Slab::new(),
                    generation: 0,
                }),
                control_rx,
                control_tx,
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                frozen: AtomicBool::new(false),
                easy: AtomicBool::new(false),
                base_delay_ms: AtomicU64::new(DEFAULT_BASE_DELAY.as_millis() as u64),
                owner: AtomicU64::new(0),
                max_items,
            }),
        })
    }

    /// A cloneable handle for registrations and cross-thread control.
    pub fn handle(&self) -> Handle {
        Handle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run the event loop on the calling thread until [`Handle::stop`].
    ///
    /// The first call claims the thread as the reactor's owner; subsequent
    /// calls from any other thread are rejected.
    pub fn run(&self) -> io::Result<()> {
        let me = fingerprint();
        let owner = self.inner.owner.compare_exchange(
            0,
            me,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match owner {
            Ok(_) => {}
            Err(current) if current == me => {}
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "run() called off the owning thread",
                ));
            }
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event loop already running",
            ));
        }

        let result = self.inner.run_loop();
        self.inner.running.store(false, Ordering::Release);
        self.inner.stop.store(false, Ordering::Release);
        result
    }

    /// Whether the loop is currently running.
    pub fn launched(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Tear down the OS selector, re-create it, and re-register everything.
    ///
    /// Only callable on the owning thread (or before any thread claimed the
    /// reactor, e.g. in a freshly forked child).
    pub fn rebase(&self) -> io::Result<()> {
        self.inner.check_owner()?;
        self.inner.rebase()
    }

    /// Interrupt the current OS wait and re-enter the loop immediately.
    pub fn kick(&self) -> io::Result<()> {
        self.inner.wake()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.launched())
            .finish()
    }
}

impl Handle {
    /// Begin monitoring a socket.
    ///
    /// All readiness classes except [`Kind::Close`] start out disabled;
    /// enable them with [`mode`](Handle::mode). The callback runs on the
    /// loop thread only.
    ///
    /// Fails when the socket is invalid, already monitored, or the item
    /// limit is reached.
    pub fn add<F>(&self, socket: OsSocket, callback: F) -> io::Result<ItemId>
    where
        F: FnMut(ItemId, Kind) + Send + 'static,
    {
        if socket == crate::INVALID_SOCKET {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot monitor an invalid socket",
            ));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.items.len() >= self.inner.max_items {
            return Err(limit_reached());
        }
        if state.sockets.contains_key(&socket) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket already monitored",
            ));
        }

        let generation = state.next_generation();
        let entry = state.items.vacant_entry();
        let id = ItemId::new(entry.key(), generation);
        entry.insert(Item {
            id,
            socket,
            receiver: None,
            timer: None,
            read: Mode::Disabled,
            write: Mode::Disabled,
            close: Mode::Enabled,
            timer_mode: Mode::Disabled,
            callback: Some(Box::new(callback) as Callback),
        });
        state.sockets.insert(socket, id.index());

        let selector = self.inner.selector.read().unwrap();
        if let Err(err) = selector.register(socket, id.key(), false, false) {
            state.items.remove(id.index());
            state.sockets.remove(&socket);
            return Err(err);
        }
        trace!("registered socket {} as {:?}", socket, id);
        Ok(id)
    }

    /// Begin a timer firing `delay` from now; `series` re-arms it after
    /// every fire.
    ///
    /// Internally a pipe the loop self-writes on expiry, so timers dispatch
    /// through the same readiness path as sockets.
    pub fn add_timer<F>(&self, delay: Duration, series: bool, callback: F) -> io::Result<ItemId>
    where
        F: FnMut(ItemId, Kind) + Send + 'static,
    {
        if delay.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer delay must be non-zero",
            ));
        }
        let (receiver, sender) = sys::pipe::new(true)?;
        let socket = receiver.as_raw();

        let mut state = self.inner.state.lock().unwrap();
        if state.items.len() >= self.inner.max_items {
            return Err(limit_reached());
        }

        let generation = state.next_generation();
        let entry = state.items.vacant_entry();
        let id = ItemId::new(entry.key(), generation);
        entry.insert(Item {
            id,
            socket,
            receiver: Some(receiver),
            timer: Some(TimerState {
                delay,
                series,
                deadline: Some(Instant::now() + delay),
                sender,
            }),
            read: Mode::Disabled,
            write: Mode::Disabled,
            close: Mode::Enabled,
            timer_mode: Mode::Enabled,
            callback: Some(Box::new(callback) as Callback),
        });
        state.sockets.insert(socket, id.index());

        let selector = self.inner.selector.read().unwrap();
        if let Err(err) = selector.register(socket, id.key(), true, false) {
            state.items.remove(id.index());
            state.sockets.remove(&socket);
            return Err(err);
        }
        drop(selector);
        drop(state);

        // The loop may be blocked past the new deadline; re-plan.
        let _ = self.inner.wake();
        trace!("registered {:?} timer {:?}", delay, id);
        Ok(id)
    }

    /// Remove one item by id. Returns whether it existed.
    pub fn del(&self, id: ItemId) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.remove_item(&mut state, id).is_some()
    }

    /// Remove whatever item monitors `socket`. Returns whether it existed.
    pub fn del_socket(&self, socket: OsSocket) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.sockets.get(&socket) {
            Some(&index) => {
                let id = state.items[index].id;
                self.inner.remove_item(&mut state, id).is_some()
            }
            None => false,
        }
    }

    /// Disable one readiness class without removing the item.
    pub fn del_kind(&self, id: ItemId, kind: Kind) -> bool {
        self.mode(id, kind, Mode::Disabled)
    }

    /// Toggle one readiness class. Returns true if the state transitioned.
    pub fn mode(&self, id: ItemId, kind: Kind, mode: Mode) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(item) = state.item_mut(id) else {
            return false;
        };
        if !item.set_mode(kind, mode) {
            return false;
        }

        match kind {
            Kind::Read | Kind::Write => {
                let socket = item.socket;
                let read = item.read == Mode::Enabled || item.is_timer();
                let write = item.write == Mode::Enabled;
                let selector = self.inner.selector.read().unwrap();
                if let Err(err) = selector.reregister(socket, id.key(), read, write) {
                    warn!("reregister of socket {} failed: {}", socket, err);
                }
            }
            Kind::Timer => {
                // Deadline moved; the loop must re-plan its wait.
                drop(state);
                let _ = self.inner.wake();
            }
            Kind::Close => {}
        }
        true
    }

    /// Remove every monitored item. Upstream channels survive.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let ids: Vec<ItemId> = state.items.iter().map(|(_, item)| item.id).collect();
        for id in ids {
            self.inner.remove_item(&mut state, id);
        }
    }

    /// Number of currently monitored items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    /// Whether no items are monitored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install a new upstream channel; the callback observes every token on
    /// the loop thread, in producer write order.
    pub fn upstream<F>(&self, callback: F) -> io::Result<UpstreamId>
    where
        F: FnMut(u64) + Send + 'static,
    {
        // Blocking write end: tokens are never dropped, producers stall.
        let (receiver, sender) = sys::pipe::new(false)?;
        let socket = receiver.as_raw();

        let mut state = self.inner.state.lock().unwrap();
        let generation = state.next_generation();
        let entry = state.upstreams.vacant_entry();
        let id = UpstreamId::new(entry.key(), generation);
        entry.insert(Upstream {
            id,
            receiver,
            sender: Arc::new(sender),
            callback: Some(Box::new(callback) as UpstreamCallback),
            pending: [0; 8],
            filled: 0,
        });

        let selector = self.inner.selector.read().unwrap();
        if let Err(err) = selector.register(socket, id.key(), true, false) {
            state.upstreams.remove(id.index());
            return Err(err);
        }
        trace!("registered upstream {:?}", id);
        Ok(id)
    }

    /// Wake the reactor with a token; callable from any thread.
    ///
    /// Blocks only when the channel's kernel buffer is full.
    pub fn notify(&self, id: UpstreamId, token: u64) -> io::Result<()> {
        let sender = {
            let mut state = self.inner.state.lock().unwrap();
            match state.upstream_mut(id) {
                Some(up) => Arc::clone(&up.sender),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no such upstream channel",
                    ))
                }
            }
        };
        // Written outside the lock: a stalled producer must never hold up
        // the loop's drain. Single-token writes are atomic (<= PIPE_BUF).
        (&*sender).write_all(&token.to_ne_bytes())
    }

    /// Remove an upstream channel.
    pub fn erase_upstream(&self, id: UpstreamId) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.remove_upstream(&mut state, id)
    }

    /// Ask the loop to drain and exit at the next boundary. Idempotent and
    /// safe from any thread.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        let _ = self.inner.wake();
    }

    /// Pause readiness dispatch without unregistering anything.
    pub fn freeze(&self, frozen: bool) {
        self.inner.frozen.store(frozen, Ordering::Release);
    }

    /// Switch "simple" polling on: drain readiness in bounded bursts and
    /// sleep [`frequency`](Handle::frequency) between polls.
    pub fn easily(&self, easy: bool) {
        self.inner.easy.store(easy, Ordering::Release);
        let _ = self.inner.wake();
    }

    /// Set the polling cadence: the sleep in simple mode, and the upper
    /// bound on one blocking wait otherwise.
    pub fn frequency(&self, period: Duration) {
        let millis = period.as_millis().clamp(1, u64::MAX as u128) as u64;
        self.inner.base_delay_ms.store(millis, Ordering::Release);
        let _ = self.inner.wake();
    }

    /// Whether the loop is currently running.
    pub fn launched(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Re-init the OS selector and re-register everything; the freshly
    /// forked child's half of [`Reactor::rebase`].
    pub(crate) fn rebase_after_fork(&self) -> io::Result<()> {
        self.inner.rebase()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl Inner {
    fn wake(&self) -> io::Result<()> {
        match (&self.control_tx).write(&[1]) {
            Ok(_) => Ok(()),
            // A byte already queued is as good as ours.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    fn check_owner(&self) -> io::Result<()> {
        let owner = self.owner.load(Ordering::Acquire);
        if owner == 0 || owner == fingerprint() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not the reactor's owning thread",
            ))
        }
    }

    /// Release ownership and OS state, re-init, re-register everything.
    fn rebase(&self) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let fresh = sys::Selector::new()?;
        fresh.register(self.control_rx.as_raw(), CONTROL_KEY, true, false)?;
        for (_, item) in state.items.iter() {
            let read = item.read == Mode::Enabled || item.is_timer();
            let write = item.write == Mode::Enabled;
            fresh.register(item.socket, item.id.key(), read, write)?;
        }
        for (_, up) in state.upstreams.iter() {
            fresh.register(up.socket(), up.id.key(), true, false)?;
        }
        // The fork case: the child re-claims the reactor for itself.
        self.owner.store(0, Ordering::Release);
        *self.selector.write().unwrap() = fresh;
        trace!("reactor rebased onto a fresh selector");
        Ok(())
    }

    /// Remove an item: deregister, drop timer pipe ends, return it.
    fn remove_item(&self, state: &mut State, id: ItemId) -> Option<Item> {
        state.item_mut(id)?;
        let item = state.items.remove(id.index());
        state.sockets.remove(&item.socket);
        let selector = self.selector.read().unwrap();
        if let Err(err) = selector.deregister(item.socket) {
            // The socket may already be closed; nothing to undo.
            trace!("deregister of socket {} failed: {}", item.socket, err);
        }
        Some(item)
    }

    fn remove_upstream(&self, state: &mut State, id: UpstreamId) -> bool {
        if state.upstream_mut(id).is_none() {
            return false;
        }
        let up = state.upstreams.remove(id.index());
        let selector = self.selector.read().unwrap();
        if let Err(err) = selector.deregister(up.socket()) {
            trace!("deregister of upstream {:?} failed: {}", id, err);
        }
        true
    }

    fn run_loop(&self) -> io::Result<()> {
        let mut events: sys::Events = Vec::with_capacity(EVENTS_CAPACITY);

        while !self.stop.load(Ordering::Acquire) {
            let easy = self.easy.load(Ordering::Acquire);
            let base = Duration::from_millis(self.base_delay_ms.load(Ordering::Acquire));
            let timeout = if easy {
                Duration::ZERO
            } else {
                self.next_timeout(base)
            };

            {
                let selector = self.selector.read().unwrap();
                match selector.select(&mut events, Some(timeout)) {
                    Ok(()) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }

            self.fire_due_timers();

            if !self.frozen.load(Ordering::Acquire) {
                for index in 0..events.len() {
                    let event = events[index].clone();
                    self.dispatch(&event);
                }
            }

            if easy && !self.stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(
                    self.base_delay_ms.load(Ordering::Acquire),
                ));
            }
        }
        trace!("event loop drained and stopped");
        Ok(())
    }

    /// Time until the nearest armed timer deadline, capped by `base`.
    fn next_timeout(&self, base: Duration) -> Duration {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let mut timeout = base;
        for (_, item) in state.items.iter() {
            if let Some(timer) = item.timer.as_ref() {
                if let Some(deadline) = timer.deadline {
                    let until = deadline.saturating_duration_since(now);
                    if until < timeout {
                        timeout = until;
                    }
                }
            }
        }
        timeout
    }

    /// Self-write every expired timer pipe, advancing series deadlines.
    fn fire_due_timers(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        for (_, item) in state.items.iter_mut() {
            let Some(timer) = item.timer.as_mut() else {
                continue;
            };
            let Some(deadline) = timer.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            timer.deadline = if timer.series {
                Some(now + timer.delay)
            } else {
                // Auto-disarm completes at drain time; no further writes.
                None
            };
            match (&timer.sender).write(&[1]) {
                Ok(_) => {}
                // A byte already pending means the fire is already due.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => warn!("timer self-write for {:?} failed: {}", item.id, err),
            }
        }
    }

    fn dispatch(&self, event: &sys::Event) {
        let key = sys::event::key(event);
        if key == CONTROL_KEY {
            self.drain_control();
            return;
        }
        if key & UPSTREAM_KEY_BIT != 0 {
            self.dispatch_upstream(UpstreamId::from_key(key), event);
            return;
        }

        let id = ItemId::from_key(key);
        // Classification order: READ, WRITE, then CLOSE/ERROR.
        if sys::event::is_readable(event) {
            self.item_readable(id);
        }
        if sys::event::is_writable(event) {
            self.invoke_if_enabled(id, Kind::Write);
        }
        if sys::event::is_closed(event) || sys::event::is_error(event) {
            self.item_closed(id);
        }
    }

    fn drain_control(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.control_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn item_readable(&self, id: ItemId) {
        let is_timer = {
            let mut state = self.state.lock().unwrap();
            let Some(item) = state.item_mut(id) else {
                return;
            };
            if let Some(receiver) = item.receiver.as_ref() {
                // Drain the pipe so edge triggering re-arms.
                let mut buf = [0u8; 64];
                loop {
                    match (&*receiver).read(&mut buf) {
                        Ok(n) if n > 0 => continue,
                        _ => break,
                    }
                }
            }
            item.is_timer()
        };

        if is_timer {
            self.fire_timer(id);
        } else {
            self.invoke_if_enabled(id, Kind::Read);
        }
    }

    fn fire_timer(&self, id: ItemId) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            let Some(item) = state.item_mut(id) else {
                return;
            };
            if item.timer_mode != Mode::Enabled {
                return;
            }
            let series = item.timer.as_ref().map(|t| t.series).unwrap_or(false);
            if !series {
                item.timer_mode = Mode::Disabled;
            }
            item.callback.take()
        };
        self.call(id, Kind::Timer, callback);
    }

    fn invoke_if_enabled(&self, id: ItemId, kind: Kind) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            let Some(item) = state.item_mut(id) else {
                return;
            };
            if item.mode_of(kind) != Mode::Enabled {
                return;
            }
            item.callback.take()
        };
        self.call(id, kind, callback);
    }

    /// Remove the item, then deliver CLOSE if it was enabled.
    fn item_closed(&self, id: ItemId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            self.remove_item(&mut state, id)
        };
        let Some(mut item) = removed else {
            return;
        };
        if item.close == Mode::Enabled {
            if let Some(mut callback) = item.callback.take() {
                callback(id, Kind::Close);
            }
        } else {
            trace!("socket {} closed, removed silently", item.socket);
        }
    }

    /// Run a taken-out callback with no lock held, then return it to the
    /// item if the callback didn't remove it.
    fn call(&self, id: ItemId, kind: Kind, callback: Option<Callback>) {
        let Some(mut callback) = callback else {
            return;
        };
        callback(id, kind);
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.item_mut(id) {
            if item.callback.is_none() {
                item.callback = Some(callback);
            }
        }
    }

    fn dispatch_upstream(&self, id: UpstreamId, event: &sys::Event) {
        if sys::event::is_closed(event) || sys::event::is_error(event) {
            let mut state = self.state.lock().unwrap();
            if self.remove_upstream(&mut state, id) {
                warn!("upstream {:?} read end closed, erased", id);
            }
            return;
        }
        if !sys::event::is_readable(event) {
            return;
        }

        loop {
            // Pull at most one token per pass so callbacks observe strict
            // producer order even if they mutate the channel set.
            let token = {
                let mut state = self.state.lock().unwrap();
                let Some(up) = state.upstream_mut(id) else {
                    return;
                };
                let filled = up.filled;
                let mut chunk = [0u8; 8];
                match (&up.receiver).read(&mut chunk[..8 - filled]) {
                    Ok(0) => {
                        if self.remove_upstream(&mut state, id) {
                            warn!("upstream {:?} read end closed, erased", id);
                        }
                        return;
                    }
                    Ok(n) => {
                        up.pending[filled..filled + n].copy_from_slice(&chunk[..n]);
                        up.filled += n;
                        if up.filled < 8 {
                            continue;
                        }
                        up.filled = 0;
                        Some(u64::from_ne_bytes(up.pending))
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("upstream {:?} read failed: {}", id, err);
                        None
                    }
                }
            };

            let Some(token) = token else {
                return;
            };

            let callback = {
                let mut state = self.state.lock().unwrap();
                state.upstream_mut(id).and_then(|up| up.callback.take())
            };
            if let Some(mut callback) = callback {
                callback(token);
                let mut state = self.state.lock().unwrap();
                if let Some(up) = state.upstream_mut(id) {
                    if up.callback.is_none() {
                        up.callback = Some(callback);
                    }
                }
            }
        }
    }
}
