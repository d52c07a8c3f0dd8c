//! Per-connection byte pump.
//!
//! A [`Transfer`] ties one socket-like [`Link`] to the reactor and moves
//! bytes both ways under watermark control: large reads are chopped into
//! bounded deliveries, writes drain in bounded chunks with a minimum batch
//! size, and independent read/write timers fire when a direction stalls.
//!
//! The [`Link`] trait speaks the TLS collaborator's result convention, so
//! a TLS-wrapped connection pumps identically to a plain one.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use log::{trace, warn};

use crate::reactor::{Handle, ItemId, Kind, Mode};
use crate::OsSocket;

/// Read buffer pulled onto the stack per readiness event.
const READ_BUF: usize = 64 * 1024;

/// Outcome of one [`Link`] operation.
///
/// Mirrors the `{n>0, 0, -1, -2}` convention of the TLS collaborator:
/// bytes moved, peer closed, rearm-and-wait, retry immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io {
    Data(usize),
    Closed,
    WouldBlock,
    /// Transient condition (e.g. mid-renegotiation): re-enter the same
    /// operation right away rather than waiting for readiness.
    Retry,
}

/// One connection's byte source/sink.
pub trait Link: Send {
    fn read(&mut self, buf: &mut [u8]) -> Io;
    fn write(&mut self, buf: &[u8]) -> Io;
    /// Datagram links suspend reading while output is queued.
    fn is_datagram(&self) -> bool {
        false
    }
}

/// Plain socket link without any wrapping.
#[derive(Debug)]
pub struct SocketLink {
    socket: OsSocket,
    datagram: bool,
}

impl SocketLink {
    pub fn new(socket: OsSocket, datagram: bool) -> SocketLink {
        SocketLink { socket, datagram }
    }
}

impl Link for SocketLink {
    fn read(&mut self, buf: &mut [u8]) -> Io {
        match crate::sys::read(self.socket, buf) {
            Ok(0) => Io::Closed,
            Ok(n) => Io::Data(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Io::WouldBlock,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Io::Retry,
            Err(err) => {
                warn!("read on socket {:?} failed: {}", self.socket, err);
                Io::Closed
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Io {
        match crate::sys::write(self.socket, buf) {
            Ok(n) => Io::Data(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Io::WouldBlock,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Io::Retry,
            Err(err) => {
                warn!("write on socket {:?} failed: {}", self.socket, err);
                Io::Closed
            }
        }
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

/// Watermarks governing the pump.
#[derive(Debug, Clone, Copy)]
pub struct Marks {
    /// Largest single delivery to the read callback; bigger reads are
    /// chopped.
    pub read_max: usize,
    /// Largest single chunk handed to the link per write.
    pub write_max: usize,
    /// Minimum batch: with less than this buffered (and no flush pending),
    /// the pump yields and asks for more instead of writing.
    pub write_min: usize,
}

impl Default for Marks {
    fn default() -> Marks {
        Marks {
            read_max: READ_BUF,
            write_max: READ_BUF,
            write_min: 0,
        }
    }
}

/// Which direction a timeout fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Read,
    Write,
}

type ReadFn = Box<dyn FnMut(&[u8]) + Send>;
type NotifyFn = Box<dyn FnMut() + Send>;
type TimeoutFn = Box<dyn FnMut(TimeoutKind) + Send>;

struct Core {
    link: Box<dyn Link>,
    marks: Marks,
    out: BytesMut,
    item: Option<ItemId>,
    read_timer: Option<ItemId>,
    write_timer: Option<ItemId>,
    on_read: Option<ReadFn>,
    on_drain: Option<NotifyFn>,
    on_close: Option<NotifyFn>,
    on_timeout: Option<TimeoutFn>,
    closed: bool,
}

/// The per-connection pump; see the [module docs](self).
pub struct Transfer {
    handle: Handle,
    core: Arc<Mutex<Core>>,
    socket: OsSocket,
}

impl Transfer {
    /// Register `link`'s socket with the reactor. Reading starts after
    /// [`start`](Transfer::start).
    pub fn new(handle: Handle, socket: OsSocket, link: Box<dyn Link>) -> io::Result<Transfer> {
        let core = Arc::new(Mutex::new(Core {
            link,
            marks: Marks::default(),
            out: BytesMut::new(),
            item: None,
            read_timer: None,
            write_timer: None,
            on_read: None,
            on_drain: None,
            on_close: None,
            on_timeout: None,
            closed: false,
        }));

        let shared = Arc::clone(&core);
        let pump_handle = handle.clone();
        let item = handle.add(socket, move |id, kind| {
            dispatch(&pump_handle, &shared, id, kind);
        })?;
        core.lock().unwrap().item = Some(item);

        Ok(Transfer {
            handle,
            core,
            socket,
        })
    }

    pub fn socket(&self) -> OsSocket {
        self.socket
    }

    pub fn set_marks(&self, marks: Marks) {
        self.core.lock().unwrap().marks = marks;
    }

    /// Delivered chunks never exceed `marks.read_max`.
    pub fn on_read<F>(&self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.core.lock().unwrap().on_read = Some(Box::new(callback));
    }

    /// Fired when the outbound buffer empties, or when a send is below the
    /// `write_min` batch floor: "ready to accept more".
    pub fn on_drain<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.core.lock().unwrap().on_drain = Some(Box::new(callback));
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.core.lock().unwrap().on_close = Some(Box::new(callback));
    }

    pub fn on_timeout<F>(&self, callback: F)
    where
        F: FnMut(TimeoutKind) + Send + 'static,
    {
        self.core.lock().unwrap().on_timeout = Some(Box::new(callback));
    }

    /// Enable the read side of the pump.
    pub fn start(&self) -> bool {
        let item = self.core.lock().unwrap().item;
        match item {
            Some(id) => self.handle.mode(id, Kind::Read, Mode::Enabled),
            None => false,
        }
    }

    /// Arm the read-side stall timer; re-armed on every received byte.
    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let shared = Arc::clone(&self.core);
        let timer = self.handle.add_timer(timeout, true, move |_, _| {
            let callback = shared.lock().unwrap().on_timeout.take();
            if let Some(mut callback) = callback {
                callback(TimeoutKind::Read);
                let mut core = shared.lock().unwrap();
                if core.on_timeout.is_none() {
                    core.on_timeout = Some(callback);
                }
            }
        })?;
        let mut core = self.core.lock().unwrap();
        if let Some(old) = core.read_timer.replace(timer) {
            drop(core);
            self.handle.del(old);
        }
        Ok(())
    }

    /// Arm the write-side stall timer; re-armed on every written byte.
    pub fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
        let shared = Arc::clone(&self.core);
        let timer = self.handle.add_timer(timeout, true, move |_, _| {
            let callback = shared.lock().unwrap().on_timeout.take();
            if let Some(mut callback) = callback {
                callback(TimeoutKind::Write);
                let mut core = shared.lock().unwrap();
                if core.on_timeout.is_none() {
                    core.on_timeout = Some(callback);
                }
            }
        })?;
        let mut core = self.core.lock().unwrap();
        if let Some(old) = core.write_timer.replace(timer) {
            drop(core);
            self.handle.del(old);
        }
        Ok(())
    }

    /// Queue bytes and drain as much as the link accepts right away.
    pub fn send(&self, bytes: &[u8]) {
        {
            let mut core = self.core.lock().unwrap();
            if core.closed {
                return;
            }
            core.out.extend_from_slice(bytes);
            // Datagram links don't read while output is pending.
            if core.link.is_datagram() && !core.out.is_empty() {
                if let Some(id) = core.item {
                    let handle = self.handle.clone();
                    drop(core);
                    handle.mode(id, Kind::Read, Mode::Disabled);
                }
            }
        }
        pump_write(&self.handle, &self.core);
    }

    /// Queued, not yet written bytes.
    pub fn pending(&self) -> usize {
        self.core.lock().unwrap().out.len()
    }

    /// Remove the pump (and its timers) from the reactor.
    pub fn close(&self) {
        let (item, read_timer, write_timer) = {
            let mut core = self.core.lock().unwrap();
            core.closed = true;
            (
                core.item.take(),
                core.read_timer.take(),
                core.write_timer.take(),
            )
        };
        for id in [item, read_timer, write_timer].into_iter().flatten() {
            self.handle.del(id);
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("socket", &self.socket)
            .field("pending", &self.pending())
            .finish()
    }
}

fn dispatch(handle: &Handle, core: &Arc<Mutex<Core>>, _id: ItemId, kind: Kind) {
    match kind {
        Kind::Read => pump_read(handle, core),
        Kind::Write => pump_write(handle, core),
        Kind::Close => {
            // The reactor already removed the item.
            let callback = {
                let mut locked = core.lock().unwrap();
                locked.closed = true;
                locked.item = None;
                locked.on_close.take()
            };
            if let Some(mut callback) = callback {
                callback();
                let mut locked = core.lock().unwrap();
                if locked.on_close.is_none() {
                    locked.on_close = Some(callback);
                }
            }
        }
        Kind::Timer => {}
    }
}

fn reset_timer(handle: &Handle, timer: Option<ItemId>) {
    if let Some(id) = timer {
        // Toggling recomputes the deadline from now.
        handle.mode(id, Kind::Timer, Mode::Disabled);
        handle.mode(id, Kind::Timer, Mode::Enabled);
    }
}

fn pump_read(handle: &Handle, core: &Arc<Mutex<Core>>) {
    let mut retried = false;
    loop {
        let mut buf = [0u8; READ_BUF];
        let (action, read_timer) = {
            let mut locked = core.lock().unwrap();
            if locked.closed {
                return;
            }
            let action = locked.link.read(&mut buf);
            (action, locked.read_timer)
        };

        match action {
            Io::Data(n) => {
                reset_timer(handle, read_timer);
                deliver(core, &buf[..n]);
            }
            Io::Closed => {
                close_from_pump(handle, core);
                return;
            }
            Io::WouldBlock => return,
            Io::Retry if !retried => {
                // One immediate re-entry; a second transient defers to the
                // next readiness event.
                retried = true;
                continue;
            }
            Io::Retry => return,
        }
    }
}

/// Hand received bytes to the read callback in `read_max`-sized chops.
fn deliver(core: &Arc<Mutex<Core>>, mut data: &[u8]) {
    let (mut callback, read_max) = {
        let mut locked = core.lock().unwrap();
        let read_max = locked.marks.read_max.max(1);
        match locked.on_read.take() {
            Some(callback) => (callback, read_max),
            None => return,
        }
    };
    while !data.is_empty() {
        let take = data.len().min(read_max);
        callback(&data[..take]);
        data = &data[take..];
    }
    let mut locked = core.lock().unwrap();
    if locked.on_read.is_none() {
        locked.on_read = Some(callback);
    }
}

fn pump_write(handle: &Handle, core: &Arc<Mutex<Core>>) {
    let mut retried = false;
    loop {
        enum Step {
            Wrote(usize),
            Empty,
            BelowFloor,
            Wait,
            Retry,
            Dead,
        }

        let (step, item, write_timer, datagram) = {
            let mut locked = core.lock().unwrap();
            if locked.closed {
                return;
            }
            let item = locked.item;
            let write_timer = locked.write_timer;
            let datagram = locked.link.is_datagram();

            let step = if locked.out.is_empty() {
                Step::Empty
            } else if locked.out.len() < locked.marks.write_min {
                Step::BelowFloor
            } else {
                let take = locked.out.len().min(locked.marks.write_max.max(1));
                let chunk = locked.out.split_to(take);
                match locked.link.write(&chunk) {
                    Io::Data(n) => {
                        if n < chunk.len() {
                            // Partial write: keep the tail at the front.
                            let mut rest = BytesMut::from(&chunk[n..]);
                            rest.unsplit(std::mem::take(&mut locked.out));
                            locked.out = rest;
                        }
                        Step::Wrote(n)
                    }
                    Io::WouldBlock => {
                        let mut rest = BytesMut::from(&chunk[..]);
                        rest.unsplit(std::mem::take(&mut locked.out));
                        locked.out = rest;
                        Step::Wait
                    }
                    Io::Retry => {
                        let mut rest = BytesMut::from(&chunk[..]);
                        rest.unsplit(std::mem::take(&mut locked.out));
                        locked.out = rest;
                        Step::Retry
                    }
                    Io::Closed => Step::Dead,
                }
            };
            (step, item, write_timer, datagram)
        };

        match step {
            Step::Wrote(n) => {
                trace!("pump wrote {} bytes", n);
                reset_timer(handle, write_timer);
                continue;
            }
            Step::Empty => {
                if let Some(id) = item {
                    handle.mode(id, Kind::Write, Mode::Disabled);
                    if datagram {
                        handle.mode(id, Kind::Read, Mode::Enabled);
                    }
                }
                notify_drain(core);
                return;
            }
            Step::BelowFloor => {
                // Not enough for a batch: yield and ask for more.
                notify_drain(core);
                return;
            }
            Step::Wait => {
                if let Some(id) = item {
                    handle.mode(id, Kind::Write, Mode::Enabled);
                }
                return;
            }
            Step::Retry if !retried => {
                retried = true;
                continue;
            }
            Step::Retry => {
                if let Some(id) = item {
                    handle.mode(id, Kind::Write, Mode::Enabled);
                }
                return;
            }
            Step::Dead => {
                close_from_pump(handle, core);
                return;
            }
        }
    }
}

fn notify_drain(core: &Arc<Mutex<Core>>) {
    let callback = core.lock().unwrap().on_drain.take();
    if let Some(mut callback) = callback {
        callback();
        let mut locked = core.lock().unwrap();
        if locked.on_drain.is_none() {
            locked.on_drain = Some(callback);
        }
    }
}

fn close_from_pump(handle: &Handle, core: &Arc<Mutex<Core>>) {
    let (item, read_timer, write_timer, callback) = {
        let mut locked = core.lock().unwrap();
        locked.closed = true;
        (
            locked.item.take(),
            locked.read_timer.take(),
            locked.write_timer.take(),
            locked.on_close.take(),
        )
    };
    for id in [item, read_timer, write_timer].into_iter().flatten() {
        handle.del(id);
    }
    if let Some(mut callback) = callback {
        callback();
        let mut locked = core.lock().unwrap();
        if locked.on_close.is_none() {
            locked.on_close = Some(callback);
        }
    }
}
