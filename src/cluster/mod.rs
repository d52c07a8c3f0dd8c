//! POSIX worker cluster.
//!
//! A [`Cluster`] forks worker processes and keeps a typed message channel
//! to each: HELLO (the child's pid, always first) and GENERAL (user
//! payload), length-prefixed and optionally compressed and encrypted (see
//! [`codec`]). Two transports are available per cluster: `socketpair`
//! plumbing per worker, or one `AF_UNIX` listening socket every child
//! connects back to.
//!
//! Children that die are reaped through a SIGCHLD self-pipe registered in
//! the parent's reactor and, policy permitting, replaced in their slot
//! ("rebase"). A child that finds itself orphaned self-destructs.
//!
//! Fork, socketpair and allocation failures during bring-up are fatal by
//! design: the process logs, cleans up and exits.

pub mod codec;

pub use self::codec::{Cipher, Method};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::reactor::{Handle, ItemId, Kind, Mode};
use crate::sys::socket;
use crate::OsSocket;

use self::codec::{Decoder, Encoder, Transform, GENERAL, HELLO};

/// Children younger than this are not restarted: immediate death points at
/// a crash loop, not a transient failure.
const DEFAULT_RESTART_THRESHOLD: Duration = Duration::from_secs(180);

/// Write ends of the SIGCHLD self-pipes, one slot per live cluster, so
/// several clusters can coexist in one process. Fixed-size and atomic: the
/// signal handler may only touch async-signal-safe state.
const SIGCHLD_SLOTS: usize = 16;
#[allow(clippy::declare_interior_mutable_const)]
const SIGCHLD_EMPTY: AtomicI32 = AtomicI32::new(-1);
static SIGCHLD_FDS: [AtomicI32; SIGCHLD_SLOTS] = [SIGCHLD_EMPTY; SIGCHLD_SLOTS];

/// Exited pids reaped by some cluster's wait loop but belonging to
/// another cluster in this process.
fn unclaimed_exits() -> &'static Mutex<HashMap<libc::pid_t, libc::c_int>> {
    static UNCLAIMED: std::sync::OnceLock<Mutex<HashMap<libc::pid_t, libc::c_int>>> =
        std::sync::OnceLock::new();
    UNCLAIMED.get_or_init(|| Mutex::new(HashMap::new()))
}

extern "C" fn on_sigchld(_: libc::c_int) {
    for slot in &SIGCHLD_FDS {
        let fd = slot.load(Ordering::Relaxed);
        if fd >= 0 {
            // Async-signal-safe; a full pipe is fine, a byte is already
            // there.
            unsafe {
                libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1);
            }
        }
    }
}

/// How parent and children exchange messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Two `socketpair(2)` pairs per worker.
    Pipe,
    /// One `AF_UNIX` listening socket; children connect back.
    Ipc,
}

/// Cluster lifecycle and message callbacks.
#[derive(Default)]
pub struct ClusterCallbacks {
    /// A child completed its HELLO handshake: `(wid, pid)`.
    pub ready: Option<Box<dyn FnMut(u16, i32) + Send>>,
    /// A GENERAL message arrived: `(wid, pid, payload)`.
    pub message: Option<Box<dyn FnMut(u16, i32, &[u8]) + Send>>,
    /// A child exited: `(wid, pid, status)`.
    pub exit: Option<Box<dyn FnMut(u16, i32, i32) + Send>>,
    /// A dead child was replaced in its slot: `(wid, new_pid, old_pid)`.
    pub rebase: Option<Box<dyn FnMut(u16, i32, i32) + Send>>,
}

impl std::fmt::Debug for ClusterCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCallbacks")
            .field("ready", &self.ready.is_some())
            .field("message", &self.message.is_some())
            .finish()
    }
}

/// Parent-side control block for one live child.
#[derive(Debug)]
struct Broker {
    wid: u16,
    index: u16,
    pid: libc::pid_t,
    started: Instant,
    read_fd: OsSocket,
    write_fd: OsSocket,
    read_item: Option<ItemId>,
    write_item: Option<ItemId>,
    encoder: Encoder,
    decoder: Decoder,
    hello: bool,
}

/// One worker slot's configuration.
#[derive(Debug)]
struct Worker {
    count: u16,
    auto_restart: bool,
}

/// Child-side channel back to the parent.
#[derive(Debug)]
struct ChildLink {
    wid: u16,
    read_fd: OsSocket,
    write_fd: OsSocket,
    read_item: Option<ItemId>,
    write_item: Option<ItemId>,
    encoder: Encoder,
    decoder: Decoder,
}

/// An accepted IPC connection whose HELLO has not arrived yet.
#[derive(Debug)]
struct PendingIpc {
    socket: OsSocket,
    item: ItemId,
    decoder: Decoder,
}

struct Inner {
    name: String,
    transport: Transport,
    transform: Transform,
    restart_threshold: Duration,
    workers: HashMap<u16, Worker>,
    brokers: HashMap<libc::pid_t, Broker>,
    /// pid -> wid, parent side.
    pids: HashMap<libc::pid_t, u16>,
    callbacks: ClusterCallbacks,
    parent_pid: libc::pid_t,
    is_child: bool,
    child: Option<ChildLink>,
    sigchld_item: Option<ItemId>,
    sigchld_pipe: Option<(crate::sys::pipe::Receiver, crate::sys::pipe::Sender)>,
    sigchld_slot: Option<usize>,
    ipc_listener: Option<OsSocket>,
    ipc_item: Option<ItemId>,
    ipc_path: Option<PathBuf>,
    ipc_pending: Vec<PendingIpc>,
}

/// The process cluster; see the [module docs](self).
pub struct Cluster {
    handle: Handle,
    inner: Arc<Mutex<Inner>>,
}

impl Cluster {
    pub fn new(handle: Handle, name: &str) -> Cluster {
        Cluster {
            handle,
            inner: Arc::new(Mutex::new(Inner {
                name: name.to_lowercase(),
                transport: Transport::Pipe,
                transform: Transform::new(),
                restart_threshold: DEFAULT_RESTART_THRESHOLD,
                workers: HashMap::new(),
                brokers: HashMap::new(),
                pids: HashMap::new(),
                callbacks: ClusterCallbacks::default(),
                parent_pid: unsafe { libc::getpid() },
                is_child: false,
                child: None,
                sigchld_item: None,
                sigchld_pipe: None,
                sigchld_slot: None,
                ipc_listener: None,
                ipc_item: None,
                ipc_path: None,
                ipc_pending: Vec::new(),
            })),
        }
    }

    // ===== configuration =====

    pub fn transport(&self, transport: Transport) {
        self.inner.lock().unwrap().transport = transport;
    }

    pub fn compressor(&self, method: Method) {
        self.inner.lock().unwrap().transform.compressor(method);
    }

    pub fn cipher(&self, cipher: Cipher) {
        self.inner.lock().unwrap().transform.cipher(cipher);
    }

    /// Key the channel ciphers from password + salt.
    pub fn password(&self, password: &str, salt: &str) {
        self.inner.lock().unwrap().transform.password(password, salt);
    }

    /// Children dying younger than this are never auto-restarted.
    pub fn restart_threshold(&self, threshold: Duration) {
        self.inner.lock().unwrap().restart_threshold = threshold;
    }

    pub fn on_ready<F: FnMut(u16, i32) + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.ready = Some(Box::new(f));
    }

    pub fn on_message<F: FnMut(u16, i32, &[u8]) + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.message = Some(Box::new(f));
    }

    pub fn on_exit<F: FnMut(u16, i32, i32) + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.exit = Some(Box::new(f));
    }

    pub fn on_rebase<F: FnMut(u16, i32, i32) + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.rebase = Some(Box::new(f));
    }

    /// Create (or reconfigure) a worker slot of `count` processes.
    pub fn init(&self, wid: u16, count: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .workers
            .entry(wid)
            .and_modify(|worker| worker.count = count.max(1))
            .or_insert(Worker {
                count: count.max(1),
                auto_restart: false,
            });
    }

    pub fn auto_restart(&self, wid: u16, enabled: bool) {
        if let Some(worker) = self.inner.lock().unwrap().workers.get_mut(&wid) {
            worker.auto_restart = enabled;
        }
    }

    // ===== interrogation =====

    /// True in the parent process.
    pub fn master(&self) -> bool {
        !self.inner.lock().unwrap().is_child
    }

    /// Whether any child of this worker slot is alive.
    pub fn working(&self, wid: u16) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.brokers.values().any(|broker| broker.wid == wid)
    }

    pub fn pids(&self, wid: u16) -> Vec<i32> {
        let inner = self.inner.lock().unwrap();
        let mut pids: Vec<i32> = inner
            .brokers
            .values()
            .filter(|broker| broker.wid == wid)
            .map(|broker| broker.pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Bytes queued towards one child, surfaced so supervisors can shed
    /// load (the channel itself never acknowledges).
    pub fn backlog(&self, _wid: u16, pid: i32) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .brokers
            .get(&pid)
            .map(|broker| broker.encoder.backlog())
            .unwrap_or(0)
    }

    // ===== lifecycle =====

    /// Fork the slot's workers. In the parent this returns after all forks;
    /// in each child it returns once the channel to the parent is up (the
    /// child then runs the reactor loop like any other process).
    pub fn start(&self, wid: u16) {
        self.zombie_check();
        let count = {
            let inner = self.inner.lock().unwrap();
            match inner.workers.get(&wid) {
                Some(worker) => worker.count,
                None => {
                    warn!("start of unknown worker slot {}", wid);
                    return;
                }
            }
        };

        self.setup_parent_plumbing();

        for index in 0..count {
            if !self.launch(wid, index) {
                // We are the child; stop forking siblings.
                return;
            }
        }
    }

    /// SIGTERM every child of the slot, without triggering auto-restart.
    pub fn stop(&self, wid: u16) {
        let (pids, restore) = {
            let mut inner = self.inner.lock().unwrap();
            let restore = inner
                .workers
                .get_mut(&wid)
                .map(|worker| {
                    let old = worker.auto_restart;
                    worker.auto_restart = false;
                    old
                })
                .unwrap_or(false);
            let pids: Vec<libc::pid_t> = inner
                .brokers
                .values()
                .filter(|broker| broker.wid == wid)
                .map(|broker| broker.pid)
                .collect();
            (pids, restore)
        };

        for pid in &pids {
            unsafe {
                libc::kill(*pid, libc::SIGTERM);
            }
        }
        for pid in pids {
            self.remove_broker(pid);
        }

        if let Some(worker) = self.inner.lock().unwrap().workers.get_mut(&wid) {
            worker.auto_restart = restore;
        }
    }

    /// SIGTERM and remove one specific child.
    pub fn erase(&self, wid: u16, pid: i32) {
        let known = {
            let inner = self.inner.lock().unwrap();
            inner
                .brokers
                .get(&pid)
                .map(|broker| broker.wid == wid)
                .unwrap_or(false)
        };
        if !known {
            return;
        }
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        self.remove_broker(pid);
    }

    /// Stop every slot and release the parent plumbing.
    pub fn close(&self) {
        let wids: Vec<u16> = self.inner.lock().unwrap().workers.keys().copied().collect();
        for wid in wids {
            self.stop(wid);
        }

        let (sigchld_item, ipc_item, ipc_listener, ipc_path) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(slot) = inner.sigchld_slot.take() {
                SIGCHLD_FDS[slot].store(-1, Ordering::Relaxed);
            }
            inner.sigchld_pipe = None;
            (
                inner.sigchld_item.take(),
                inner.ipc_item.take(),
                inner.ipc_listener.take(),
                inner.ipc_path.take(),
            )
        };
        if let Some(id) = sigchld_item {
            self.handle.del(id);
        }
        if let Some(id) = ipc_item {
            self.handle.del(id);
        }
        if let Some(fd) = ipc_listener {
            crate::sys::close_socket(fd);
        }
        if let Some(path) = ipc_path {
            let _ = std::fs::remove_file(path);
        }
    }

    // ===== messaging =====

    /// Child: send a GENERAL message to the parent.
    pub fn send(&self, _wid: u16, payload: &[u8]) -> bool {
        self.zombie_check();
        let pushed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.child.as_mut() {
                Some(link) => link.encoder.push(GENERAL, payload).is_ok(),
                None => false,
            }
        };
        if pushed {
            self.drain_child();
        }
        pushed
    }

    /// Parent: send a GENERAL message to one child.
    pub fn send_to(&self, wid: u16, pid: i32, payload: &[u8]) -> bool {
        let pushed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.brokers.get_mut(&pid) {
                Some(broker) if broker.wid == wid => {
                    broker.encoder.push(GENERAL, payload).is_ok()
                }
                _ => false,
            }
        };
        if pushed {
            self.drain_broker(pid);
        }
        pushed
    }

    /// Parent: send a GENERAL message to every child of the slot.
    ///
    /// Under sustained backpressure the per-child queues grow without
    /// bound; watch [`backlog`](Cluster::backlog).
    pub fn broadcast(&self, wid: u16, payload: &[u8]) {
        let pids: Vec<libc::pid_t> = {
            let inner = self.inner.lock().unwrap();
            inner
                .brokers
                .values()
                .filter(|broker| broker.wid == wid)
                .map(|broker| broker.pid)
                .collect()
        };
        for pid in pids {
            self.send_to(wid, pid, payload);
        }
    }

    // ===== parent plumbing =====

    /// SIGCHLD routing and, for the IPC transport, the listening socket.
    fn setup_parent_plumbing(&self) {
        let needs_sigchld = {
            let inner = self.inner.lock().unwrap();
            !inner.is_child && inner.sigchld_item.is_none()
        };
        if needs_sigchld {
            match self.install_sigchld() {
                Ok(()) => {}
                Err(err) => fatal(&format!("SIGCHLD plumbing failed: {}", err)),
            }
        }

        let needs_ipc = {
            let inner = self.inner.lock().unwrap();
            !inner.is_child
                && inner.transport == Transport::Ipc
                && inner.ipc_listener.is_none()
        };
        if needs_ipc {
            match self.install_ipc_listener() {
                Ok(()) => {}
                Err(err) => fatal(&format!("IPC listener failed: {}", err)),
            }
        }
    }

    fn install_sigchld(&self) -> io::Result<()> {
        let (receiver, sender) = crate::sys::pipe::new(true)?;
        let slot = SIGCHLD_FDS
            .iter()
            .position(|slot| {
                slot.compare_exchange(-1, sender.as_raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "too many clusters in this process")
            })?;

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = on_sigchld;
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let me = self.clone_parts();
        let item = self.handle.add(receiver.as_raw(), move |_, kind| {
            if kind == Kind::Read {
                me.reap_children();
            }
        })?;
        self.handle.mode(item, Kind::Read, Mode::Enabled);

        let mut inner = self.inner.lock().unwrap();
        inner.sigchld_item = Some(item);
        inner.sigchld_pipe = Some((receiver, sender));
        inner.sigchld_slot = Some(slot);
        Ok(())
    }

    /// The reactor item behind the self-pipe: reap everything reapable.
    fn reap_children(&self) {
        // Drain the pipe so the edge re-arms.
        {
            use std::io::Read;
            let inner = self.inner.lock().unwrap();
            if let Some((receiver, _)) = inner.sigchld_pipe.as_ref() {
                let mut buf = [0u8; 64];
                let mut receiver = receiver;
                while matches!(receiver.read(&mut buf), Ok(n) if n > 0) {}
            }
        }

        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if self.inner.lock().unwrap().brokers.contains_key(&pid) {
                self.process_exit(pid, status);
            } else {
                // Some other cluster in this process owns it.
                unclaimed_exits().lock().unwrap().insert(pid, status);
            }
        }

        // Pick up our children that another cluster's wait loop reaped.
        let mine: Vec<(libc::pid_t, libc::c_int)> = {
            let inner = self.inner.lock().unwrap();
            let mut unclaimed = unclaimed_exits().lock().unwrap();
            let pids: Vec<libc::pid_t> = unclaimed
                .keys()
                .filter(|pid| inner.brokers.contains_key(pid))
                .copied()
                .collect();
            pids.iter()
                .filter_map(|pid| unclaimed.remove(pid).map(|status| (*pid, status)))
                .collect()
        };
        for (pid, status) in mine {
            self.process_exit(pid, status);
        }
    }

    /// One reaped child: notify, then restart or forget.
    fn process_exit(&self, pid: libc::pid_t, status: libc::c_int) {
        let (wid, index, lifetime, restart) = {
            let inner = self.inner.lock().unwrap();
            let Some(broker) = inner.brokers.get(&pid) else {
                return;
            };
            let lifetime = broker.started.elapsed();
            let restart = inner
                .workers
                .get(&broker.wid)
                .map(|worker| worker.auto_restart)
                .unwrap_or(false)
                && lifetime > inner.restart_threshold
                && exit_code(status) != 0;
            (broker.wid, broker.index, lifetime, restart)
        };

        trace!(
            "child {} of slot {} exited (status {}, lived {:?})",
            pid,
            wid,
            exit_code(status),
            lifetime
        );
        self.remove_broker(pid);
        self.fire_exit(wid, pid, exit_code(status));

        if restart {
            if self.launch(wid, index) {
                let new_pid = {
                    let inner = self.inner.lock().unwrap();
                    inner
                        .brokers
                        .values()
                        .find(|broker| broker.wid == wid && broker.index == index)
                        .map(|broker| broker.pid)
                };
                if let Some(new_pid) = new_pid {
                    self.fire_rebase(wid, new_pid, pid);
                }
            }
        }
    }

    fn install_ipc_listener(&self) -> io::Result<()> {
        let path = {
            let inner = self.inner.lock().unwrap();
            ipc_path(&inner.name, inner.parent_pid)
        };
        // A stale socket file from a dead predecessor would break bind.
        let _ = std::fs::remove_file(&path);

        let listener = socket::new_socket(libc::AF_UNIX, libc::SOCK_STREAM, 0)?;
        use std::os::fd::IntoRawFd;
        let fd = listener.into_raw_fd();

        let addr = unix_addr(&path)?;
        let res = unsafe {
            libc::bind(
                fd,
                &addr.0 as *const libc::sockaddr_un as *const libc::sockaddr,
                addr.1,
            )
        };
        if res != 0 {
            let err = io::Error::last_os_error();
            crate::sys::close_socket(fd);
            return Err(err);
        }
        if unsafe { libc::listen(fd, 64) } != 0 {
            let err = io::Error::last_os_error();
            crate::sys::close_socket(fd);
            return Err(err);
        }

        let me = self.clone_parts();
        let item = self.handle.add(fd, move |_, kind| {
            if kind == Kind::Read {
                me.accept_ipc();
            }
        })?;
        self.handle.mode(item, Kind::Read, Mode::Enabled);

        let mut inner = self.inner.lock().unwrap();
        inner.ipc_listener = Some(fd);
        inner.ipc_item = Some(item);
        inner.ipc_path = Some(path);
        Ok(())
    }

    /// Accept IPC connections; each stays pending until its HELLO names
    /// the owning child.
    fn accept_ipc(&self) {
        loop {
            let listener = match self.inner.lock().unwrap().ipc_listener {
                Some(fd) => fd,
                None => return,
            };
            let socket =
                unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if socket < 0 {
                return;
            }
            if socket::set_nonblocking(socket, true).is_err() {
                crate::sys::close_socket(socket);
                continue;
            }

            let me = self.clone_parts();
            let item = match self.handle.add(socket, move |_, kind| match kind {
                Kind::Read => me.pump_parent_read(socket),
                Kind::Write => me.pump_parent_write_fd(socket),
                _ => {}
            }) {
                Ok(item) => item,
                Err(err) => {
                    warn!("IPC accept registration failed: {}", err);
                    crate::sys::close_socket(socket);
                    continue;
                }
            };
            self.handle.mode(item, Kind::Read, Mode::Enabled);

            let mut inner = self.inner.lock().unwrap();
            let transform = inner.transform.clone();
            inner.ipc_pending.push(PendingIpc {
                socket,
                item,
                decoder: Decoder::new(transform),
            });
        }
    }

    // ===== forking =====

    /// Fork one worker. Returns true in the parent, false in the child.
    fn launch(&self, wid: u16, index: u16) -> bool {
        let transport = self.inner.lock().unwrap().transport;
        match transport {
            Transport::Pipe => self.launch_pipe(wid, index),
            Transport::Ipc => self.launch_ipc(wid, index),
        }
    }

    fn launch_pipe(&self, wid: u16, index: u16) -> bool {
        use std::os::fd::IntoRawFd;

        let mfds = match socket::socketpair() {
            Ok(pair) => pair,
            Err(err) => fatal(&format!("socketpair failed: {}", err)),
        };
        let cfds = match socket::socketpair() {
            Ok(pair) => pair,
            Err(err) => fatal(&format!("socketpair failed: {}", err)),
        };
        let [mfd0, mfd1] = mfds;
        let [cfd0, cfd1] = cfds;
        let mfds = [mfd0.into_raw_fd(), mfd1.into_raw_fd()];
        let cfds = [cfd0.into_raw_fd(), cfd1.into_raw_fd()];

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            fatal(&format!("fork failed: {}", io::Error::last_os_error()));
        }

        if pid == 0 {
            // Child reads cfds[0] and writes mfds[1]; the parent's halves
            // go away.
            crate::sys::close_socket(mfds[0]);
            crate::sys::close_socket(cfds[1]);
            self.child_setup(wid, cfds[0], mfds[1]);
            false
        } else {
            // Parent reads mfds[0] and writes cfds[1].
            crate::sys::close_socket(mfds[1]);
            crate::sys::close_socket(cfds[0]);
            self.parent_register(wid, index, pid, mfds[0], cfds[1]);
            true
        }
    }

    fn launch_ipc(&self, wid: u16, index: u16) -> bool {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            fatal(&format!("fork failed: {}", io::Error::last_os_error()));
        }

        if pid == 0 {
            let socket = match self.connect_ipc() {
                Ok(socket) => socket,
                Err(err) => fatal(&format!("IPC connect failed: {}", err)),
            };
            self.child_setup(wid, socket, socket);
            false
        } else {
            // The channel materializes when the child's HELLO arrives on
            // the accepted socket; record the slot member now.
            self.parent_register(wid, index, pid, crate::INVALID_SOCKET, crate::INVALID_SOCKET);
            true
        }
    }

    fn connect_ipc(&self) -> io::Result<OsSocket> {
        use std::os::fd::IntoRawFd;

        let (path, _) = {
            let inner = self.inner.lock().unwrap();
            (ipc_path(&inner.name, inner.parent_pid), ())
        };
        let socket = socket::new_socket(libc::AF_UNIX, libc::SOCK_STREAM, 0)?;
        let fd = socket.into_raw_fd();
        // The handshake is blocking on purpose: HELLO must be first.
        socket::set_nonblocking(fd, false)?;

        let addr = unix_addr(&path)?;
        let res = unsafe {
            libc::connect(
                fd,
                &addr.0 as *const libc::sockaddr_un as *const libc::sockaddr,
                addr.1,
            )
        };
        if res != 0 {
            let err = io::Error::last_os_error();
            crate::sys::close_socket(fd);
            return Err(err);
        }
        Ok(fd)
    }

    /// Parent bookkeeping for a fresh child.
    fn parent_register(
        &self,
        wid: u16,
        index: u16,
        pid: libc::pid_t,
        read_fd: OsSocket,
        write_fd: OsSocket,
    ) {
        let mut read_item = None;
        let mut write_item = None;

        if read_fd != crate::INVALID_SOCKET {
            // Own halves are non-blocking; the child's halves stay
            // blocking for its HELLO.
            let _ = socket::set_nonblocking(read_fd, true);
            let _ = socket::set_nonblocking(write_fd, true);

            let me = self.clone_parts();
            match self.handle.add(read_fd, move |_, kind| {
                if kind == Kind::Read {
                    me.pump_parent_read(read_fd);
                }
            }) {
                Ok(item) => {
                    self.handle.mode(item, Kind::Read, Mode::Enabled);
                    read_item = Some(item);
                }
                Err(err) => warn!("broker read registration failed: {}", err),
            }

            let me = self.clone_parts();
            match self.handle.add(write_fd, move |_, kind| {
                if kind == Kind::Write {
                    me.pump_parent_write_fd(write_fd);
                }
            }) {
                Ok(item) => write_item = Some(item),
                Err(err) => warn!("broker write registration failed: {}", err),
            }
        }

        let chunk = if write_fd != crate::INVALID_SOCKET {
            socket::send_buffer_size(write_fd).unwrap_or(64 * 1024)
        } else {
            64 * 1024
        };

        let mut inner = self.inner.lock().unwrap();
        let transform = inner.transform.clone();
        inner.brokers.insert(
            pid,
            Broker {
                wid,
                index,
                pid,
                started: Instant::now(),
                read_fd,
                write_fd,
                read_item,
                write_item,
                encoder: Encoder::new(transform.clone(), chunk),
                decoder: Decoder::new(transform),
                hello: false,
            },
        );
        inner.pids.insert(pid, wid);
        trace!("worker {}/{} forked as pid {}", wid, index, pid);
    }

    /// Everything the child does between fork and returning to the user's
    /// reactor loop.
    fn child_setup(&self, wid: u16, read_fd: OsSocket, write_fd: OsSocket) {
        let pid = unsafe { libc::getpid() };

        // Inherited parent-side plumbing is meaningless here: sibling
        // channels, the SIGCHLD pipe and the IPC listener all go, while
        // the user's own registrations survive the rebase.
        let mut stale_items: Vec<ItemId> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.is_child = true;
            // A fresh child has no children of its own; every inherited
            // handler slot is stale here.
            for slot in &SIGCHLD_FDS {
                slot.store(-1, Ordering::Relaxed);
            }
            inner.sigchld_slot = None;

            let brokers = std::mem::take(&mut inner.brokers);
            for broker in brokers.values() {
                stale_items.extend(broker.read_item.into_iter());
                stale_items.extend(broker.write_item.into_iter());
                if broker.read_fd != crate::INVALID_SOCKET {
                    crate::sys::close_socket(broker.read_fd);
                }
                if broker.write_fd != crate::INVALID_SOCKET
                    && broker.write_fd != broker.read_fd
                {
                    crate::sys::close_socket(broker.write_fd);
                }
            }
            inner.pids.clear();
            if let Some(fd) = inner.ipc_listener.take() {
                crate::sys::close_socket(fd);
            }
            stale_items.extend(inner.ipc_item.take().into_iter());
            stale_items.extend(inner.sigchld_item.take().into_iter());
            for pending in inner.ipc_pending.drain(..) {
                stale_items.push(pending.item);
                crate::sys::close_socket(pending.socket);
            }
            inner.ipc_path = None;
            inner.sigchld_pipe = None;
        }
        for item in stale_items {
            self.handle.del(item);
        }

        // Fresh OS selector; surviving items are re-registered onto it.
        if let Err(err) = self.handle.rebase_after_fork() {
            fatal(&format!("reactor rebase in child failed: {}", err));
        }

        // HELLO first, over a still-blocking descriptor, so the parent's
        // ready callback can never observe anything else.
        let chunk = socket::send_buffer_size(write_fd).unwrap_or(64 * 1024);
        let transform = self.inner.lock().unwrap().transform.clone();
        let mut encoder = Encoder::new(transform.clone(), chunk);
        if encoder.push(HELLO, &pid.to_ne_bytes()).is_err() {
            fatal("child HELLO could not be framed");
        }
        let _ = socket::set_nonblocking(write_fd, false);
        while let Some(chunk_bytes) = encoder.next_chunk() {
            match crate::sys::write(write_fd, chunk_bytes) {
                Ok(n) => encoder.advance(n),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => fatal(&format!("child HELLO write failed: {}", err)),
            }
        }
        let _ = socket::set_nonblocking(write_fd, true);
        let _ = socket::set_nonblocking(read_fd, true);

        let me = self.clone_parts();
        // On a shared IPC socket this item also carries WRITE readiness.
        let read_item = match self.handle.add(read_fd, move |_, kind| match kind {
            Kind::Read => me.pump_child_read(),
            Kind::Write => me.drain_child(),
            _ => {}
        }) {
            Ok(item) => {
                self.handle.mode(item, Kind::Read, Mode::Enabled);
                Some(item)
            }
            Err(err) => fatal(&format!("child channel registration failed: {}", err)),
        };

        let write_item = if write_fd != read_fd {
            let me = self.clone_parts();
            match self.handle.add(write_fd, move |_, kind| {
                if kind == Kind::Write {
                    me.drain_child();
                }
            }) {
                Ok(item) => Some(item),
                Err(err) => {
                    warn!("child write registration failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let mut inner = self.inner.lock().unwrap();
        inner.child = Some(ChildLink {
            wid,
            read_fd,
            write_fd,
            read_item,
            write_item,
            encoder,
            decoder: Decoder::new(transform),
        });
        trace!("child {} attached to slot {}", pid, wid);
    }

    // ===== pumps =====

    /// Parent: bytes from a child (or a pending IPC socket).
    fn pump_parent_read(&self, fd: OsSocket) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match crate::sys::read(fd, &mut buf) {
                Ok(0) => {
                    self.parent_channel_gone(fd);
                    return;
                }
                Ok(n) => self.parent_bytes(fd, &buf[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("broker read failed: {}", err);
                    self.parent_channel_gone(fd);
                    return;
                }
            }
        }
    }

    fn parent_bytes(&self, fd: OsSocket, bytes: &[u8]) {
        enum Origin {
            Broker(libc::pid_t),
            Pending(usize),
            Unknown,
        }
        let origin = {
            let inner = self.inner.lock().unwrap();
            if let Some(broker) = inner.brokers.values().find(|broker| broker.read_fd == fd) {
                Origin::Broker(broker.pid)
            } else if let Some(pos) = inner
                .ipc_pending
                .iter()
                .position(|pending| pending.socket == fd)
            {
                Origin::Pending(pos)
            } else {
                Origin::Unknown
            }
        };

        let mut messages: Vec<(u8, Vec<u8>)> = Vec::new();
        match origin {
            Origin::Broker(pid) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(broker) = inner.brokers.get_mut(&pid) {
                    let fed = broker
                        .decoder
                        .feed(bytes, |id, body| messages.push((id, body.to_vec())));
                    if let Err(err) = fed {
                        warn!("broker stream from {} corrupt: {}", pid, err);
                        return;
                    }
                }
                drop(inner);
                self.parent_messages(pid, messages);
            }
            Origin::Pending(pos) => {
                let mut inner = self.inner.lock().unwrap();
                let pending = &mut inner.ipc_pending[pos];
                let fed = pending
                    .decoder
                    .feed(bytes, |id, body| messages.push((id, body.to_vec())));
                if fed.is_err() {
                    let pending = inner.ipc_pending.remove(pos);
                    drop(inner);
                    self.handle.del(pending.item);
                    crate::sys::close_socket(pending.socket);
                    return;
                }
                // The first message must be HELLO naming the child.
                let hello_pid = match messages.first() {
                    Some((id, body)) if *id == HELLO && body.len() >= 4 => {
                        Some(libc::pid_t::from_ne_bytes([
                            body[0], body[1], body[2], body[3],
                        ]))
                    }
                    _ => None,
                };
                if let Some(pid) = hello_pid {
                    let pending = inner.ipc_pending.remove(pos);
                    drop(inner);
                    self.adopt_ipc_channel(pid, pending);
                    self.parent_messages(pid, messages);
                    self.drain_broker(pid);
                }
            }
            Origin::Unknown => {}
        }
    }

    /// Wire an accepted-and-identified IPC socket into its broker.
    fn adopt_ipc_channel(&self, pid: libc::pid_t, pending: PendingIpc) {
        let chunk = socket::send_buffer_size(pending.socket).unwrap_or(64 * 1024);
        let mut inner = self.inner.lock().unwrap();
        if let Some(broker) = inner.brokers.get_mut(&pid) {
            broker.read_fd = pending.socket;
            broker.write_fd = pending.socket;
            broker.read_item = Some(pending.item);
            broker.write_item = Some(pending.item);
            broker.decoder = pending.decoder;
            // Anything broadcast before the channel came up stays queued.
            broker.encoder.set_chunk(chunk);
        } else {
            drop(inner);
            warn!("IPC HELLO from unknown pid {}", pid);
            self.handle.del(pending.item);
            crate::sys::close_socket(pending.socket);
        }
    }

    /// Deliver decoded parent-side messages.
    fn parent_messages(&self, pid: libc::pid_t, messages: Vec<(u8, Vec<u8>)>) {
        for (id, body) in messages {
            match id {
                HELLO => {
                    let wid = {
                        let mut inner = self.inner.lock().unwrap();
                        match inner.brokers.get_mut(&pid) {
                            Some(broker) if !broker.hello => {
                                broker.hello = true;
                                Some(broker.wid)
                            }
                            _ => None,
                        }
                    };
                    if let Some(wid) = wid {
                        self.fire_ready(wid, pid);
                    }
                }
                GENERAL => {
                    let wid = {
                        let inner = self.inner.lock().unwrap();
                        inner.pids.get(&pid).copied()
                    };
                    if let Some(wid) = wid {
                        self.fire_message(wid, pid, &body);
                    }
                }
                other => warn!("unknown message id {} from pid {}", other, pid),
            }
        }
    }

    /// Parent: a child's channel hit EOF or an error.
    fn parent_channel_gone(&self, fd: OsSocket) {
        let pid = {
            let inner = self.inner.lock().unwrap();
            inner
                .brokers
                .values()
                .find(|broker| broker.read_fd == fd)
                .map(|broker| broker.pid)
        };
        // The SIGCHLD path owns the exit bookkeeping; here only the
        // channel dies.
        if let Some(pid) = pid {
            trace!("channel to child {} closed", pid);
        }
    }

    /// Parent: writable event on a broker channel.
    fn pump_parent_write_fd(&self, fd: OsSocket) {
        let pid = {
            let inner = self.inner.lock().unwrap();
            inner
                .brokers
                .values()
                .find(|broker| broker.write_fd == fd)
                .map(|broker| broker.pid)
        };
        if let Some(pid) = pid {
            self.drain_broker(pid);
        }
    }

    /// Parent: push queued bytes towards one child until empty or full.
    fn drain_broker(&self, pid: libc::pid_t) {
        loop {
            let (fd, chunk, write_item) = {
                let inner = self.inner.lock().unwrap();
                let Some(broker) = inner.brokers.get(&pid) else {
                    return;
                };
                if broker.write_fd == crate::INVALID_SOCKET {
                    // IPC channel not adopted yet; bytes wait.
                    return;
                }
                match broker.encoder.next_chunk() {
                    Some(chunk) => (broker.write_fd, chunk.to_vec(), broker.write_item),
                    None => {
                        let item = broker.write_item;
                        drop(inner);
                        if let Some(item) = item {
                            self.handle.mode(item, Kind::Write, Mode::Disabled);
                        }
                        return;
                    }
                }
            };

            match crate::sys::write(fd, &chunk) {
                Ok(n) => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(broker) = inner.brokers.get_mut(&pid) {
                        broker.encoder.advance(n);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(item) = write_item {
                        self.handle.mode(item, Kind::Write, Mode::Enabled);
                    }
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("write to child {} failed: {}", pid, err);
                    return;
                }
            }
        }
    }

    /// Child: bytes from the parent.
    fn pump_child_read(&self) {
        self.zombie_check();
        let fd = match self.inner.lock().unwrap().child.as_ref() {
            Some(link) => link.read_fd,
            None => return,
        };

        let mut buf = [0u8; 64 * 1024];
        loop {
            match crate::sys::read(fd, &mut buf) {
                Ok(0) => {
                    // The parent is gone; a worker without a master has no
                    // purpose.
                    error!("parent channel closed, child exiting");
                    std::process::exit(libc::EXIT_FAILURE);
                }
                Ok(n) => {
                    let mut messages: Vec<(u8, Vec<u8>)> = Vec::new();
                    let (wid, parent) = {
                        let mut inner = self.inner.lock().unwrap();
                        let parent = inner.parent_pid;
                        let Some(link) = inner.child.as_mut() else {
                            return;
                        };
                        let wid = link.wid;
                        if let Err(err) = link
                            .decoder
                            .feed(&buf[..n], |id, body| messages.push((id, body.to_vec())))
                        {
                            warn!("parent stream corrupt: {}", err);
                            return;
                        }
                        (wid, parent)
                    };
                    for (id, body) in messages {
                        if id == GENERAL {
                            self.fire_message(wid, parent, &body);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("child read failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Child: push queued bytes towards the parent until empty or full.
    fn drain_child(&self) {
        loop {
            let (fd, chunk, write_item, read_item) = {
                let inner = self.inner.lock().unwrap();
                let Some(link) = inner.child.as_ref() else {
                    return;
                };
                match link.encoder.next_chunk() {
                    Some(chunk) => (
                        link.write_fd,
                        chunk.to_vec(),
                        link.write_item,
                        link.read_item,
                    ),
                    None => {
                        let items = (link.write_item, link.read_item);
                        drop(inner);
                        // Shared-socket channels carry WRITE on the read
                        // item.
                        if let Some(item) = items.0.or(items.1) {
                            self.handle.mode(item, Kind::Write, Mode::Disabled);
                        }
                        return;
                    }
                }
            };

            match crate::sys::write(fd, &chunk) {
                Ok(n) => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(link) = inner.child.as_mut() {
                        link.encoder.advance(n);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(item) = write_item.or(read_item) {
                        self.handle.mode(item, Kind::Write, Mode::Enabled);
                    }
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("write to parent failed: {}", err);
                    return;
                }
            }
        }
    }

    // ===== helpers =====

    /// A process whose recorded parent no longer matches reality has been
    /// orphaned or adopted; it self-destructs.
    fn zombie_check(&self) {
        let (is_child, parent) = {
            let inner = self.inner.lock().unwrap();
            (inner.is_child, inner.parent_pid)
        };
        if is_child && unsafe { libc::getppid() } != parent {
            error!(
                "process {} has turned into a zombie, self-destructing",
                unsafe { libc::getpid() }
            );
            std::process::exit(libc::EXIT_FAILURE);
        }
    }

    fn remove_broker(&self, pid: libc::pid_t) {
        let broker = {
            let mut inner = self.inner.lock().unwrap();
            inner.pids.remove(&pid);
            inner.brokers.remove(&pid)
        };
        let Some(broker) = broker else {
            return;
        };
        for item in [broker.read_item, broker.write_item].into_iter().flatten() {
            self.handle.del(item);
        }
        if broker.read_fd != crate::INVALID_SOCKET {
            crate::sys::close_socket(broker.read_fd);
        }
        if broker.write_fd != crate::INVALID_SOCKET && broker.write_fd != broker.read_fd {
            crate::sys::close_socket(broker.write_fd);
        }
    }

    fn fire_ready(&self, wid: u16, pid: libc::pid_t) {
        let callback = self.inner.lock().unwrap().callbacks.ready.take();
        if let Some(mut callback) = callback {
            callback(wid, pid);
            let mut inner = self.inner.lock().unwrap();
            if inner.callbacks.ready.is_none() {
                inner.callbacks.ready = Some(callback);
            }
        }
    }

    fn fire_message(&self, wid: u16, pid: libc::pid_t, body: &[u8]) {
        let callback = self.inner.lock().unwrap().callbacks.message.take();
        if let Some(mut callback) = callback {
            callback(wid, pid, body);
            let mut inner = self.inner.lock().unwrap();
            if inner.callbacks.message.is_none() {
                inner.callbacks.message = Some(callback);
            }
        }
    }

    fn fire_exit(&self, wid: u16, pid: libc::pid_t, status: i32) {
        let callback = self.inner.lock().unwrap().callbacks.exit.take();
        if let Some(mut callback) = callback {
            callback(wid, pid, status);
            let mut inner = self.inner.lock().unwrap();
            if inner.callbacks.exit.is_none() {
                inner.callbacks.exit = Some(callback);
            }
        }
    }

    fn fire_rebase(&self, wid: u16, new_pid: libc::pid_t, old_pid: libc::pid_t) {
        let callback = self.inner.lock().unwrap().callbacks.rebase.take();
        if let Some(mut callback) = callback {
            callback(wid, new_pid, old_pid);
            let mut inner = self.inner.lock().unwrap();
            if inner.callbacks.rebase.is_none() {
                inner.callbacks.rebase = Some(callback);
            }
        }
    }

    fn clone_parts(&self) -> Cluster {
        Cluster {
            handle: self.handle.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Cluster")
            .field("name", &inner.name)
            .field("transport", &inner.transport)
            .field("is_child", &inner.is_child)
            .field("brokers", &inner.brokers.len())
            .finish()
    }
}

/// `/tmp/<name>_cluster_<parent_pid>.sock`
fn ipc_path(name: &str, parent: libc::pid_t) -> PathBuf {
    PathBuf::from(format!("/tmp/{}_cluster_{}.sock", name, parent))
}

fn unix_addr(path: &std::path::Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

/// Startup failures in cluster bring-up leave the process unable to do its
/// job; log and exit.
fn fatal(message: &str) -> ! {
    error!("cluster fatal: {}", message);
    std::process::exit(libc::EXIT_FAILURE);
}
