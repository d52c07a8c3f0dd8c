//! Client connection lifecycle.
//!
//! A [`Client`] drives one logical connection described by a [`Scheme`]:
//! resolve the host through the DNS collaborator, create and tune the
//! socket, optionally wrap it in TLS, connect without blocking, pump bytes
//! through a [`Transfer`], and on failure either reconnect on a timer or
//! report disconnection. A proxy handshake can hand the established socket
//! over to the ultimate destination without reconnecting.
//!
//! DNS, TLS and URI handling live behind narrow collaborator traits; the
//! client never parses names, certificates or URLs itself.

mod scheme;

pub use self::scheme::{KeepAlive, Pending, Proxy, Scheme, SocketKind, Status, Work};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{trace, warn};

use crate::net::{Family, Proto, Socket};
use crate::reactor::{Handle, ItemId, Kind, Mode};
use crate::transfer::{Io, Link, Marks, SocketLink, Transfer};
use crate::OsSocket;

/// Default interval between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// DNS collaborator: asynchronous resolution with a blacklist.
///
/// `resolve` returns a request id; the host later feeds the answer back
/// through [`Client::resolved`].
pub trait Resolver: Send {
    fn resolve(&mut self, domain: &str, family: Family) -> u64;
    fn cancel(&mut self, request: u64);
    fn blacklist(&mut self, family: Family, ip: &str);
    fn flush(&mut self);
}

/// Which role a wrapped socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

/// TLS collaborator: wraps an established socket and then carries all of
/// its reads and writes with the `{n, 0, -1, -2}` convention of
/// [`Io`].
pub trait TlsEngine: Send {
    /// Wrap a client socket for `url` (SNI comes from the URL).
    fn wrap_client(&mut self, socket: OsSocket, url: &str) -> io::Result<()>;
    fn wrap(&mut self, socket: OsSocket, mode: TlsMode) -> io::Result<()>;
    fn is_tls(&self) -> bool;
    /// Apply bandwidth shaping to the wrapped connection.
    fn buffer(&mut self, read_bps: usize, write_bps: usize, priority: bool);
    fn read(&mut self, buf: &mut [u8]) -> Io;
    fn write(&mut self, buf: &[u8]) -> Io;
    /// Drop the wrapping, leaving the raw socket usable.
    fn clear(&mut self);
}

/// URI collaborator.
pub trait UriCombiner: Send {
    /// Resolve `relative` against `base` into an absolute URL.
    fn combine(&self, base: &str, relative: &str) -> String;
}

/// Connection-lifecycle callbacks.
#[derive(Default)]
pub struct ClientCallbacks {
    /// Fully connected (TLS up, if any).
    pub connect: Option<Box<dyn FnMut() + Send>>,
    /// Connected to the proxy; run the proxy handshake, then call
    /// [`Client::switch_proxy`].
    pub connect_proxy: Option<Box<dyn FnMut() + Send>>,
    /// Out of attempts, or a non-recoverable failure with `alive` off.
    pub disconnect: Option<Box<dyn FnMut() + Send>>,
    /// Bytes from the connection.
    pub read: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// The outbound buffer drained; more data is welcome.
    pub drain: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for ClientCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCallbacks")
            .field("connect", &self.connect.is_some())
            .field("read", &self.read.is_some())
            .finish()
    }
}

struct TlsLink {
    tls: Arc<Mutex<Box<dyn TlsEngine>>>,
    datagram: bool,
}

impl Link for TlsLink {
    fn read(&mut self, buf: &mut [u8]) -> Io {
        self.tls.lock().unwrap().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Io {
        self.tls.lock().unwrap().write(buf)
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

struct Inner {
    scheme: Arc<Scheme>,
    resolver: Box<dyn Resolver>,
    uri: Option<Box<dyn UriCombiner>>,
    cache: HashMap<(Family, String), String>,
    pending_resolve: Option<u64>,
    attempts_left: u8,
    socket: Option<Socket>,
    connect_item: Option<ItemId>,
    reconnect_timer: Option<ItemId>,
    transfer: Option<Arc<Transfer>>,
    callbacks: ClientCallbacks,
    marks: Marks,
    reconnect_delay: Duration,
    /// True while the proxy leg, not the destination, is connected.
    proxy_leg: bool,
}

/// The client core; see the [module docs](self).
pub struct Client {
    handle: Handle,
    inner: Arc<Mutex<Inner>>,
    tls: Option<Arc<Mutex<Box<dyn TlsEngine>>>>,
}

impl Client {
    pub fn new(handle: Handle, scheme: Arc<Scheme>, resolver: Box<dyn Resolver>) -> Client {
        let attempts = scheme.attempts;
        Client {
            handle,
            inner: Arc::new(Mutex::new(Inner {
                scheme,
                resolver,
                uri: None,
                cache: HashMap::new(),
                pending_resolve: None,
                attempts_left: attempts,
                socket: None,
                connect_item: None,
                reconnect_timer: None,
                transfer: None,
                callbacks: ClientCallbacks::default(),
                marks: Marks::default(),
                reconnect_delay: RECONNECT_DELAY,
                proxy_leg: false,
            })),
            tls: None,
        }
    }

    /// Attach the TLS collaborator, required for TLS/DTLS schemes.
    pub fn tls(&mut self, engine: Box<dyn TlsEngine>) {
        self.tls = Some(Arc::new(Mutex::new(engine)));
    }

    /// Attach the URI collaborator used to derive the destination URL when
    /// switching off a proxy.
    pub fn uri(&mut self, uri: Box<dyn UriCombiner>) {
        self.inner.lock().unwrap().uri = Some(uri);
    }

    pub fn on_connect<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.connect = Some(Box::new(f));
    }

    pub fn on_connect_proxy<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.connect_proxy = Some(Box::new(f));
    }

    pub fn on_disconnect<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.disconnect = Some(Box::new(f));
    }

    pub fn on_read<F: FnMut(&[u8]) + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.read = Some(Box::new(f));
    }

    pub fn on_drain<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().callbacks.drain = Some(Box::new(f));
    }

    pub fn set_marks(&self, marks: Marks) {
        self.inner.lock().unwrap().marks = marks;
    }

    /// Override the pause between reconnect attempts (default 5 s).
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().reconnect_delay = delay;
    }

    pub fn scheme(&self) -> Arc<Scheme> {
        Arc::clone(&self.inner.lock().unwrap().scheme)
    }

    /// Begin a connect attempt.
    ///
    /// Returns false when an attempt is already in flight (the per-scheme
    /// guard) or the host must first resolve through DNS; in the latter
    /// case the attempt continues from [`Client::resolved`].
    pub fn connect(&self) -> bool {
        let target = {
            let mut inner = self.inner.lock().unwrap();
            let scheme = Arc::clone(&inner.scheme);
            if !scheme.claim() {
                trace!("connect suppressed: attempt already in flight");
                return false;
            }
            inner.attempts_left = scheme.attempts;

            let (family, host) = self.target_endpoint(&inner);
            match self.lookup(&mut inner, family, &host) {
                Lookup::Ready(ip) => Some(ip),
                Lookup::InFlight => None,
            }
        };
        match target {
            Some(ip) => self.connect_ip(&ip),
            // The attempt continues from `resolved`.
            None => true,
        }
    }

    /// DNS continuation: the collaborator answered `request` with `ip`
    /// (empty on failure).
    pub fn resolved(&self, request: u64, ip: &str, family: Family) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_resolve != Some(request) {
                return;
            }
            inner.pending_resolve = None;
            if !ip.is_empty() {
                let (_, host) = self.target_endpoint(&inner);
                inner.cache.insert((family, host), ip.to_owned());
            }
        }
        if ip.is_empty() {
            self.retry_or_disconnect();
        } else {
            self.connect_ip(ip);
        }
    }

    /// Queue bytes on the established connection.
    pub fn send(&self, bytes: &[u8]) -> bool {
        // Cloned out so the pump's drain callback can re-enter the client.
        let transfer = self.inner.lock().unwrap().transfer.clone();
        match transfer {
            Some(transfer) => {
                transfer.send(bytes);
                true
            }
            None => false,
        }
    }

    /// The proxy handshake finished: keep the socket, rewrap TLS for the
    /// ultimate destination, and restart reading. The scheme's status is
    /// left untouched.
    pub fn switch_proxy(&self) -> bool {
        let (socket, url) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.proxy_leg {
                return false;
            }
            inner.proxy_leg = false;
            let socket = match inner.socket.as_ref() {
                Some(socket) => socket.raw(),
                None => return false,
            };
            let url = match (inner.uri.as_ref(), inner.scheme.proxy.as_ref()) {
                (Some(uri), Some(proxy)) => uri.combine(&proxy.url, &inner.scheme.url),
                _ => inner.scheme.url.clone(),
            };
            (socket, url)
        };

        if let Some(tls) = self.tls.as_ref() {
            let mut engine = tls.lock().unwrap();
            engine.clear();
            if let Err(err) = engine.wrap_client(socket, &url) {
                warn!("TLS rewrap for {} failed: {}", url, err);
                return false;
            }
        }

        let transfer = self.inner.lock().unwrap().transfer.clone();
        match transfer {
            Some(transfer) => transfer.start(),
            None => false,
        }
    }

    /// Tear the connection down and cancel pending reconnects.
    pub fn close(&self) {
        let (scheme, reconnect, connect_item, transfer, resolve) = {
            let mut inner = self.inner.lock().unwrap();
            (
                Arc::clone(&inner.scheme),
                inner.reconnect_timer.take(),
                inner.connect_item.take(),
                inner.transfer.take(),
                inner.pending_resolve.take(),
            )
        };
        if let Some(id) = reconnect {
            self.handle.del(id);
        }
        if let Some(id) = connect_item {
            self.handle.del(id);
        }
        if let Some(transfer) = transfer {
            transfer.close();
        }
        if let Some(request) = resolve {
            self.inner.lock().unwrap().resolver.cancel(request);
        }
        self.inner.lock().unwrap().socket = None;
        scheme.release(Status::Disconnect, Pending::Disconnect);
    }

    // ===== internals =====

    /// The endpoint this attempt dials: the proxy when one is configured.
    fn target_endpoint(&self, inner: &Inner) -> (Family, String) {
        match inner.scheme.proxy.as_ref() {
            Some(proxy) => (proxy.family, proxy.host.clone()),
            None => (inner.scheme.family, inner.scheme.host.clone()),
        }
    }

    fn lookup(&self, inner: &mut Inner, family: Family, host: &str) -> Lookup {
        if host.parse::<IpAddr>().is_ok() {
            return Lookup::Ready(host.to_owned());
        }
        if let Some(ip) = inner.cache.get(&(family, host.to_owned())) {
            return Lookup::Ready(ip.clone());
        }
        let request = inner.resolver.resolve(host, family);
        inner.pending_resolve = Some(request);
        Lookup::InFlight
    }

    fn connect_ip(&self, ip: &str) -> bool {
        match self.try_connect(ip) {
            Ok(()) => true,
            Err(err) => {
                warn!("connect to {} failed: {}", ip, err);
                let (family, _) = {
                    let inner = self.inner.lock().unwrap();
                    self.target_endpoint(&inner)
                };
                self.inner.lock().unwrap().resolver.blacklist(family, ip);
                self.retry_or_disconnect();
                false
            }
        }
    }

    fn try_connect(&self, ip: &str) -> io::Result<()> {
        let (scheme, proxy_leg, marks) = {
            let inner = self.inner.lock().unwrap();
            (
                Arc::clone(&inner.scheme),
                inner.scheme.proxy.is_some(),
                inner.marks,
            )
        };
        let (family, kind, port) = match scheme.proxy.as_ref() {
            Some(proxy) => (proxy.family, proxy.kind, proxy.port),
            None => (scheme.family, scheme.kind, scheme.port),
        };

        let proto = if kind.is_datagram() { Proto::Udp } else { Proto::Tcp };
        let socket = Socket::new(family, proto)?;

        let (recv, send) = scheme.buffers;
        if recv > 0 {
            socket.set_recv_buffer_size(recv)?;
        }
        if send > 0 {
            socket.set_send_buffer_size(send)?;
        }
        socket.set_reuseaddr(true)?;
        if scheme.keep_alive.enabled && !kind.is_datagram() {
            socket.set_keepalive(
                scheme.keep_alive.count,
                scheme.keep_alive.idle,
                scheme.keep_alive.interval,
            )?;
        }

        if kind.is_secure() {
            let tls = self.tls.as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "TLS scheme without a TLS engine")
            })?;
            tls.lock().unwrap().wrap_client(socket.raw(), &scheme.url)?;
        }

        #[cfg(unix)]
        let started = if family == Family::Unix {
            socket.connect_unix(std::path::Path::new(&scheme.host))?
        } else {
            let addr = resolve_addr(ip, port)?;
            socket.connect(&addr)?
        };
        #[cfg(windows)]
        let started = {
            let addr = resolve_addr(ip, port)?;
            socket.connect(&addr)?
        };

        let raw = socket.raw();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.socket = Some(socket);
            inner.proxy_leg = proxy_leg;
        }

        if started {
            self.established(raw, kind, marks);
            return Ok(());
        }

        // Wait for writability, then check SO_ERROR.
        let me = self.clone_parts();
        let item = self.handle.add(raw, move |id, event| {
            if event != Kind::Write && event != Kind::Close {
                return;
            }
            me.handle.del(id);
            me.inner.lock().unwrap().connect_item = None;

            // Borrow the descriptor without taking ownership.
            let probe = Socket::from_raw(raw);
            let result = probe.take_error();
            let _ = probe.into_raw();

            match (event, result) {
                (Kind::Write, Ok(None)) => me.established(raw, kind, marks),
                (_, Ok(Some(err))) => {
                    warn!("connect completed with error: {}", err);
                    me.fail_attempt();
                }
                (Kind::Close, _) => {
                    warn!("connect refused by peer");
                    me.fail_attempt();
                }
                (_, Err(err)) => {
                    warn!("SO_ERROR query failed: {}", err);
                    me.fail_attempt();
                }
                (Kind::Read, Ok(None)) | (Kind::Timer, Ok(None)) => unreachable!(),
            }
        })?;
        self.handle.mode(item, Kind::Write, Mode::Enabled);
        self.inner.lock().unwrap().connect_item = Some(item);
        Ok(())
    }

    /// The socket is connected: attach the pump and report.
    fn established(&self, raw: OsSocket, kind: SocketKind, marks: Marks) {
        let link: Box<dyn Link> = match (&self.tls, kind.is_secure()) {
            (Some(tls), true) => Box::new(TlsLink {
                tls: Arc::clone(tls),
                datagram: kind.is_datagram(),
            }),
            _ => Box::new(SocketLink::new(raw, kind.is_datagram())),
        };

        let transfer = match Transfer::new(self.handle.clone(), raw, link) {
            Ok(transfer) => transfer,
            Err(err) => {
                warn!("transfer setup failed: {}", err);
                self.fail_attempt();
                return;
            }
        };
        transfer.set_marks(marks);

        let reader = Arc::clone(&self.inner);
        transfer.on_read(move |bytes| {
            let callback = reader.lock().unwrap().callbacks.read.take();
            if let Some(mut callback) = callback {
                callback(bytes);
                let mut inner = reader.lock().unwrap();
                if inner.callbacks.read.is_none() {
                    inner.callbacks.read = Some(callback);
                }
            }
        });
        let drainer = Arc::clone(&self.inner);
        transfer.on_drain(move || {
            let callback = drainer.lock().unwrap().callbacks.drain.take();
            if let Some(mut callback) = callback {
                callback();
                let mut inner = drainer.lock().unwrap();
                if inner.callbacks.drain.is_none() {
                    inner.callbacks.drain = Some(callback);
                }
            }
        });
        let closer = self.clone_parts();
        transfer.on_close(move || {
            closer.peer_closed();
        });
        transfer.start();

        let (scheme, proxy_leg) = {
            let mut inner = self.inner.lock().unwrap();
            inner.transfer = Some(Arc::new(transfer));
            inner.attempts_left = inner.scheme.attempts;
            (Arc::clone(&inner.scheme), inner.proxy_leg)
        };
        scheme.release(Status::Connect, Pending::Connect);
        trace!("connected (proxy leg: {})", proxy_leg);

        let slot = {
            let mut inner = self.inner.lock().unwrap();
            if proxy_leg {
                inner.callbacks.connect_proxy.take()
            } else {
                inner.callbacks.connect.take()
            }
        };
        if let Some(mut callback) = slot {
            callback();
            let mut inner = self.inner.lock().unwrap();
            let slot = if proxy_leg {
                &mut inner.callbacks.connect_proxy
            } else {
                &mut inner.callbacks.connect
            };
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    /// The established connection dropped.
    fn peer_closed(&self) {
        let scheme = {
            let mut inner = self.inner.lock().unwrap();
            inner.transfer = None;
            inner.socket = None;
            Arc::clone(&inner.scheme)
        };
        if scheme.alive {
            scheme.release(Status::Disconnect, Pending::Reconnect);
            self.schedule_reconnect();
        } else {
            scheme.release(Status::Disconnect, Pending::Disconnect);
            self.fire_disconnect();
        }
    }

    /// A connect attempt failed.
    fn fail_attempt(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.socket = None;
        }
        self.retry_or_disconnect();
    }

    fn retry_or_disconnect(&self) {
        let (scheme, retry) = {
            let mut inner = self.inner.lock().unwrap();
            let scheme = Arc::clone(&inner.scheme);
            let retry = scheme.alive && inner.attempts_left > 0;
            if retry {
                inner.attempts_left -= 1;
            }
            (scheme, retry)
        };
        if retry {
            scheme.release(Status::Disconnect, Pending::Reconnect);
            self.schedule_reconnect();
        } else {
            scheme.release(Status::Disconnect, Pending::Disconnect);
            self.fire_disconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let delay = self.inner.lock().unwrap().reconnect_delay;
        let me = self.clone_parts();
        let timer = self.handle.add_timer(delay, false, move |id, _| {
            me.handle.del(id);
            me.inner.lock().unwrap().reconnect_timer = None;
            me.reconnect();
        });
        match timer {
            Ok(id) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(old) = inner.reconnect_timer.replace(id) {
                    drop(inner);
                    self.handle.del(old);
                }
            }
            Err(err) => {
                warn!("reconnect timer failed: {}", err);
                self.fire_disconnect();
            }
        }
    }

    /// One reconnect tick: re-run the dial, re-claiming the scheme so a
    /// racing explicit `connect` cannot double-dial.
    fn reconnect(&self) {
        let target = {
            let mut inner = self.inner.lock().unwrap();
            let scheme = Arc::clone(&inner.scheme);
            if !scheme.claim() {
                return;
            }
            let (family, host) = self.target_endpoint(&inner);
            match self.lookup(&mut inner, family, &host) {
                Lookup::Ready(ip) => Some(ip),
                Lookup::InFlight => None,
            }
        };
        if let Some(ip) = target {
            self.connect_ip(&ip);
        }
    }

    fn fire_disconnect(&self) {
        let callback = self.inner.lock().unwrap().callbacks.disconnect.take();
        if let Some(mut callback) = callback {
            callback();
            let mut inner = self.inner.lock().unwrap();
            if inner.callbacks.disconnect.is_none() {
                inner.callbacks.disconnect = Some(callback);
            }
        }
    }

    fn clone_parts(&self) -> Client {
        Client {
            handle: self.handle.clone(),
            inner: Arc::clone(&self.inner),
            tls: self.tls.as_ref().map(Arc::clone),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}

enum Lookup {
    Ready(String),
    InFlight,
}

fn resolve_addr(ip: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "malformed IP address"))?;
    Ok(SocketAddr::new(ip, port))
}
