//! A portable readiness reactor with an HTTP/2 frame engine and POSIX
//! worker clustering.
//!
//! Rookery multiplexes sockets and timers through one event loop per
//! thread, on every major OS:
//!
//! * [`Reactor`] — the OS-portable demultiplexer (epoll, kqueue, `WSAPoll`)
//!   with timers, cross-thread [upstream](Handle::upstream) wake channels
//!   and lifecycle management.
//! * [`http2::Session`] — a frame-level HTTP/2 state machine with flow
//!   control, stream multiplexing and the ALTSVC/ORIGIN extension frames.
//! * [`transfer::Transfer`] — a per-connection read/write pump with
//!   watermarks, timeouts and backpressure.
//! * [`client::Client`] — connection lifecycle with reconnects and proxy
//!   switching, talking to DNS/TLS collaborators through narrow traits.
//! * [`cluster::Cluster`] (POSIX) — forked worker processes exchanging
//!   length-prefixed, optionally compressed and encrypted messages with
//!   the parent.
//!
//! # Guarantees
//!
//! Callbacks for one item are serialized and only ever run on the thread
//! driving [`Reactor::run`]. Cross-thread mutations take effect before or
//! between dispatches, never during one. Upstream tokens arrive in
//! producer write order.

#![deny(missing_debug_implementations)]

mod sys;

pub mod client;
#[cfg(unix)]
pub mod cluster;
pub mod http2;
pub mod net;
mod reactor;
pub mod transfer;

pub use reactor::{Handle, ItemId, Kind, Mode, Reactor, UpstreamId, Watcher, WatcherKind};
pub use sys::{OsSocket, INVALID_SOCKET};
