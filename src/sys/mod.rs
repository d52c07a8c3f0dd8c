//! Platform specific code.
//!
//! The modules in this directory all expose the same interface: a `Selector`
//! that demultiplexes readiness over the OS facility the platform provides
//! (epoll on Linux/Android, kqueue on the BSDs and macOS, `WSAPoll` on
//! Windows), a raw `Event`/`Events` pair with free-standing accessors, and
//! the socket and pipe helpers the reactor builds on.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;
