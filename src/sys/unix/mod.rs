/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before the modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod selector;
pub(crate) mod net;
pub(crate) mod socket;

pub(crate) use self::selector::{event, Event, Events, Selector};

/// An OS socket / file descriptor as the reactor tracks it.
pub type OsSocket = std::os::fd::RawFd;

/// Marker for "no socket"; `add` rejects it for non-timer items.
pub const INVALID_SOCKET: OsSocket = -1;

/// Per-platform process setup; on POSIX only `SIGPIPE` suppression.
pub(crate) fn init() {
    socket::suppress_sigpipe();
}

pub(crate) fn read(socket: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
    net::read(socket, buf)
}

pub(crate) fn write(socket: OsSocket, buf: &[u8]) -> io::Result<usize> {
    net::write(socket, buf)
}

pub(crate) fn close_socket(socket: OsSocket) {
    net::close(socket);
}

use std::io;

pub(crate) mod pipe {
    use super::socket;
    use super::OsSocket;
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    /// Read end of a reactor pipe.
    #[derive(Debug)]
    pub(crate) struct Receiver(File);

    /// Write end of a reactor pipe.
    #[derive(Debug)]
    pub(crate) struct Sender(File);

    impl Receiver {
        pub(crate) fn as_raw(&self) -> OsSocket {
            self.0.as_raw_fd()
        }
    }

    impl Sender {
        pub(crate) fn as_raw(&self) -> OsSocket {
            self.0.as_raw_fd()
        }
    }

    impl Read for &Receiver {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            (&self.0).read(buf)
        }
    }

    impl Write for &Sender {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            (&self.0).write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            (&self.0).flush()
        }
    }

    /// Create a new Unix pipe.
    ///
    /// Both ends are close-on-exec and the read end is non-blocking;
    /// `nonblocking_write` controls whether the write end blocks when the
    /// kernel buffer is full. Timer pipes want a non-blocking write end (a
    /// byte already queued means the timer will fire anyway), upstream
    /// channels want a blocking one so that no token is ever dropped.
    pub(crate) fn new(nonblocking_write: bool) -> io::Result<(Receiver, Sender)> {
        let mut fds: [RawFd; 2] = [-1, -1];

        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;

        // Darwin has no `pipe2(2)`, need to use `pipe(2)` and set the flags
        // separately (with a window in which they are not set).
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                if let Err(err) = syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC)) {
                    let _ = syscall!(close(fds[0]));
                    let _ = syscall!(close(fds[1]));
                    return Err(err);
                }
            }
        }

        socket::set_nonblocking(fds[0], true)?;
        socket::set_nonblocking(fds[1], nonblocking_write)?;

        // SAFETY: `pipe(2)`/`pipe2(2)` ensured both fds are valid.
        let receiver = Receiver(unsafe { File::from_raw_fd(fds[0]) });
        let sender = Sender(unsafe { File::from_raw_fd(fds[1]) });
        Ok((receiver, sender))
    }
}

/// Milliseconds a `Duration` rounds up to, the granularity of every poller
/// this module drives.
pub(crate) fn as_millis(duration: std::time::Duration) -> libc::c_int {
    // `Duration::as_millis` truncates, so round up. This avoids turning
    // sub-millisecond timeouts into a zero timeout.
    duration
        .checked_add(std::time::Duration::from_nanos(999_999))
        .unwrap_or(duration)
        .as_millis()
        .min(libc::c_int::MAX as u128) as libc::c_int
}
