//! Windows support, built on `WSAPoll`.
//!
//! WinSock is initialized lazily the first time any socket is created. The
//! "pipes" the reactor uses for timers and upstream channels are loopback
//! TCP socket pairs: `WSAPoll` cannot monitor anonymous pipes.

mod selector;
pub(crate) mod socket;

pub(crate) use self::selector::{event, Event, Events, Selector};

use std::io;
use std::sync::Once;

use windows_sys::Win32::Networking::WinSock;

/// An OS socket as the reactor tracks it.
pub type OsSocket = WinSock::SOCKET;

/// Marker for "no socket"; `add` rejects it for non-timer items.
pub const INVALID_SOCKET: OsSocket = WinSock::INVALID_SOCKET;

/// Lazily initialize WinSock 2.2, once per process, only if the host
/// application has not already done so (a second `WSAStartup` is reference
/// counted by the OS and harmless either way).
pub(crate) fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let mut data: WinSock::WSADATA = std::mem::zeroed();
        let res = WinSock::WSAStartup(0x202 /* version 2.2 */, &mut data);
        if res != 0 {
            // Every subsequent socket call will fail with a proper error;
            // nothing more useful to do here.
            log::error!(
                "WSAStartup failed: {}",
                io::Error::from_raw_os_error(res)
            );
        }
    });
}

pub(crate) fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WinSock::WSAGetLastError() })
}

pub(crate) fn read(socket: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
    socket::recv(socket, buf)
}

pub(crate) fn write(socket: OsSocket, buf: &[u8]) -> io::Result<usize> {
    socket::send(socket, buf)
}

pub(crate) fn close_socket(socket: OsSocket) {
    unsafe {
        WinSock::closesocket(socket);
    }
}

pub(crate) mod pipe {
    use super::socket;
    use super::OsSocket;
    use std::io::{self, Read, Write};

    /// Read half of a loopback socket pair.
    #[derive(Debug)]
    pub(crate) struct Receiver(pub(crate) socket::Owned);

    /// Write half of a loopback socket pair.
    #[derive(Debug)]
    pub(crate) struct Sender(pub(crate) socket::Owned);

    impl Receiver {
        pub(crate) fn as_raw(&self) -> OsSocket {
            self.0.raw()
        }
    }

    impl Sender {
        pub(crate) fn as_raw(&self) -> OsSocket {
            self.0.raw()
        }
    }

    impl Read for &Receiver {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            socket::recv(self.0.raw(), buf)
        }
    }

    impl Write for &Sender {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            socket::send(self.0.raw(), buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Create a connected loopback pair standing in for a Unix pipe.
    pub(crate) fn new(nonblocking_write: bool) -> io::Result<(Receiver, Sender)> {
        let [receiver, sender] = socket::loopback_pair()?;
        socket::set_nonblocking(receiver.raw(), true)?;
        socket::set_nonblocking(sender.raw(), nonblocking_write)?;
        Ok((Receiver(receiver), Sender(sender)))
    }
}
