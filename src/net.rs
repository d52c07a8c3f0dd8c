//! Non-blocking socket creation and tuning.
//!
//! A thin, portable surface over the OS socket calls: address family and
//! protocol selection, blocking mode, buffer sizing, keep-alive and
//! address reuse. Errors carry the OS errno untranslated; there are no
//! hidden retries.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::sys;
use crate::OsSocket;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
    /// Unix-domain, addressed by filesystem path.
    #[cfg(unix)]
    Unix,
}

/// Transport protocol of a socket.
///
/// TLS and DTLS ride on `Tcp`/`Udp` sockets and are layered by the TLS
/// collaborator, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    Sctp,
}

impl Proto {
    pub fn is_datagram(self) -> bool {
        matches!(self, Proto::Udp)
    }
}

/// An owned, non-blocking socket.
///
/// Closed on drop unless released with [`into_raw`](Socket::into_raw).
#[derive(Debug)]
pub struct Socket {
    raw: OsSocket,
}

impl Socket {
    /// Create a non-blocking socket of the given family and protocol.
    pub fn new(family: Family, proto: Proto) -> io::Result<Socket> {
        #[cfg(unix)]
        {
            let domain = match family {
                Family::V4 => libc::AF_INET,
                Family::V6 => libc::AF_INET6,
                Family::Unix => libc::AF_UNIX,
            };
            let (socket_type, protocol) = match proto {
                Proto::Tcp => (libc::SOCK_STREAM, 0),
                Proto::Udp => (libc::SOCK_DGRAM, 0),
                #[cfg(any(target_os = "linux", target_os = "freebsd"))]
                Proto::Sctp => (libc::SOCK_STREAM, libc::IPPROTO_SCTP),
            };
            let fd = sys::socket::new_socket(domain, socket_type, protocol)?;
            use std::os::fd::IntoRawFd;
            Ok(Socket {
                raw: fd.into_raw_fd(),
            })
        }
        #[cfg(windows)]
        {
            use windows_sys::Win32::Networking::WinSock;
            let domain = match family {
                Family::V4 => WinSock::AF_INET as i32,
                Family::V6 => WinSock::AF_INET6 as i32,
            };
            let (socket_type, protocol) = match proto {
                Proto::Tcp => (WinSock::SOCK_STREAM as i32, WinSock::IPPROTO_TCP as i32),
                Proto::Udp => (WinSock::SOCK_DGRAM as i32, WinSock::IPPROTO_UDP as i32),
            };
            let socket = sys::socket::new_socket(domain, socket_type, protocol)?;
            Ok(Socket {
                raw: socket.into_raw(),
            })
        }
    }

    /// Adopt an already created socket; the wrapper closes it on drop.
    pub fn from_raw(raw: OsSocket) -> Socket {
        Socket { raw }
    }

    pub fn raw(&self) -> OsSocket {
        self.raw
    }

    /// Release ownership without closing.
    pub fn into_raw(self) -> OsSocket {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        sys::socket::set_nonblocking(self.raw, nonblocking)
    }

    pub fn set_reuseaddr(&self, reuseaddr: bool) -> io::Result<()> {
        sys::socket::set_reuseaddr(self.raw, reuseaddr)
    }

    /// Enable keep-alive, optionally tuning probe count, idle time and
    /// probe interval where the platform allows.
    pub fn set_keepalive(
        &self,
        count: Option<u32>,
        idle: Option<Duration>,
        interval: Option<Duration>,
    ) -> io::Result<()> {
        sys::socket::set_keepalive(self.raw, count, idle, interval)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        sys::socket::send_buffer_size(self.raw)
    }

    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        sys::socket::recv_buffer_size(self.raw)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        sys::socket::set_send_buffer_size(self.raw, size)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        sys::socket::set_recv_buffer_size(self.raw, size)
    }

    /// Start a non-blocking connect. `Ok(true)` means connected already,
    /// `Ok(false)` means in progress: wait for writability and check
    /// [`take_error`](Socket::take_error).
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<bool> {
        #[cfg(unix)]
        {
            sys::net::connect(self.raw, addr)
        }
        #[cfg(windows)]
        {
            sys::socket::connect(self.raw, addr)
        }
    }

    /// Connect a Unix-domain socket to a filesystem path.
    #[cfg(unix)]
    pub fn connect_unix(&self, path: &std::path::Path) -> io::Result<bool> {
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

        let res = unsafe {
            libc::connect(
                self.raw,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len as libc::socklen_t,
            )
        };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) => Ok(false),
            _ => Err(err),
        }
    }

    /// The pending socket error, surfaced after a writable event on a
    /// connecting socket.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        #[cfg(unix)]
        {
            sys::net::take_error(self.raw)
        }
        #[cfg(windows)]
        {
            sys::socket::take_error(self.raw)
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(self.raw, buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(self.raw, buf)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sys::close_socket(self.raw);
    }
}
