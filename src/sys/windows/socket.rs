use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock;

use super::{last_error, OsSocket};

/// Owned socket handle, closed on drop.
#[derive(Debug)]
pub(crate) struct Owned(OsSocket);

impl Owned {
    pub(crate) fn raw(&self) -> OsSocket {
        self.0
    }

    pub(crate) fn into_raw(self) -> OsSocket {
        let socket = self.0;
        std::mem::forget(self);
        socket
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        unsafe {
            WinSock::closesocket(self.0);
        }
    }
}

pub(crate) fn new_socket(family: i32, socket_type: i32, protocol: i32) -> io::Result<Owned> {
    super::init();
    let socket = unsafe { WinSock::socket(family, socket_type, protocol) };
    if socket == WinSock::INVALID_SOCKET {
        return Err(last_error());
    }
    let socket = Owned(socket);
    set_nonblocking(socket.raw(), true)?;
    Ok(socket)
}

pub(crate) fn set_nonblocking(socket: OsSocket, nonblocking: bool) -> io::Result<()> {
    let mut arg: u32 = u32::from(nonblocking);
    let res = unsafe { WinSock::ioctlsocket(socket, WinSock::FIONBIO, &mut arg) };
    if res == WinSock::SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(())
    }
}

fn set_opt(socket: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let res = unsafe {
        WinSock::setsockopt(
            socket,
            level,
            opt,
            &val as *const i32 as *const u8,
            size_of::<i32>() as i32,
        )
    };
    if res == WinSock::SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(())
    }
}

fn get_opt(socket: OsSocket, level: i32, opt: i32) -> io::Result<i32> {
    let mut val: i32 = 0;
    let mut len = size_of::<i32>() as i32;
    let res = unsafe {
        WinSock::getsockopt(socket, level, opt, &mut val as *mut i32 as *mut u8, &mut len)
    };
    if res == WinSock::SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(val)
    }
}

pub(crate) fn set_reuseaddr(socket: OsSocket, reuseaddr: bool) -> io::Result<()> {
    set_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_REUSEADDR as i32,
        i32::from(reuseaddr),
    )
}

pub(crate) fn set_keepalive(
    socket: OsSocket,
    _count: Option<u32>,
    _idle: Option<Duration>,
    _interval: Option<Duration>,
) -> io::Result<()> {
    // Probe tuning needs `WSAIoctl(SIO_KEEPALIVE_VALS)`; the on/off switch
    // is what the portable surface promises.
    set_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_KEEPALIVE as i32,
        1,
    )
}

pub(crate) fn send_buffer_size(socket: OsSocket) -> io::Result<usize> {
    get_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_SNDBUF as i32,
    )
    .map(|n| n as usize)
}

pub(crate) fn recv_buffer_size(socket: OsSocket) -> io::Result<usize> {
    get_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_RCVBUF as i32,
    )
    .map(|n| n as usize)
}

pub(crate) fn set_send_buffer_size(socket: OsSocket, size: usize) -> io::Result<()> {
    set_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_SNDBUF as i32,
        size as i32,
    )
}

pub(crate) fn set_recv_buffer_size(socket: OsSocket, size: usize) -> io::Result<()> {
    set_opt(
        socket,
        WinSock::SOL_SOCKET as i32,
        WinSock::SO_RCVBUF as i32,
        size as i32,
    )
}

pub(crate) fn recv(socket: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { WinSock::recv(socket, buf.as_mut_ptr(), buf.len() as i32, 0) };
    if res == WinSock::SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(res as usize)
    }
}

pub(crate) fn send(socket: OsSocket, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { WinSock::send(socket, buf.as_ptr(), buf.len() as i32, 0) };
    if res == WinSock::SOCKET_ERROR {
        Err(last_error())
    } else {
        Ok(res as usize)
    }
}

fn sockaddr_in(addr: &SocketAddr) -> (WinSock::SOCKADDR_STORAGE, i32) {
    let mut storage: WinSock::SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            let sin = WinSock::SOCKADDR_IN {
                sin_family: WinSock::AF_INET,
                sin_port: addr.port().to_be(),
                sin_addr: WinSock::IN_ADDR {
                    S_un: WinSock::IN_ADDR_0 {
                        S_addr: u32::from_ne_bytes(addr.ip().octets()),
                    },
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut WinSock::SOCKADDR_IN, sin);
            }
            (storage, size_of::<WinSock::SOCKADDR_IN>() as i32)
        }
        SocketAddr::V6(addr) => {
            let sin6 = WinSock::SOCKADDR_IN6 {
                sin6_family: WinSock::AF_INET6,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: WinSock::IN6_ADDR {
                    u: WinSock::IN6_ADDR_0 {
                        Byte: addr.ip().octets(),
                    },
                },
                Anonymous: WinSock::SOCKADDR_IN6_0 {
                    sin6_scope_id: addr.scope_id(),
                },
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut WinSock::SOCKADDR_IN6, sin6);
            }
            (storage, size_of::<WinSock::SOCKADDR_IN6>() as i32)
        }
    }
}

/// Start a non-blocking connect; `WSAEWOULDBLOCK` is "in progress".
pub(crate) fn connect(socket: OsSocket, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = sockaddr_in(addr);
    let res = unsafe {
        WinSock::connect(socket, &storage as *const _ as *const WinSock::SOCKADDR, len)
    };
    if res == 0 {
        return Ok(true);
    }
    let err = last_error();
    match err.raw_os_error() {
        Some(code) if code == WinSock::WSAEWOULDBLOCK => Ok(false),
        _ => Err(err),
    }
}

pub(crate) fn take_error(socket: OsSocket) -> io::Result<Option<io::Error>> {
    get_opt(socket, WinSock::SOL_SOCKET as i32, WinSock::SO_ERROR as i32).map(|val| {
        if val == 0 {
            None
        } else {
            Some(io::Error::from_raw_os_error(val))
        }
    })
}

/// Build a connected loopback pair: bind a listener on 127.0.0.1:0, connect
/// a client to it and accept. Stands in for `socketpair(2)`.
pub(crate) fn loopback_pair() -> io::Result<[Owned; 2]> {
    super::init();
    unsafe {
        let listener = new_socket(
            WinSock::AF_INET as i32,
            WinSock::SOCK_STREAM as i32,
            WinSock::IPPROTO_TCP as i32,
        )?;
        set_nonblocking(listener.raw(), false)?;

        let mut addr: WinSock::SOCKADDR_IN = std::mem::zeroed();
        addr.sin_family = WinSock::AF_INET;
        addr.sin_addr.S_un.S_addr = u32::from_ne_bytes([127, 0, 0, 1]);
        if WinSock::bind(
            listener.raw(),
            &addr as *const _ as *const WinSock::SOCKADDR,
            size_of::<WinSock::SOCKADDR_IN>() as i32,
        ) != 0
        {
            return Err(last_error());
        }
        if WinSock::listen(listener.raw(), 1) != 0 {
            return Err(last_error());
        }

        let mut len = size_of::<WinSock::SOCKADDR_IN>() as i32;
        if WinSock::getsockname(
            listener.raw(),
            &mut addr as *mut _ as *mut WinSock::SOCKADDR,
            &mut len,
        ) != 0
        {
            return Err(last_error());
        }

        let client = new_socket(
            WinSock::AF_INET as i32,
            WinSock::SOCK_STREAM as i32,
            WinSock::IPPROTO_TCP as i32,
        )?;
        set_nonblocking(client.raw(), false)?;
        if WinSock::connect(
            client.raw(),
            &addr as *const _ as *const WinSock::SOCKADDR,
            size_of::<WinSock::SOCKADDR_IN>() as i32,
        ) != 0
        {
            return Err(last_error());
        }

        let accepted =
            WinSock::accept(listener.raw(), std::ptr::null_mut(), std::ptr::null_mut());
        if accepted == WinSock::INVALID_SOCKET {
            return Err(last_error());
        }

        Ok([Owned(accepted), client])
    }
}
