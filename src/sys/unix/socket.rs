use std::io;
use std::mem::size_of;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Once;
use std::time::Duration;

/// Create a new non-blocking, close-on-exec socket.
pub(crate) fn new_socket(
    domain: libc::c_int,
    socket_type: libc::c_int,
    protocol: libc::c_int,
) -> io::Result<OwnedFd> {
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

    let socket = syscall!(socket(domain, socket_type, protocol))?;
    // SAFETY: `socket(2)` ensured the fd is valid.
    let socket = unsafe { OwnedFd::from_raw_fd(socket) };
    let fd = socket_fd(&socket);

    // Mimick `libstd` and set `SO_NOSIGPIPE` on apple systems.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_NOSIGPIPE,
        &1 as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())?;

    // Darwin (and illumos) don't have `SOCK_NONBLOCK` or `SOCK_CLOEXEC`.
    #[cfg(any(target_os = "ios", target_os = "macos", target_os = "illumos"))]
    {
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }

    let _ = fd;
    Ok(socket)
}

fn socket_fd(socket: &OwnedFd) -> RawFd {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

/// Connected `AF_UNIX` stream pair, close-on-exec, blocking.
///
/// The cluster flips the right halves non-blocking itself once fork
/// ownership is settled.
pub(crate) fn socketpair() -> io::Result<[OwnedFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    let socket_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let socket_type = libc::SOCK_STREAM;

    syscall!(socketpair(libc::AF_UNIX, socket_type, 0, fds.as_mut_ptr()))?;

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    for fd in &fds {
        syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }

    // SAFETY: `socketpair(2)` ensured both fds are valid.
    Ok(unsafe { [OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])] })
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd, reuseaddr: bool) -> io::Result<()> {
    let val: libc::c_int = i32::from(reuseaddr);
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Enable TCP keep-alive and, where the platform allows, tune the probe
/// count, idle time and probe interval.
pub(crate) fn set_keepalive(
    fd: RawFd,
    count: Option<u32>,
    idle: Option<Duration>,
    interval: Option<Duration>,
) -> io::Result<()> {
    let val: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd"
    ))]
    {
        if let Some(count) = count {
            set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count as libc::c_int)?;
        }
        if let Some(idle) = idle {
            set_opt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                idle.as_secs().max(1) as libc::c_int,
            )?;
        }
        if let Some(interval) = interval {
            set_opt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                interval.as_secs().max(1) as libc::c_int,
            )?;
        }
    }

    // Darwin spells "idle time" differently and has no probe-count knob;
    // OpenBSD only has the on/off switch.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        let _ = count;
        if let Some(idle) = idle {
            set_opt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPALIVE,
                idle.as_secs().max(1) as libc::c_int,
            )?;
        }
        let _ = interval;
    }
    #[cfg(target_os = "openbsd")]
    {
        let _ = (count, idle, interval);
    }

    Ok(())
}

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn get_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int) -> io::Result<libc::c_int> {
    let mut val: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        opt,
        &mut val as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))
    .map(|_| val)
}

pub(crate) fn send_buffer_size(fd: RawFd) -> io::Result<usize> {
    get_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF).map(|n| n as usize)
}

pub(crate) fn recv_buffer_size(fd: RawFd) -> io::Result<usize> {
    get_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF).map(|n| n as usize)
}

pub(crate) fn set_send_buffer_size(fd: RawFd, size: usize) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
}

pub(crate) fn set_recv_buffer_size(fd: RawFd, size: usize) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
}

/// Suppress `SIGPIPE` process-wide.
///
/// Writes to a peer-closed socket must surface as `EPIPE`, not kill the
/// process. Done once; callers may invoke freely.
pub(crate) fn suppress_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
