use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr};

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

/// Kqueue selector.
///
/// Read and write readiness are separate filters; both are added with
/// `EV_CLEAR` (edge semantics) and toggled through `EV_ENABLE`/`EV_DISABLE`
/// as the reactor flips item modes.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        // SAFETY: `kqueue(2)` ensured the fd is valid.
        Ok(Selector {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, key: u64, read: bool, write: bool) -> io::Result<()> {
        let read_flags = libc::EV_ADD
            | libc::EV_CLEAR
            | if read { libc::EV_ENABLE } else { libc::EV_DISABLE };
        let write_flags = libc::EV_ADD
            | libc::EV_CLEAR
            | if write { libc::EV_ENABLE } else { libc::EV_DISABLE };
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, read_flags, key),
            kevent!(fd, libc::EVFILT_WRITE, write_flags, key),
        ];
        self.apply(&changes)
    }

    pub(crate) fn reregister(&self, fd: RawFd, key: u64, read: bool, write: bool) -> io::Result<()> {
        self.register(fd, key, read, write)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
        ];
        // A filter that was never activated reports ENOENT, nothing to undo.
        match self.apply(&changes) {
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::{Event, Filter};

    pub(crate) fn key(event: &Event) -> u64 {
        event.udata as u64
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.filter == libc::EVFILT_READ as Filter
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE as Filter
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.flags & libc::EV_ERROR as super::Flags) != 0
    }

    pub(crate) fn is_closed(event: &Event) -> bool {
        (event.flags & libc::EV_EOF as super::Flags) != 0
    }
}
