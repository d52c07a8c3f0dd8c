use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock;

use super::{last_error, OsSocket};

/// `WSAPoll` selector.
///
/// `WSAPoll` keeps no kernel-side registration, so the selector carries the
/// interest table itself and rebuilds the flat `WSAPOLLFD` array on every
/// `select`. Readiness is level-triggered; the reactor's per-item mode flags
/// gate redundant dispatch.
#[derive(Debug)]
pub(crate) struct Selector {
    interests: Mutex<HashMap<OsSocket, (u64, bool, bool)>>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        super::init();
        Ok(Selector {
            interests: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut fds: Vec<WinSock::WSAPOLLFD> = Vec::new();
        {
            let interests = self.interests.lock().unwrap();
            fds.reserve(interests.len());
            for (&socket, &(_, read, write)) in interests.iter() {
                let mut mask: i16 = 0;
                if read {
                    mask |= WinSock::POLLRDNORM;
                }
                if write {
                    mask |= WinSock::POLLWRNORM;
                }
                fds.push(WinSock::WSAPOLLFD {
                    fd: socket,
                    events: mask,
                    revents: 0,
                });
            }
        }

        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(i32::MAX as u128) as i32
            })
            .unwrap_or(-1);

        if fds.is_empty() {
            // `WSAPoll` rejects an empty array; emulate plain sleeping.
            if timeout > 0 {
                std::thread::sleep(Duration::from_millis(timeout as u64));
            }
            return Ok(());
        }

        let res = unsafe { WinSock::WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout) };
        if res == WinSock::SOCKET_ERROR {
            return Err(last_error());
        }

        let interests = self.interests.lock().unwrap();
        for fd in fds.iter().filter(|fd| fd.revents != 0) {
            if let Some(&(key, _, _)) = interests.get(&fd.fd) {
                events.push(Event {
                    key,
                    readable: fd.revents & WinSock::POLLRDNORM != 0,
                    writable: fd.revents & WinSock::POLLWRNORM != 0,
                    error: fd.revents & (WinSock::POLLERR | WinSock::POLLNVAL) != 0,
                    closed: fd.revents & WinSock::POLLHUP != 0,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn register(
        &self,
        socket: OsSocket,
        key: u64,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        self.interests
            .lock()
            .unwrap()
            .insert(socket, (key, read, write));
        Ok(())
    }

    pub(crate) fn reregister(
        &self,
        socket: OsSocket,
        key: u64,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        self.register(socket, key, read, write)
    }

    pub(crate) fn deregister(&self, socket: OsSocket) -> io::Result<()> {
        self.interests.lock().unwrap().remove(&socket);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Event {
    key: u64,
    readable: bool,
    writable: bool,
    error: bool,
    closed: bool,
}

pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::Event;

    pub(crate) fn key(event: &Event) -> u64 {
        event.key
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.readable
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.writable
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        event.error
    }

    pub(crate) fn is_closed(event: &Event) -> bool {
        event.closed
    }
}
