use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Handle, ItemId, Kind, Mode};
use crate::OsSocket;

/// What a [`Watcher`] monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// A socket readiness watcher; requires a valid socket.
    Event,
    /// A timer; requires a non-zero delay.
    Timer,
}

type Shared = Arc<Mutex<Box<dyn FnMut(ItemId, Kind) + Send>>>;

/// A startable/stoppable handle binding a reactor, a socket or a delay, and
/// a callback into one unit.
///
/// The watcher owns its registration: dropping a started watcher removes it
/// from the reactor. Changing the socket of a started watcher restarts it.
pub struct Watcher {
    handle: Handle,
    kind: WatcherKind,
    socket: OsSocket,
    delay: Option<Duration>,
    series: bool,
    callback: Option<Shared>,
    id: Option<ItemId>,
}

impl Watcher {
    /// A socket readiness watcher; set a socket and callback before
    /// [`start`](Watcher::start).
    pub fn event(handle: Handle) -> Watcher {
        Watcher {
            handle,
            kind: WatcherKind::Event,
            socket: crate::INVALID_SOCKET,
            delay: None,
            series: false,
            callback: None,
            id: None,
        }
    }

    /// A timer; set a delay and callback before [`start`](Watcher::start).
    pub fn timer(handle: Handle) -> Watcher {
        Watcher {
            handle,
            kind: WatcherKind::Timer,
            socket: crate::INVALID_SOCKET,
            delay: None,
            series: false,
            callback: None,
            id: None,
        }
    }

    pub fn kind(&self) -> WatcherKind {
        self.kind
    }

    /// The live registration, when started.
    pub fn id(&self) -> Option<ItemId> {
        self.id
    }

    /// Set the monitored socket. Ignored by timers; restarts a started
    /// event watcher.
    pub fn set_socket(&mut self, socket: OsSocket) -> io::Result<()> {
        if self.kind == WatcherKind::Timer {
            return Ok(());
        }
        self.socket = socket;
        if self.id.is_some() {
            self.stop();
            self.start()?;
        }
        Ok(())
    }

    /// Set the timer delay and whether it re-arms after each fire.
    pub fn set_timeout(&mut self, delay: Duration, series: bool) {
        self.delay = Some(delay);
        self.series = series;
    }

    /// Set the callback invoked on the reactor thread.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ItemId, Kind) + Send + 'static,
    {
        self.callback = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    /// Register with the reactor. Timers arm immediately; events start with
    /// only CLOSE delivery enabled, use [`mode`](Watcher::mode) for the
    /// rest.
    pub fn start(&mut self) -> io::Result<()> {
        if self.id.is_some() {
            return Ok(());
        }
        let shared = self.callback.clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "watcher has no callback")
        })?;
        let trampoline = move |id: ItemId, kind: Kind| {
            let mut callback = shared.lock().unwrap();
            (*callback)(id, kind);
        };

        let id = match self.kind {
            WatcherKind::Timer => {
                let delay = self.delay.filter(|delay| !delay.is_zero()).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "timer watcher needs a delay")
                })?;
                self.handle.add_timer(delay, self.series, trampoline)?
            }
            WatcherKind::Event => self.handle.add(self.socket, trampoline)?,
        };
        self.id = Some(id);
        Ok(())
    }

    /// Remove the registration; the watcher can be started again.
    pub fn stop(&mut self) {
        if let Some(id) = self.id.take() {
            self.handle.del(id);
        }
    }

    /// Toggle one readiness class on a started watcher.
    pub fn mode(&self, kind: Kind, mode: Mode) -> bool {
        match self.id {
            Some(id) => self.handle.mode(id, kind, mode),
            None => false,
        }
    }

    /// Disable one readiness class on a started watcher.
    pub fn del(&self, kind: Kind) -> bool {
        self.mode(kind, Mode::Disabled)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .field("delay", &self.delay)
            .field("id", &self.id)
            .finish()
    }
}
