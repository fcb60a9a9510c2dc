use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::Token;

use crate::error::{Error, Result};
use crate::event::{EventSet, Priority};
use crate::reactor::Reactor;
use crate::EventLoop;

/// Callback invoked when a watcher's event fires.
///
/// The handle-carrying signature is the primitive: one-shot helpers like
/// `EventLoop::on_timeout` are sugar over it. The callback may freely call
/// back into the reactor, including stopping or cancelling its own watcher.
pub(crate) type Callback = Box<dyn FnMut(&EventLoop, &Watcher, EventSet)>;

/// Identifies a watcher slot in the reactor registry. The generation makes
/// handles to a freed slot inert even after the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct WatcherId {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

impl WatcherId {
    pub(crate) fn token(self) -> Token {
        Token(((self.gen as usize) << 32) | self.slot as usize)
    }

    pub(crate) fn from_token(token: Token) -> WatcherId {
        WatcherId {
            slot: (token.0 & 0xffff_ffff) as u32,
            gen: (token.0 >> 32) as u32,
        }
    }
}

pub(crate) enum WatcherKind {
    Io { fd: RawFd, mask: EventSet },
    Timer { period: Duration },
    Signal { signum: i32 },
    Idle,
    Cleanup,
}

pub(crate) struct WatcherEntry {
    pub(crate) kind: WatcherKind,
    pub(crate) priority: Priority,
    pub(crate) active: bool,
    /// Bumped whenever a timer is stopped so queued deadlines turn stale.
    pub(crate) epoch: u64,
    /// Taken while the callback is executing.
    pub(crate) callback: Option<Callback>,
}

/// Handle to an event subscription on an [`EventLoop`].
///
/// A watcher is registered with the reactor for its whole life: the registry
/// slot doubles as the cleanup subscription, so reactor teardown reaches
/// every watcher that has not been cancelled. `cancel` frees the slot and
/// makes the handle permanently dead; a merely stopped watcher can be
/// started again.
pub struct Watcher {
    reactor: Weak<Reactor>,
    id: WatcherId,
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Watcher {
            reactor: Weak::clone(&self.reactor),
            id: self.id,
        }
    }
}

impl Watcher {
    pub(crate) fn new(reactor: Weak<Reactor>, id: WatcherId) -> Watcher {
        Watcher { reactor, id }
    }

    pub(crate) fn id(&self) -> WatcherId {
        self.id
    }

    fn reactor(&self) -> Result<Rc<Reactor>> {
        self.reactor.upgrade().ok_or(Error::LoopGone)
    }

    /// Arm the watcher. Idempotent while armed. Fails with
    /// [`Error::WatcherCancelled`] once the watcher has been cancelled.
    pub fn start(&self) -> Result<()> {
        self.reactor()?.start_watcher(self.id)
    }

    /// Disarm the watcher. Returns whether it was previously armed.
    pub fn stop(&self) -> bool {
        match self.reactor.upgrade() {
            Some(reactor) => reactor.stop_watcher(self.id),
            None => false,
        }
    }

    /// Disarm and deregister the cleanup subscription. After this the
    /// watcher is permanently dead: `start` fails and events are dropped.
    pub fn cancel(&self) {
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.cancel_watcher(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.reactor
            .upgrade()
            .map_or(false, |reactor| reactor.watcher_active(self.id))
    }

    pub fn priority(&self) -> Priority {
        self.reactor
            .upgrade()
            .map_or(Priority::Normal, |reactor| reactor.watcher_priority(self.id))
    }

    /// Change the dispatch priority. Takes effect transparently even while
    /// the watcher is armed.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        self.reactor()?.set_watcher_priority(self.id, priority)
    }

    /// Current READ/WRITE mask of an I/O watcher, `NONE` for other kinds.
    pub fn event_mask(&self) -> EventSet {
        self.reactor
            .upgrade()
            .map_or(EventSet::NONE, |reactor| reactor.watcher_mask(self.id))
    }

    /// Replace the READ/WRITE mask of an I/O watcher. While armed, the
    /// registration is transparently stopped and re-armed with the new mask.
    pub fn set_event_mask(&self, mask: EventSet) -> Result<()> {
        self.reactor()?.set_watcher_mask(self.id, mask)
    }

    /// Repeat period of a timer watcher in seconds, 0.0 for other kinds.
    pub fn seconds(&self) -> f64 {
        self.reactor
            .upgrade()
            .map_or(0.0, |reactor| reactor.watcher_seconds(self.id))
    }

    /// Reconfigure a timer watcher. A positive value stops the timer,
    /// re-initialises it to repeat every `seconds`, and starts it; a
    /// non-positive value stops it without restarting.
    pub fn set_seconds(&self, seconds: f64) -> Result<()> {
        self.reactor()?.set_watcher_seconds(self.id, seconds)
    }
}
