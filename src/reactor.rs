use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{EventSet, Priority};
use crate::poll::PollHandle;
use crate::watcher::{Callback, Watcher, WatcherEntry, WatcherId, WatcherKind};

pub(crate) const DEFAULT_POLL_TIMEOUT_MS: u64 = 150;

type DeferredCall = Box<dyn FnOnce(&EventLoop)>;

/// Watcher registry: a slab of slots with per-slot generations, so a handle
/// to a cancelled watcher stays inert even after its slot is reused.
#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Default)]
struct Slot {
    gen: u32,
    entry: Option<WatcherEntry>,
}

impl Registry {
    fn insert(&mut self, entry: WatcherEntry) -> WatcherId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        self.slots[slot].entry = Some(entry);
        WatcherId {
            slot: slot as u32,
            gen: self.slots[slot].gen,
        }
    }

    fn get(&self, id: WatcherId) -> Option<&WatcherEntry> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, id: WatcherId) -> Option<&mut WatcherEntry> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.entry.as_mut()
    }

    fn remove(&mut self, id: WatcherId) -> Option<WatcherEntry> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.gen != id.gen || slot.entry.is_none() {
            return None;
        }
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.slot as usize);
        slot.entry.take()
    }

    fn iter(&self) -> impl Iterator<Item = (WatcherId, &WatcherEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    WatcherId {
                        slot: i as u32,
                        gen: slot.gen,
                    },
                    entry,
                )
            })
        })
    }

    fn drain_entries(&mut self) -> Vec<WatcherEntry> {
        let mut entries = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(i);
                entries.push(entry);
            }
        }
        entries
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

/// A scheduled deadline in the timer queue. Ordering is reversed so a
/// `BinaryHeap` behaves as a min-heap with the earliest deadline on top.
/// Entries are never removed eagerly; a stale epoch invalidates them.
struct TimerEntry {
    deadline: Instant,
    id: WatcherId,
    epoch: u64,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(unix)]
mod sig {
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::error::{Error, Result};

    static PENDING: AtomicU64 = AtomicU64::new(0);

    extern "C" fn record(signum: libc::c_int) {
        if (0..64).contains(&signum) {
            PENDING.fetch_or(1u64 << signum, Ordering::Relaxed);
        }
    }

    /// Install the recording handler for `signum`. The handler only sets a
    /// bit; the reactor picks pending signals up on its next turn.
    pub(super) fn install(signum: i32) -> Result<()> {
        if !(1..64).contains(&signum) {
            return Err(Error::Configuration(format!(
                "invalid signal number {signum}"
            )));
        }
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = record;
            action.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub(super) fn take_pending() -> u64 {
        PENDING.swap(0, Ordering::Relaxed)
    }

    pub(super) fn peek_pending() -> u64 {
        PENDING.load(Ordering::Relaxed)
    }
}

/// Reactor internals. Everything lives behind `RefCell`s because callbacks
/// dispatched by the loop are allowed to call back into any reactor
/// operation; no borrow is held across a user callback.
pub(crate) struct Reactor {
    poll: RefCell<PollHandle>,
    watchers: RefCell<Registry>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    deferred: RefCell<VecDeque<DeferredCall>>,
    /// Shared idle watcher that drains the deferred-call queue.
    drain_idle: Cell<Option<WatcherId>>,
    running: Cell<bool>,
    torn_down: Cell<bool>,
    origin: Instant,
}

impl Reactor {
    fn new() -> Result<Reactor> {
        Ok(Reactor {
            poll: RefCell::new(PollHandle::new()?),
            watchers: RefCell::new(Registry::default()),
            timers: RefCell::new(BinaryHeap::new()),
            deferred: RefCell::new(VecDeque::new()),
            drain_idle: Cell::new(None),
            running: Cell::new(false),
            torn_down: Cell::new(false),
            origin: Instant::now(),
        })
    }

    pub(crate) fn add_watcher(&self, kind: WatcherKind, callback: Callback) -> WatcherId {
        self.watchers.borrow_mut().insert(WatcherEntry {
            kind,
            priority: Priority::Normal,
            active: false,
            epoch: 0,
            callback: Some(callback),
        })
    }

    pub(crate) fn start_watcher(&self, id: WatcherId) -> Result<()> {
        let mut watchers = self.watchers.borrow_mut();
        let entry = watchers.get_mut(id).ok_or(Error::WatcherCancelled)?;
        if entry.active {
            return Ok(());
        }
        match entry.kind {
            WatcherKind::Io { fd, mask } => {
                self.poll.borrow().register(fd, id.token(), mask)?;
            }
            WatcherKind::Timer { period } => {
                if period > Duration::ZERO {
                    self.timers.borrow_mut().push(TimerEntry {
                        deadline: Instant::now() + period,
                        id,
                        epoch: entry.epoch,
                    });
                }
            }
            #[cfg(unix)]
            WatcherKind::Signal { signum } => {
                sig::install(signum)?;
            }
            #[cfg(not(unix))]
            WatcherKind::Signal { .. } => {
                return Err(Error::Configuration(
                    "signal watchers are POSIX-only".into(),
                ));
            }
            WatcherKind::Idle | WatcherKind::Cleanup => {}
        }
        entry.active = true;
        Ok(())
    }

    pub(crate) fn stop_watcher(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.borrow_mut();
        let Some(entry) = watchers.get_mut(id) else {
            return false;
        };
        if !entry.active {
            return false;
        }
        entry.active = false;
        match entry.kind {
            WatcherKind::Io { fd, mask } => {
                if !mask.is_empty() {
                    if let Err(e) = self.poll.borrow().deregister(fd) {
                        trace!(fd, error = %e, "deregister on stop failed");
                    }
                }
            }
            WatcherKind::Timer { .. } => {
                entry.epoch += 1;
            }
            _ => {}
        }
        true
    }

    pub(crate) fn cancel_watcher(&self, id: WatcherId) {
        let removed = {
            let mut watchers = self.watchers.borrow_mut();
            let Some(entry) = watchers.get_mut(id) else {
                return;
            };
            if entry.active {
                if let WatcherKind::Io { fd, mask } = entry.kind {
                    if !mask.is_empty() {
                        if let Err(e) = self.poll.borrow().deregister(fd) {
                            trace!(fd, error = %e, "deregister on cancel failed");
                        }
                    }
                }
            }
            watchers.remove(id)
        };
        // Dropped outside the registry borrow: the callback may own
        // resources whose drop calls back into the reactor.
        drop(removed);
    }

    pub(crate) fn watcher_active(&self, id: WatcherId) -> bool {
        self.watchers
            .borrow()
            .get(id)
            .map_or(false, |entry| entry.active)
    }

    pub(crate) fn watcher_priority(&self, id: WatcherId) -> Priority {
        self.watchers
            .borrow()
            .get(id)
            .map_or(Priority::Normal, |entry| entry.priority)
    }

    pub(crate) fn set_watcher_priority(&self, id: WatcherId, priority: Priority) -> Result<()> {
        let mut watchers = self.watchers.borrow_mut();
        let entry = watchers.get_mut(id).ok_or(Error::WatcherCancelled)?;
        entry.priority = priority;
        Ok(())
    }

    pub(crate) fn watcher_mask(&self, id: WatcherId) -> EventSet {
        self.watchers.borrow().get(id).map_or(EventSet::NONE, |entry| {
            if let WatcherKind::Io { mask, .. } = entry.kind {
                mask
            } else {
                EventSet::NONE
            }
        })
    }

    pub(crate) fn set_watcher_mask(&self, id: WatcherId, new_mask: EventSet) -> Result<()> {
        let mut watchers = self.watchers.borrow_mut();
        let entry = watchers.get_mut(id).ok_or(Error::WatcherCancelled)?;
        let WatcherKind::Io { fd, ref mut mask } = entry.kind else {
            return Err(Error::WatcherKind);
        };
        let old_mask = *mask;
        *mask = new_mask;
        if entry.active {
            let poll = self.poll.borrow();
            match (old_mask.is_empty(), new_mask.is_empty()) {
                (false, false) => poll.reregister(fd, id.token(), new_mask)?,
                (false, true) => poll.deregister(fd)?,
                (true, false) => poll.register(fd, id.token(), new_mask)?,
                (true, true) => {}
            }
        }
        Ok(())
    }

    pub(crate) fn watcher_seconds(&self, id: WatcherId) -> f64 {
        self.watchers.borrow().get(id).map_or(0.0, |entry| {
            if let WatcherKind::Timer { period } = entry.kind {
                period.as_secs_f64()
            } else {
                0.0
            }
        })
    }

    pub(crate) fn set_watcher_seconds(&self, id: WatcherId, seconds: f64) -> Result<()> {
        let mut watchers = self.watchers.borrow_mut();
        let entry = watchers.get_mut(id).ok_or(Error::WatcherCancelled)?;
        let WatcherKind::Timer { ref mut period } = entry.kind else {
            return Err(Error::WatcherKind);
        };
        // Stop first: stale deadlines in the queue turn invalid.
        entry.epoch += 1;
        entry.active = false;
        if seconds > 0.0 {
            *period = Duration::from_secs_f64(seconds);
            entry.active = true;
            self.timers.borrow_mut().push(TimerEntry {
                deadline: Instant::now() + *period,
                id,
                epoch: entry.epoch,
            });
        } else {
            *period = Duration::ZERO;
        }
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.running.set(false);
    }

    pub(crate) fn time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn any_idle_armed(&self) -> bool {
        self.watchers
            .borrow()
            .iter()
            .any(|(_, entry)| entry.active && matches!(entry.kind, WatcherKind::Idle))
    }

    fn poll_timeout(&self) -> Duration {
        let cap = Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS);
        #[cfg(unix)]
        {
            if sig::peek_pending() != 0 {
                return Duration::ZERO;
            }
        }
        if self.any_idle_armed() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();
        let watchers = self.watchers.borrow();
        while let Some(top) = timers.peek() {
            let valid = watchers
                .get(top.id)
                .map_or(false, |entry| entry.active && entry.epoch == top.epoch);
            if !valid {
                timers.pop();
                continue;
            }
            return top.deadline.saturating_duration_since(now).min(cap);
        }
        cap
    }

    /// Deliver one event to one watcher. Returns whether a callback ran.
    /// The callback is taken out of the registry for the duration of the
    /// call so it may freely mutate the registry, including cancelling its
    /// own watcher.
    fn dispatch(&self, ev: &EventLoop, id: WatcherId, set: EventSet) -> bool {
        let mut callback = {
            let mut watchers = self.watchers.borrow_mut();
            let Some(entry) = watchers.get_mut(id) else {
                return false;
            };
            if !entry.active && !set.contains(EventSet::CLEANUP) {
                return false;
            }
            match entry.callback.take() {
                Some(callback) => callback,
                None => return false,
            }
        };

        let watcher = Watcher::new(Rc::downgrade(&ev.inner), id);
        callback(ev, &watcher, set);

        let leftover = {
            let mut watchers = self.watchers.borrow_mut();
            match watchers.get_mut(id) {
                Some(entry) => {
                    entry.callback = Some(callback);
                    None
                }
                // Cancelled during its own callback.
                None => Some(callback),
            }
        };
        drop(leftover);

        if set.contains(EventSet::CLEANUP) {
            self.cancel_watcher(id);
        }
        true
    }

    /// One dispatch iteration: poll, deliver ready events in priority
    /// order, then run idle watchers if nothing else fired.
    fn turn(&self, ev: &EventLoop) -> Result<()> {
        let timeout = self.poll_timeout();
        let io_ready = self.poll.borrow_mut().poll(Some(timeout))?;

        let mut batch: Vec<(Priority, WatcherId, EventSet)> = Vec::new();
        {
            let watchers = self.watchers.borrow();
            for (token, set) in io_ready {
                let id = WatcherId::from_token(token);
                if let Some(entry) = watchers.get(id) {
                    if entry.active && matches!(entry.kind, WatcherKind::Io { .. }) {
                        batch.push((entry.priority, id, set));
                    }
                }
            }
        }

        let now = Instant::now();
        {
            let mut timers = self.timers.borrow_mut();
            let watchers = self.watchers.borrow();
            while let Some(top) = timers.peek() {
                if top.deadline > now {
                    break;
                }
                let due = timers.pop().expect("peeked entry");
                let Some(entry) = watchers.get(due.id) else {
                    continue;
                };
                if !entry.active || entry.epoch != due.epoch {
                    continue;
                }
                if let WatcherKind::Timer { period } = entry.kind {
                    batch.push((entry.priority, due.id, EventSet::TIMER));
                    if period > Duration::ZERO {
                        timers.push(TimerEntry {
                            deadline: now + period,
                            id: due.id,
                            epoch: due.epoch,
                        });
                    }
                }
            }
        }

        #[cfg(unix)]
        {
            let pending = sig::take_pending();
            if pending != 0 {
                let watchers = self.watchers.borrow();
                for (id, entry) in watchers.iter() {
                    if let WatcherKind::Signal { signum } = entry.kind {
                        if entry.active && pending & (1u64 << signum) != 0 {
                            batch.push((entry.priority, id, EventSet::SIGNAL));
                        }
                    }
                }
            }
        }

        // Stable sort: equal priorities keep their collection order.
        batch.sort_by(|a, b| b.0.cmp(&a.0));

        let mut fired = 0usize;
        for (_, id, set) in batch {
            if self.dispatch(ev, id, set) {
                fired += 1;
            }
            if !self.running.get() {
                return Ok(());
            }
        }

        if fired == 0 {
            let mut idles: Vec<(Priority, WatcherId)> = self
                .watchers
                .borrow()
                .iter()
                .filter(|(_, entry)| entry.active && matches!(entry.kind, WatcherKind::Idle))
                .map(|(id, entry)| (entry.priority, id))
                .collect();
            idles.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in idles {
                self.dispatch(ev, id, EventSet::IDLE);
                if !self.running.get() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Deliver CLEANUP to every live watcher and release everything the
    /// reactor owns. Runs once, when the last user handle drops.
    fn teardown(&self, ev: &EventLoop) {
        if self.torn_down.replace(true) {
            return;
        }
        self.running.set(false);
        debug!("event loop teardown");

        let mut ids: Vec<(Priority, WatcherId)> = self
            .watchers
            .borrow()
            .iter()
            .map(|(id, entry)| (entry.priority, id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in ids {
            self.dispatch(ev, id, EventSet::CLEANUP);
        }

        let leftovers = self.watchers.borrow_mut().drain_entries();
        drop(leftovers);
        self.deferred.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        self.drain_idle.set(None);
    }
}

/// Single-threaded event dispatcher.
///
/// An `EventLoop` is a cheap handle to reactor state bound to one readiness
/// backend. All watcher callbacks, protocol callbacks and deferred calls run
/// serially on the thread that calls [`run`](EventLoop::run); handles are
/// not `Send`, so cross-thread use is rejected at compile time.
///
/// When the last handle drops, every live watcher receives a CLEANUP event
/// and is cancelled, and the backend is released.
pub struct EventLoop {
    pub(crate) inner: Rc<Reactor>,
}

impl Clone for EventLoop {
    fn clone(&self) -> Self {
        EventLoop {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 && !self.inner.torn_down.get() {
            self.inner.teardown(self);
        }
    }
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        Ok(EventLoop {
            inner: Rc::new(Reactor::new()?),
        })
    }

    /// The thread-local default loop, created on first access and torn down
    /// when the thread exits.
    pub fn default_loop() -> EventLoop {
        thread_local! {
            static DEFAULT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
        }
        DEFAULT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(EventLoop::new().expect("failed to create default event loop"));
            }
            slot.as_ref().expect("just initialised").clone()
        })
    }

    /// Enter the dispatch loop. Returns after [`stop`](EventLoop::stop) is
    /// called, or with the backend error that ended dispatch.
    pub fn run(&self) -> Result<()> {
        self.inner.running.set(true);
        debug!("event loop running");
        while self.inner.running.get() {
            if let Err(e) = self.inner.turn(self) {
                self.inner.running.set(false);
                warn!(error = %e, "event loop exiting on backend failure");
                return Err(e);
            }
        }
        debug!("event loop stopped");
        Ok(())
    }

    /// Request dispatch to exit at the next safe point.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Monotonic timestamp in seconds since the loop was created.
    pub fn time(&self) -> f64 {
        self.inner.time()
    }

    /// Enqueue `f` for deferred execution at the next idle point. Calls run
    /// in FIFO order, one per idle pass, and never before the current
    /// callback returns.
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(f));
        self.ensure_drain_idle();
    }

    fn ensure_drain_idle(&self) {
        if let Some(id) = self.inner.drain_idle.get() {
            if self.inner.start_watcher(id).is_ok() {
                return;
            }
        }
        let watcher = self.idle_watcher(|ev, watcher, set| {
            if set.contains(EventSet::CLEANUP) {
                return;
            }
            let job = {
                let mut queue = ev.inner.deferred.borrow_mut();
                // Disarm when this pop leaves the queue empty.
                if queue.len() <= 1 {
                    watcher.stop();
                }
                queue.pop_front()
            };
            if let Some(job) = job {
                job(ev);
            }
        });
        self.inner.drain_idle.set(Some(watcher.id()));
        let _ = watcher.start();
    }

    /// Register a one-shot timer. On fire, `f` runs once, the watcher is
    /// cancelled and removed from the registry. The returned handle can be
    /// used to cancel it beforehand.
    pub fn on_timeout<F>(&self, delay_seconds: f64, f: F) -> Result<Watcher>
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        let mut f = Some(f);
        let watcher = self.timer_watcher(delay_seconds.max(1e-9), move |ev, watcher, set| {
            if set.contains(EventSet::CLEANUP) {
                return;
            }
            if let Some(f) = f.take() {
                f(ev);
            }
            watcher.cancel();
        });
        watcher.start()?;
        Ok(watcher)
    }

    /// Register a one-shot hook for signal number `signum` (POSIX only).
    /// Semantics match [`on_timeout`](EventLoop::on_timeout).
    pub fn on_signal<F>(&self, signum: i32, f: F) -> Result<Watcher>
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        let mut f = Some(f);
        let watcher = self.signal_watcher(signum, move |ev, watcher, set| {
            if set.contains(EventSet::CLEANUP) {
                return;
            }
            if let Some(f) = f.take() {
                f(ev);
            }
            watcher.cancel();
        });
        watcher.start()?;
        Ok(watcher)
    }

    /// I/O readiness watcher on a raw file descriptor. Starts disarmed.
    pub fn io_watcher<F>(&self, fd: RawFd, mask: EventSet, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        self.add_watcher(WatcherKind::Io { fd, mask }, callback)
    }

    /// Repeating timer watcher with a period in seconds. Starts disarmed.
    pub fn timer_watcher<F>(&self, seconds: f64, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        let period = if seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        };
        self.add_watcher(WatcherKind::Timer { period }, callback)
    }

    /// Signal watcher for signal number `signum`. Starts disarmed.
    pub fn signal_watcher<F>(&self, signum: i32, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        self.add_watcher(WatcherKind::Signal { signum }, callback)
    }

    /// Idle watcher: runs whenever a dispatch iteration has nothing else to
    /// deliver. Starts disarmed.
    pub fn idle_watcher<F>(&self, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        self.add_watcher(WatcherKind::Idle, callback)
    }

    /// Cleanup watcher: fires once, with the CLEANUP bit, when the reactor
    /// is torn down. Armed on creation.
    pub fn cleanup_watcher<F>(&self, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        let watcher = self.add_watcher(WatcherKind::Cleanup, callback);
        let _ = watcher.start();
        watcher
    }

    fn add_watcher<F>(&self, kind: WatcherKind, callback: F) -> Watcher
    where
        F: FnMut(&EventLoop, &Watcher, EventSet) + 'static,
    {
        let id = self.inner.add_watcher(kind, Box::new(callback));
        Watcher::new(Rc::downgrade(&self.inner), id)
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }
}
