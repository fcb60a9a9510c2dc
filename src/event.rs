use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of event kinds delivered to watcher callbacks.
///
/// I/O watchers subscribe with `READ`/`WRITE`; the remaining bits identify
/// the source of a delivery: `TIMER`, `SIGNAL` and `IDLE` for their watcher
/// kinds, `ERROR` for error readiness on a file descriptor, and `CLEANUP`
/// when the reactor is being torn down.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(0x01);
    pub const WRITE: EventSet = EventSet(0x02);
    pub const TIMER: EventSet = EventSet(0x04);
    pub const SIGNAL: EventSet = EventSet(0x08);
    pub const IDLE: EventSet = EventSet(0x10);
    pub const CLEANUP: EventSet = EventSet(0x20);
    pub const ERROR: EventSet = EventSet(0x40);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is set in `self`.
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    pub fn is_readable(self) -> bool {
        self.intersects(EventSet::READ)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(EventSet::WRITE)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventSet, &str); 7] = [
            (EventSet::READ, "READ"),
            (EventSet::WRITE, "WRITE"),
            (EventSet::TIMER, "TIMER"),
            (EventSet::SIGNAL, "SIGNAL"),
            (EventSet::IDLE, "IDLE"),
            (EventSet::CLEANUP, "CLEANUP"),
            (EventSet::ERROR, "ERROR"),
        ];

        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// Dispatch priority of a watcher.
///
/// Within one dispatch iteration, ready events are delivered highest
/// priority first; the order among equal priorities is unspecified but
/// stable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}
