//! Edge-triggered named timeouts
//!
//! Every wait of the rendezvous state machines is bounded by one of a fixed set of
//! named timeouts. All of them share the single hardware alarm: the MAC asks
//! [`TimeoutManager::next_deadline`] which one is nearest, arms the alarm for it and,
//! when the alarm fires, calls [`TimeoutManager::expire_due`] which re-compares every
//! deadline against the counter. Expiry is then observed with
//! [`TimeoutManager::is_expired`], which reports each expiry exactly once.

use crate::time::{is_due, remaining, Tick};

/// Kind of a MAC timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Spacing between two wake requests
    Wr,
    /// Overall budget of a transmission attempt
    NoResponse,
    /// Confirmation of a sent wake ack
    Wa,
    /// Receiver waiting for data
    Data,
    /// Sender waiting for a known destination phase
    WaitDestWakeup,
    /// Extended listening window
    WakeupPeriod,
    /// Spacing between two broadcast copies
    NextBroadcast,
    /// End of a broadcast
    BroadcastEnd,
}

const KIND_COUNT: usize = 8;

impl TimeoutKind {
    /// All timeout kinds
    pub const ALL: [TimeoutKind; KIND_COUNT] = [
        TimeoutKind::Wr,
        TimeoutKind::NoResponse,
        TimeoutKind::Wa,
        TimeoutKind::Data,
        TimeoutKind::WaitDestWakeup,
        TimeoutKind::WakeupPeriod,
        TimeoutKind::NextBroadcast,
        TimeoutKind::BroadcastEnd,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Slot {
    #[default]
    Idle,
    Armed {
        deadline: Tick,
    },
    Expired,
}

/// Set of named timeouts multiplexed onto one alarm
#[derive(Debug, Default)]
pub struct TimeoutManager {
    slots: [Slot; KIND_COUNT],
}

impl TimeoutManager {
    /// Creates a manager with every timeout idle
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) `kind` to expire `offset` ticks after `now`
    pub fn set(&mut self, kind: TimeoutKind, offset: Tick, now: Tick) {
        self.slots[kind.index()] = Slot::Armed {
            deadline: now.wrapping_add(offset),
        };
    }

    /// Disarms `kind`, dropping an unobserved expiry
    pub fn clear(&mut self, kind: TimeoutKind) {
        self.slots[kind.index()] = Slot::Idle;
    }

    /// Disarms every timeout
    pub fn clear_all(&mut self) {
        self.slots = Default::default();
    }

    /// Returns whether `kind` is armed or has expired without being observed
    pub fn is_running(&self, kind: TimeoutKind) -> bool {
        self.slots[kind.index()] != Slot::Idle
    }

    /// Returns true once after `kind` expired, disarming it
    pub fn is_expired(&mut self, kind: TimeoutKind) -> bool {
        let slot = &mut self.slots[kind.index()];
        if *slot == Slot::Expired {
            *slot = Slot::Idle;
            true
        } else {
            false
        }
    }

    /// Marks every armed timeout whose deadline has passed as expired
    ///
    /// Returns the number of newly expired timeouts.
    pub fn expire_due(&mut self, now: Tick) -> usize {
        let mut expired = 0;
        for slot in self.slots.iter_mut() {
            if let Slot::Armed { deadline } = *slot {
                if is_due(deadline, now) {
                    *slot = Slot::Expired;
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Nearest armed deadline and the kind it belongs to
    pub fn next_deadline(&self, now: Tick) -> Option<(Tick, TimeoutKind)> {
        TimeoutKind::ALL
            .iter()
            .filter_map(|&kind| match self.slots[kind.index()] {
                Slot::Armed { deadline } => Some((deadline, kind)),
                _ => None,
            })
            .min_by_key(|(deadline, _)| remaining(*deadline, now))
    }
}
