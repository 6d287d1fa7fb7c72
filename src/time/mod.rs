//! Hardware ticker abstraction and tick arithmetic
//!
//! The MAC runs on a single free-running, wrapping tick counter with exactly one
//! alarm register. Everything time-related in the crate is expressed in raw ticks
//! of that counter:
//!
//! - [`Ticker`] is the hardware collaborator (counter + one alarm)
//! - [`AlarmTag`] names what the physically armed alarm is for
//! - [`phase`] holds the modular arithmetic used by the wake-up scheduler
//!
//! Deadlines are compared with wrapping arithmetic, so every comparison stays
//! correct across a counter overflow as long as the two instants are less than
//! half the counter range apart.

pub mod phase;

pub use self::phase::{next_in_phase, phase_distance, phase_offset, ticks_until_phase};

use crate::mac::{DutyEvent, TimeoutKind};

/// Raw value of the hardware tick counter
pub type Tick = u32;

/// Upper bound on iterations of the guard spin
pub const GUARD_SPIN_LIMIT: u32 = 10_000;

/// Smallest distance between the counter and a freshly armed alarm
pub const MIN_ALARM_LEAD: Tick = 2;

/// Identifies the purpose of the single hardware alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmTag {
    /// A timeout of the transaction state machines
    Timeout(TimeoutKind),
    /// A duty-cycle transition of the wake-up scheduler
    DutyCycle(DutyEvent),
}

/// Hardware ticker collaborator
///
/// Implementations deliver `MacEvent::Alarm(tag)` into the MAC event channel at or
/// after the armed tick. Arming replaces any previously armed alarm.
pub trait Ticker {
    /// Current counter value
    fn now(&self) -> Tick;

    /// Arms the alarm register
    fn set_alarm(&mut self, at: Tick, tag: AlarmTag);

    /// Disarms the alarm register
    fn clear_alarm(&mut self);
}

/// Alarm tick for `deadline`, pushed to at least [`MIN_ALARM_LEAD`] ticks past `now`
pub fn alarm_tick(deadline: Tick, now: Tick) -> Tick {
    if remaining(deadline, now) < MIN_ALARM_LEAD as i32 {
        now.wrapping_add(MIN_ALARM_LEAD)
    } else {
        deadline
    }
}

/// Returns whether `deadline` has been reached at `now`
pub fn is_due(deadline: Tick, now: Tick) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// Signed number of ticks from `now` until `deadline`
pub fn remaining(deadline: Tick, now: Tick) -> i32 {
    deadline.wrapping_sub(now) as i32
}

/// Spins until the tick counter advances once, bounded by [`GUARD_SPIN_LIMIT`]
///
/// This is the only busy wait in the crate. It is used right before writing an
/// alarm whose target sits within one tick of the counter, where the write could
/// otherwise race the counter past the target. Returns whether an edge was seen.
pub fn wait_for_tick_edge<T: Ticker + ?Sized>(ticker: &T) -> bool {
    let start = ticker.now();
    for _ in 0..GUARD_SPIN_LIMIT {
        if ticker.now() != start {
            return true;
        }
        std::hint::spin_loop();
    }
    false
}
