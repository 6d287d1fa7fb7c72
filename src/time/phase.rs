//! Phase arithmetic
//!
//! A wake-up schedule is identified by an anchor: any tick at which the node
//! woke up. A phase is the offset of an instant after such an anchor, always in
//! `[0, interval)`. Offsets are taken from the wrapping difference of two ticks,
//! never from raw counter values, since the counter range is not a multiple of
//! the interval. Both ticks only need to be within half the counter range of each
//! other.

use super::Tick;

/// Offset of `to` after the schedule anchored at `from`, in `[0, interval)`
pub fn phase_offset(from: Tick, to: Tick, interval: Tick) -> Tick {
    if interval == 0 {
        return 0;
    }
    let delta = i64::from(to.wrapping_sub(from) as i32);
    delta.rem_euclid(i64::from(interval)) as Tick
}

/// Circular distance between two schedules given by their anchors
pub fn phase_distance(a: Tick, b: Tick, interval: Tick) -> Tick {
    let forward = phase_offset(a, b, interval);
    forward.min(interval - forward)
}

/// Ticks from `now` until the schedule anchored at `anchor` next wakes up
///
/// Returns 0 when `now` is exactly a wake-up of that schedule.
pub fn ticks_until_phase(now: Tick, anchor: Tick, interval: Tick) -> Tick {
    phase_offset(now, anchor, interval)
}

/// Smallest tick `t` with `t ≡ last (mod interval)` and `t >= now + margin`
///
/// `last` may lie in the past or in the future of `now`, and either side may have
/// wrapped; the two only need to be within half the counter range of each other.
pub fn next_in_phase(now: Tick, last: Tick, interval: Tick, margin: Tick) -> Tick {
    let earliest = now.wrapping_add(margin);
    if interval == 0 {
        return earliest;
    }
    let delta = i64::from(last.wrapping_sub(earliest) as i32);
    let offset = delta.rem_euclid(i64::from(interval)) as Tick;
    earliest.wrapping_add(offset)
}
