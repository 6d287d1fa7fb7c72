//! Wake-up scheduling
//!
//! The node alternates between a short listening window and a long sleep. Both
//! transitions are driven by one periodic duty-cycle alarm anchored at the tick of
//! the last wake-up, so that the wake-up phase stays stable across cycles. The
//! alarm is paused for the duration of every TX/RX transaction and resumed in
//! phase afterwards.

use tracing::{debug, info, warn};

use crate::core::Timing;
use crate::radio::{Radio, RadioState};
use crate::time::{is_due, next_in_phase, ticks_until_phase, Tick, Ticker};

use super::neighbor::NeighborRef;
use super::timeout::TimeoutKind;
use super::{CycleFlags, Mac, MacState};

/// Duty-cycle transition carried by the scheduler alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DutyEvent {
    /// Time to wake up and listen
    WakeupPending,
    /// Time to end the listening window
    SleepPending,
}

/// Control actions on the duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DutyControl {
    Start,
    Stop,
    Pause,
    Resume,
}

/// Periodic duty-cycle alarm
#[derive(Debug)]
pub struct WakeupScheduler {
    last_wakeup: Tick,
    alarm: Option<(Tick, DutyEvent)>,
    active: bool,
}

impl WakeupScheduler {
    pub fn new(now: Tick) -> Self {
        WakeupScheduler {
            last_wakeup: now,
            alarm: None,
            active: false,
        }
    }

    pub fn last_wakeup(&self) -> Tick {
        self.last_wakeup
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Duty-cycle alarm waiting to fire
    pub fn pending(&self) -> Option<(Tick, DutyEvent)> {
        if self.active {
            self.alarm
        } else {
            None
        }
    }

    /// Begins duty cycling with a listening window starting now
    pub fn start(&mut self, now: Tick, timing: &Timing) {
        self.last_wakeup = now;
        self.alarm = Some((
            now.wrapping_add(timing.wakeup_duration),
            DutyEvent::SleepPending,
        ));
        self.active = true;
    }

    /// Disarms the alarm; late alarms are ignored until the next resume
    pub fn stop(&mut self) {
        self.alarm = None;
        self.active = false;
    }

    /// Re-arms the next wake-up in phase with the last one
    pub fn resume(&mut self, now: Tick, timing: &Timing) {
        let at = next_in_phase(now, self.last_wakeup, timing.interval, timing.event_margin);
        self.alarm = Some((at, DutyEvent::WakeupPending));
        self.active = true;
    }

    /// Takes the alarm if it is due at `now`
    pub fn take_due(&mut self, now: Tick) -> Option<(Tick, DutyEvent)> {
        match self.alarm {
            Some((at, event)) if self.active && is_due(at, now) => {
                self.alarm = None;
                Some((at, event))
            }
            _ => None,
        }
    }

    /// Records a wake-up that was due at `at` and arms the end of its window
    pub fn woke_up(&mut self, at: Tick, now: Tick, timing: &Timing) {
        self.last_wakeup = at;
        let end = next_in_phase(now, at, timing.wakeup_duration, timing.event_margin);
        self.alarm = Some((end, DutyEvent::SleepPending));
    }

    /// Arms the next wake-up after a listening window ended
    pub fn fell_asleep(&mut self, now: Tick, timing: &Timing) {
        let at = next_in_phase(now, self.last_wakeup, timing.interval, timing.event_margin);
        self.alarm = Some((at, DutyEvent::WakeupPending));
    }

    /// Moves the wake-up phase by `shift` ticks
    pub fn shift_phase(&mut self, shift: Tick, now: Tick, timing: &Timing) {
        self.last_wakeup = self.last_wakeup.wrapping_add(shift);
        self.resume(now, timing);
    }
}

impl<R: Radio, T: Ticker> Mac<R, T> {
    pub(super) fn on_duty_event(&mut self, at: Tick, event: DutyEvent) {
        let now = self.now();
        match event {
            DutyEvent::WakeupPending => {
                self.scheduler.woke_up(at, now, &self.timing);
                self.neighbors.rebase_anchors(now, self.timing.interval);
                self.flags = CycleFlags::default();
                self.rx.bad_attempts = 0;
                debug!(at, "wake-up");
                self.set_state(MacState::Listening);
            }
            DutyEvent::SleepPending => {
                self.scheduler.fell_asleep(now, &self.timing);
                self.set_state(MacState::Sleeping);
            }
        }
    }

    pub(super) fn duty_control(&mut self, control: DutyControl) {
        let now = self.now();
        match control {
            DutyControl::Start => {
                self.neighbors.rebase_anchors(now, self.timing.interval);
                self.scheduler.start(now, &self.timing);
            }
            DutyControl::Stop | DutyControl::Pause => self.scheduler.stop(),
            DutyControl::Resume => self.scheduler.resume(now, &self.timing),
        }
    }

    /// Random phase shift away from a colliding neighbour
    pub(super) fn shift_phase(&mut self) {
        let guard = self.timing.phase_guard();
        let shift = self.random_in(guard, self.timing.interval - guard);
        let now = self.now();
        self.scheduler.shift_phase(shift, now, &self.timing);
        warn!(shift, wake_anchor = self.scheduler.last_wakeup(), "phase backoff");
    }

    /// Picks the next transmission while sleeping
    pub(super) fn sleep_management(&mut self) {
        if self.timeouts.is_running(TimeoutKind::WaitDestWakeup) {
            if self.timeouts.is_expired(TimeoutKind::WaitDestWakeup) {
                debug!("destination should be awake now");
                self.tx.tx_continue = false;
                self.tx.burst_count = 0;
                self.set_state(MacState::Transmitting);
            }
            return;
        }

        let target = match self.select_target() {
            Some(target) => target,
            None => return,
        };
        self.tx.current = Some(target);

        let anchor = match self.neighbors.wake_anchor(target) {
            Some(anchor) => anchor,
            None => {
                debug!(?target, "phase unknown, transmitting now");
                self.tx.tx_continue = false;
                self.tx.burst_count = 0;
                self.set_state(MacState::Transmitting);
                return;
            }
        };

        let now = self.now();
        let interval = self.timing.interval;
        let jitter = self.random_in(0, self.timing.time_between_wr);
        let lead = self.timing.wr_preparation + jitter;
        let until = ticks_until_phase(now, anchor, interval);
        let wait = if until < lead {
            until + interval - lead
        } else {
            until - lead
        };

        info!(?target, until, wait, "waiting for destination to wake up");
        self.timeouts.set(TimeoutKind::WaitDestWakeup, wait, now);
        self.duty_control(DutyControl::Pause);
    }

    /// Chooses what to send next: broadcast first, then a held target, then the
    /// next neighbour in round-robin order
    fn select_target(&mut self) -> Option<NeighborRef> {
        if self.neighbors.has_broadcast() {
            if self.tx.current != Some(NeighborRef::Broadcast) {
                self.requeue_held_packet();
            }
            self.tx.tx_continue = false;
            self.tx.burst_count = 0;
            return Some(NeighborRef::Broadcast);
        }
        self.tx.current.or_else(|| self.neighbors.next_round_robin())
    }

    /// Listening: ends the window, or hands received frames to the RX machine
    pub(super) fn listen_management(&mut self) {
        if self.neighbors.has_pending() || self.tx.current.is_some() {
            // the window is ended by the wakeup period instead of the duty-cycle alarm
            self.duty_control(DutyControl::Pause);
        }

        let now = self.now();
        if !self.timeouts.is_running(TimeoutKind::WakeupPeriod) {
            self.timeouts
                .set(TimeoutKind::WakeupPeriod, self.timing.wakeup_duration, now);
        } else if self.timeouts.is_expired(TimeoutKind::WakeupPeriod) {
            self.dispatch();
            debug!("listening window over");
            self.state = MacState::Sleeping;
            self.duty_control(DutyControl::Resume);
            self.set_radio_state(RadioState::Sleep);
            self.timeouts.clear(TimeoutKind::WakeupPeriod);
            if self.neighbors.has_pending() || self.tx.current.is_some() {
                self.reschedule = true;
            }
            return;
        }

        if !self.rx_queue.is_empty() {
            self.timeouts.clear(TimeoutKind::WakeupPeriod);
            self.set_state(MacState::Receiving);
        }
    }
}
