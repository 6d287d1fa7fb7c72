//! Duty-cycled MAC
//!
//! [`Mac`] owns every piece of per-interface state: the duty-cycle scheduler, the
//! timeouts, the neighbour queues and the two rendezvous state machines. It is
//! driven exclusively through [`Mac::handle_event`]: each event is applied, then a
//! settle pass advances whichever sub-machine matches the current [`MacState`]
//! until none of them can make further progress, and finally the single hardware
//! alarm is re-armed for the nearest pending deadline.
//!
//! The sub-machines live in their own modules as further `impl` blocks of [`Mac`]:
//!
//! - `scheduler`: wake-up / sleep transitions, target selection while sleeping
//! - `rx`: wake request → wake ack → data reception
//! - `tx`: wake request hunting, phase learning, bursts and broadcasts

mod dispatch;
pub mod neighbor;
mod rx;
mod scheduler;
mod service;
#[cfg(test)]
mod stub;
pub mod timeout;
mod tx;

pub use self::dispatch::{Deferred, Delivery, DispatchBuffer};
pub use self::neighbor::{EnqueueError, Neighbor, NeighborRef, NeighborTable, QueuedPacket};
pub use self::rx::RxState;
pub use self::scheduler::{DutyEvent, WakeupScheduler};
pub use self::service::{channel, channel_for, MacHandle};
pub use self::timeout::{TimeoutKind, TimeoutManager};
pub use self::tx::TxState;

use std::collections::VecDeque;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::core::{Destination, L2Addr, MacConfig, NetState, Result, Timing};
use crate::protocol::{decode_packet, encode_packet, Packet};
use crate::radio::{Radio, RadioEvent, RadioState, TxFeedback};
use crate::time::{
    alarm_tick, remaining, wait_for_tick_edge, AlarmTag, Tick, Ticker, MIN_ALARM_LEAD,
};

use self::rx::RxContext;
use self::scheduler::DutyControl;
use self::tx::TxContext;

/// Top-level MAC state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacState {
    Stopped,
    /// Transient: duty cycling is being started
    Start,
    Listening,
    Sleeping,
    Receiving,
    Transmitting,
    /// Transient: duty cycling is being stopped
    Stop,
    /// Transient: stop followed by start
    Reset,
}

/// Event consumed by the MAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacEvent {
    /// Notification from the radio driver
    Radio(RadioEvent),
    /// Upper-layer send request
    Send { dst: Destination, payload: Bytes },
    /// The hardware alarm fired
    Alarm(AlarmTag),
    /// Upper-layer interface state request
    SetState(NetState),
}

/// Notification for the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    /// A payload was received
    Received {
        src: L2Addr,
        payload: Bytes,
        broadcast: bool,
    },
    /// A payload was given up on
    SendFailed { dst: Destination, payload: Bytes },
}

/// Flags that live for one wake-up cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CycleFlags {
    /// No further transmission attempts this cycle
    quit_tx: bool,
    /// No further reception attempts this cycle
    quit_rx: bool,
    /// Own phase is too close to a neighbour's; shift it when going to sleep
    phase_backoff: bool,
}

/// Radio-on time accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DutyCycleStats {
    /// Ticks the radio spent powered
    pub awake_ticks: u64,
    /// Ticks since the MAC was created
    pub elapsed_ticks: u64,
}

impl DutyCycleStats {
    /// Achieved duty cycle in percent
    pub fn percent(&self) -> f64 {
        if self.elapsed_ticks == 0 {
            return 0.0;
        }
        self.awake_ticks as f64 * 100.0 / self.elapsed_ticks as f64
    }
}

#[derive(Debug)]
struct RadioUsage {
    created_at: Tick,
    awake: u64,
    on_since: Option<Tick>,
}

/// Duty-cycled MAC bound to one radio and one ticker
pub struct Mac<R, T> {
    config: MacConfig,
    timing: Timing,
    addr: L2Addr,
    radio: R,
    ticker: T,
    rng: StdRng,
    upper: mpsc::Sender<Indication>,

    state: MacState,
    /// Set whenever a step made progress; the settle pass runs until it stays clear
    reschedule: bool,
    flags: CycleFlags,
    rx_started: bool,
    tx_feedback: TxFeedback,

    scheduler: WakeupScheduler,
    timeouts: TimeoutManager,
    /// What the hardware alarm is currently armed for
    programmed: Option<(Tick, AlarmTag)>,

    neighbors: NeighborTable,
    rx_queue: VecDeque<Packet>,
    dispatcher: DispatchBuffer,
    tx: TxContext,
    rx: RxContext,
    usage: RadioUsage,
}

impl<R: Radio, T: Ticker> Mac<R, T> {
    /// Creates a stopped MAC
    pub fn new(
        config: MacConfig,
        radio: R,
        ticker: T,
        upper: mpsc::Sender<Indication>,
    ) -> Result<Self> {
        config.validate()?;
        let timing = config.timing();
        let addr = radio.address();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let now = ticker.now();

        Ok(Mac {
            timing,
            addr,
            radio,
            ticker,
            rng,
            upper,
            state: MacState::Stopped,
            reschedule: false,
            flags: CycleFlags::default(),
            rx_started: false,
            tx_feedback: TxFeedback::Undefined,
            scheduler: WakeupScheduler::new(now),
            timeouts: TimeoutManager::new(),
            programmed: None,
            neighbors: NeighborTable::new(config.tx_queue_capacity, config.max_neighbors),
            rx_queue: VecDeque::with_capacity(config.rx_queue_capacity),
            dispatcher: DispatchBuffer::new(config.rx_queue_capacity),
            tx: TxContext::new(addr.0[0]),
            rx: RxContext::default(),
            usage: RadioUsage {
                created_at: now,
                awake: 0,
                on_since: None,
            },
            config,
        })
    }

    /// Starts duty cycling
    pub fn start(&mut self) {
        self.handle_event(MacEvent::SetState(NetState::Idle));
    }

    /// Applies one event and settles every state machine
    pub fn handle_event(&mut self, event: MacEvent) {
        match event {
            MacEvent::Radio(event) => self.on_radio_event(event),
            MacEvent::Send { dst, payload } => self.enqueue(dst, payload),
            MacEvent::Alarm(tag) => self.on_alarm(tag),
            MacEvent::SetState(request) => self.on_state_request(request),
        }
        self.settle();
        self.program_alarm();
    }

    /// Advances the active sub-machine until it stops making progress
    pub fn settle(&mut self) {
        while self.update() {}
    }

    pub fn addr(&self) -> L2Addr {
        self.addr
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn rx_state(&self) -> RxState {
        self.rx.state
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.state
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// A tick at which a neighbour wakes up, kept near the current time
    pub fn neighbor_wake(&self, addr: L2Addr) -> Option<Tick> {
        self.neighbors
            .find(addr)
            .and_then(|i| self.neighbors.get(i))
            .and_then(|n| n.wake_anchor())
    }

    /// Tick of the most recent wake-up
    pub fn last_wakeup(&self) -> Tick {
        self.scheduler.last_wakeup()
    }

    pub fn is_duty_cycling(&self) -> bool {
        self.scheduler.is_active()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn ticker(&self) -> &T {
        &self.ticker
    }

    #[cfg(test)]
    pub(crate) fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Radio-on time since creation
    pub fn duty_cycle(&self) -> DutyCycleStats {
        let now = self.ticker.now();
        let current = self
            .usage
            .on_since
            .map_or(0, |since| u64::from(now.wrapping_sub(since)));
        DutyCycleStats {
            awake_ticks: self.usage.awake + current,
            elapsed_ticks: u64::from(now.wrapping_sub(self.usage.created_at)),
        }
    }

    fn update(&mut self) -> bool {
        self.reschedule = false;

        match self.state {
            MacState::Sleeping => {
                if !self.flags.quit_tx {
                    self.sleep_management();
                }
            }
            MacState::Listening => self.listen_management(),
            MacState::Receiving => self.rx_management(),
            MacState::Transmitting => self.tx_management(),
            MacState::Stopped | MacState::Start | MacState::Stop | MacState::Reset => {
                trace!(state = ?self.state, "nothing to update");
            }
        }

        self.reschedule
    }

    /// Switches the MAC state, running the leave and enter actions
    fn set_state(&mut self, new_state: MacState) {
        let old_state = self.state;
        if new_state == old_state {
            return;
        }
        debug!(from = ?old_state, to = ?new_state, "mac state");
        self.state = new_state;

        match old_state {
            MacState::Receiving | MacState::Transmitting => {
                self.duty_control(DutyControl::Resume);
                let stats = self.duty_cycle();
                debug!(percent = stats.percent(), "achieved duty cycle");
            }
            MacState::Sleeping => self.timeouts.clear(TimeoutKind::WakeupPeriod),
            _ => {}
        }

        match new_state {
            MacState::Listening => self.set_radio_state(RadioState::Idle),
            MacState::Sleeping => {
                self.set_radio_state(RadioState::Sleep);
                self.timeouts.clear(TimeoutKind::WakeupPeriod);
                if self.flags.phase_backoff {
                    self.flags.phase_backoff = false;
                    self.shift_phase();
                }
                // sleeping only progresses on the next event
                return;
            }
            MacState::Transmitting | MacState::Receiving => {
                self.duty_control(DutyControl::Pause);
                self.set_radio_state(RadioState::Idle);
            }
            MacState::Stopped => self.set_radio_state(RadioState::Off),
            MacState::Start => {
                info!(addr = %self.addr, "starting duty cycling");
                self.duty_control(DutyControl::Start);
                self.set_state(MacState::Listening);
            }
            MacState::Stop => {
                info!(addr = %self.addr, "stopping duty cycling");
                self.duty_control(DutyControl::Stop);
                self.abort_transactions();
                self.set_state(MacState::Stopped);
            }
            MacState::Reset => {
                warn!(addr = %self.addr, "resetting mac");
                self.set_state(MacState::Stop);
                self.set_state(MacState::Start);
            }
        }

        self.reschedule = true;
    }

    fn on_state_request(&mut self, request: NetState) {
        match request {
            NetState::Off => self.set_state(MacState::Stop),
            NetState::Idle if self.state == MacState::Stopped => self.set_state(MacState::Start),
            NetState::Idle => debug!(state = ?self.state, "already running"),
            NetState::Reset => self.set_state(MacState::Reset),
        }
    }

    /// Stops both transactions and every timeout, keeping queued packets
    fn abort_transactions(&mut self) {
        self.rx_stop();
        self.tx_abort();
        self.timeouts.clear_all();
        self.rx_queue.clear();
        self.rx_started = false;
    }

    fn enqueue(&mut self, dst: Destination, payload: Bytes) {
        let len = payload.len();
        match self.neighbors.enqueue(dst, QueuedPacket::new(payload)) {
            Ok(target) => {
                debug!(?dst, len, queued = self.neighbors.queue_len(target), "packet queued");
            }
            Err(err) => {
                let reason = match &err {
                    EnqueueError::QueueFull(_) => "queue full",
                    EnqueueError::TableFull(_) => "neighbor table full",
                };
                warn!(?dst, reason, "cannot queue packet");
                let payload = err.into_packet().payload;
                self.indicate(Indication::SendFailed { dst, payload });
            }
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        trace!(?event, "radio event");
        match event {
            RadioEvent::RxStarted => self.rx_started = true,
            RadioEvent::RxComplete => {
                self.rx_started = false;
                self.ingest_frames();
            }
            RadioEvent::TxStarted
            | RadioEvent::TxComplete
            | RadioEvent::TxNoAck
            | RadioEvent::TxBusy
            | RadioEvent::TxMediumBusy => {
                if event == RadioEvent::TxStarted {
                    // the transceiver drops any reception when it starts sending
                    self.rx_started = false;
                }
                if let Some(feedback) = TxFeedback::from_event(event) {
                    self.tx_feedback = feedback;
                }
            }
        }
    }

    /// Decodes every buffered frame into the inbound queue
    fn ingest_frames(&mut self) {
        while let Some(raw) = self.radio.recv() {
            let packet = match decode_packet(&raw) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            if !matches!(
                self.state,
                MacState::Listening | MacState::Receiving | MacState::Transmitting
            ) {
                trace!(state = ?self.state, kind = packet.frame.kind(), "ignoring frame");
                continue;
            }

            if self.rx_queue.len() >= self.config.rx_queue_capacity {
                warn!(src = %packet.src, kind = packet.frame.kind(), "inbound queue full, dropping frame");
                continue;
            }

            trace!(src = %packet.src, kind = packet.frame.kind(), "frame received");
            self.rx_queue.push_back(packet);
        }
    }

    fn on_alarm(&mut self, tag: AlarmTag) {
        let now = self.ticker.now();
        // the hardware alarm is one-shot
        self.programmed = None;

        match self.scheduler.take_due(now) {
            Some((at, event)) => self.on_duty_event(at, event),
            None if matches!(tag, AlarmTag::DutyCycle(_)) => {
                debug!(?tag, "ignoring late duty-cycle alarm");
            }
            None => {}
        }

        let expired = self.timeouts.expire_due(now);
        trace!(?tag, now, expired, "alarm");
    }

    /// Arms the hardware alarm for the nearest duty-cycle or timeout deadline
    ///
    /// Timeouts that are already due are expired and handled on the spot, so the
    /// alarm is never armed behind the counter.
    fn program_alarm(&mut self) {
        loop {
            let now = self.ticker.now();
            let expired = self.timeouts.expire_due(now);
            if expired == 0 {
                break;
            }
            trace!(now, expired, "timeouts due before arming");
            self.settle();
        }

        let now = self.ticker.now();
        let timeout = self
            .timeouts
            .next_deadline(now)
            .map(|(at, kind)| (at, AlarmTag::Timeout(kind)));
        let duty = self
            .scheduler
            .pending()
            .map(|(at, event)| (at, AlarmTag::DutyCycle(event)));

        let next = match (timeout, duty) {
            (Some(t), Some(d)) if remaining(d.0, now) < remaining(t.0, now) => Some(d),
            (Some(t), _) => Some(t),
            (None, d) => d,
        };

        if next == self.programmed {
            return;
        }

        match next {
            Some((at, tag)) => {
                let now = if remaining(at, now) < MIN_ALARM_LEAD as i32 {
                    wait_for_tick_edge(&self.ticker);
                    self.ticker.now()
                } else {
                    now
                };
                let armed = alarm_tick(at, now);
                trace!(at, armed, ?tag, "arming alarm");
                self.ticker.set_alarm(armed, tag);
            }
            None => self.ticker.clear_alarm(),
        }
        self.programmed = next;
    }

    fn set_radio_state(&mut self, state: RadioState) {
        let now = self.ticker.now();
        match state {
            RadioState::Idle | RadioState::Rx | RadioState::Tx => {
                if self.usage.on_since.is_none() {
                    self.usage.on_since = Some(now);
                }
            }
            RadioState::Sleep | RadioState::Off => {
                if let Some(since) = self.usage.on_since.take() {
                    self.usage.awake += u64::from(now.wrapping_sub(since));
                }
                self.rx_started = false;
            }
        }
        self.radio.set_state(state);
    }

    fn transmit(&mut self, packet: &Packet) -> Result<()> {
        let raw = encode_packet(packet)?;
        self.tx_feedback = TxFeedback::Undefined;
        trace!(kind = packet.frame.kind(), target = %packet.target(), "sending frame");
        self.radio.send(raw)
    }

    fn indicate(&self, indication: Indication) {
        if let Err(e) = self.upper.try_send(indication) {
            warn!(error = %e, "upper layer indication lost");
        }
    }

    /// Holds a received payload for the next dispatch
    fn defer_dispatch(&mut self, packet: Packet) {
        let src = packet.src;
        if let Some(delivery) = Delivery::from_packet(packet) {
            match self.dispatcher.defer(delivery) {
                Deferred::Queued => {}
                Deferred::Duplicate => debug!(%src, "duplicate broadcast suppressed"),
                Deferred::Full => warn!(%src, "dispatch buffer full, dropping payload"),
            }
        }
    }

    /// Hands every held payload to the upper layer
    fn dispatch(&mut self) {
        let deliveries: Vec<Delivery> = self.dispatcher.drain().collect();
        for delivery in deliveries {
            info!(src = %delivery.src, len = delivery.payload.len(), "dispatching payload");
            self.indicate(Indication::Received {
                src: delivery.src,
                payload: delivery.payload,
                broadcast: delivery.broadcast_seq.is_some(),
            });
        }
    }

    fn now(&self) -> Tick {
        self.ticker.now()
    }

    fn random_in(&mut self, low: Tick, high: Tick) -> Tick {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..=high)
    }
}
