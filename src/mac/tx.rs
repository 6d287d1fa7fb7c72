//! Transmission of a rendezvous
//!
//! Unicast: wake requests are repeated every WR spacing until the destination
//! answers with a wake ack, which also tells us its wake-up phase; the data frame
//! follows immediately. Broadcast: the frame is repeated for a little longer than
//! one wake interval so every neighbour hears at least one copy.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::core::L2Addr;
use crate::protocol::{encode_packet, Frame, Packet};
use crate::radio::{Radio, RadioState, TxFeedback};
use crate::time::{phase_distance, Tick, Ticker};

use super::neighbor::{NeighborRef, QueuedPacket};
use super::timeout::TimeoutKind;
use super::{Indication, Mac, MacState};

/// State of the transmit machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Stopped,
    Init,
    SendBroadcast,
    SendWr,
    WaitWrSent,
    WaitForWa,
    SendData,
    WaitFeedback,
    Successful,
    Failed,
}

#[derive(Debug)]
pub(crate) struct TxContext {
    pub(crate) state: TxState,
    /// Packet being (re)transmitted; `None` once handed to the radio
    pub(crate) packet: Option<QueuedPacket>,
    /// Data frame on air, waiting for its acknowledgement
    pub(crate) in_flight: Option<QueuedPacket>,
    pub(crate) current: Option<NeighborRef>,
    pub(crate) wr_sent: u32,
    pub(crate) wr_sent_at: Tick,
    pub(crate) burst_count: u32,
    /// The destination was reached and more packets follow in this cycle
    pub(crate) tx_continue: bool,
    pub(crate) broadcast_seq: u8,
    /// Encoded broadcast repeated until the broadcast ends
    pub(crate) broadcast_frame: Option<Bytes>,
}

impl TxContext {
    pub(crate) fn new(initial_seq: u8) -> Self {
        TxContext {
            state: TxState::Stopped,
            packet: None,
            in_flight: None,
            current: None,
            wr_sent: 0,
            wr_sent_at: 0,
            burst_count: 0,
            tx_continue: false,
            broadcast_seq: initial_seq,
            broadcast_frame: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    Done,
    Failed,
}

impl<R: Radio, T: Ticker> Mac<R, T> {
    fn tx_start(&mut self, packet: QueuedPacket, target: NeighborRef) {
        if let Some(stale) = self.tx.packet.take() {
            warn!(?target, "replacing unsent packet");
            self.fail_packet(self.tx.current, stale);
        }
        self.tx.packet = Some(packet);
        self.tx.current = Some(target);
        self.tx.wr_sent = 0;
        self.tx.state = TxState::Init;
    }

    /// Ends the transaction; a failed packet stays held for a retry unless its
    /// budget is spent
    fn tx_stop(&mut self) {
        self.timeouts.clear(TimeoutKind::Wr);
        self.timeouts.clear(TimeoutKind::NoResponse);
        self.timeouts.clear(TimeoutKind::NextBroadcast);
        self.timeouts.clear(TimeoutKind::BroadcastEnd);
        self.tx.state = TxState::Stopped;
        self.tx.broadcast_frame = None;

        if let Some(mut packet) = self.tx.packet.take() {
            if packet.retries >= self.config.max_data_retries {
                warn!(retries = packet.retries, "retry budget spent, dropping packet");
                self.fail_packet(self.tx.current, packet);
            } else {
                packet.retries += 1;
                debug!(retries = packet.retries, "packet kept for retransmission");
                self.tx.packet = Some(packet);
                return;
            }
        }

        if !self.tx.tx_continue {
            self.tx.current = None;
        }
    }

    /// Abandons the transaction, putting its packet back in the queue
    pub(super) fn tx_abort(&mut self) {
        if self.tx.packet.is_none() {
            self.tx.packet = self.tx.in_flight.take();
        }
        self.requeue_held_packet();
        self.tx.in_flight = None;
        self.tx.state = TxState::Stopped;
        self.tx.broadcast_frame = None;
        self.tx.tx_continue = false;
        self.tx.current = None;
    }

    /// Puts the held packet back at the head of its neighbour queue
    pub(super) fn requeue_held_packet(&mut self) {
        let target = match self.tx.current {
            Some(target) => target,
            None => return,
        };
        let packet = match self.tx.packet.take() {
            Some(packet) => packet,
            None => return,
        };
        if let Err(err) = self.neighbors.requeue_front(target, packet) {
            warn!(?target, "queue full, cannot requeue packet");
            self.fail_packet(Some(target), err.into_packet());
        }
    }

    fn fail_packet(&self, target: Option<NeighborRef>, packet: QueuedPacket) {
        if let Some(dst) = target.and_then(|t| self.neighbors.destination(t)) {
            self.indicate(Indication::SendFailed {
                dst,
                payload: packet.payload,
            });
        }
    }

    fn tx_update(&mut self) {
        while self.tx_step() {}
    }

    fn tx_step(&mut self) -> bool {
        match self.tx.state {
            TxState::Init => self.tx_init(),
            TxState::SendBroadcast => match self.tx_send_broadcast() {
                Progress::Pending => false,
                Progress::Done => {
                    self.tx.state = TxState::Successful;
                    true
                }
                Progress::Failed => {
                    self.tx.state = TxState::Failed;
                    true
                }
            },
            TxState::SendWr => {
                if self.timeouts.is_expired(TimeoutKind::NoResponse) {
                    warn!("no response from destination");
                    self.tx.state = TxState::Failed;
                    return true;
                }
                if self.tx_send_wr() {
                    self.tx.state = TxState::WaitWrSent;
                    false
                } else {
                    self.tx.state = TxState::Failed;
                    true
                }
            }
            TxState::WaitWrSent => self.tx_wait_wr_sent(),
            TxState::WaitForWa => self.tx_wait_for_wa(),
            TxState::SendData => {
                if self.tx_send_data() {
                    self.tx.state = TxState::WaitFeedback;
                    false
                } else {
                    self.tx.state = TxState::Failed;
                    true
                }
            }
            TxState::WaitFeedback => self.tx_wait_feedback(),
            TxState::Stopped | TxState::Successful | TxState::Failed => false,
        }
    }

    fn tx_init(&mut self) -> bool {
        self.timeouts.clear(TimeoutKind::Wr);
        self.timeouts.clear(TimeoutKind::NoResponse);
        self.timeouts.clear(TimeoutKind::NextBroadcast);
        self.timeouts.clear(TimeoutKind::BroadcastEnd);

        if self.radio.state() == RadioState::Rx {
            debug!("reception in progress, postponing transmission");
            self.requeue_held_packet();
            self.tx.state = TxState::Failed;
            return true;
        }

        if self.tx.current == Some(NeighborRef::Broadcast) {
            self.radio
                .set_csma_retries(self.config.broadcast_csma_retries);
            self.radio.set_csma(true);
            self.tx.state = TxState::SendBroadcast;
        } else {
            // the first wake request probes the channel
            self.radio.set_csma(true);
            let now = self.now();
            self.timeouts
                .set(TimeoutKind::NoResponse, self.timing.preamble_duration, now);
            self.tx.state = TxState::SendWr;
        }
        true
    }

    fn tx_send_broadcast(&mut self) -> Progress {
        let now = self.now();
        let mut first = false;

        if self.timeouts.is_running(TimeoutKind::BroadcastEnd) {
            if self.timeouts.is_expired(TimeoutKind::BroadcastEnd) {
                self.timeouts.clear(TimeoutKind::NextBroadcast);
                self.tx.packet = None;
                self.tx.broadcast_frame = None;
                info!("broadcast done");
                return Progress::Done;
            }
        } else {
            let payload = match &self.tx.packet {
                Some(packet) => packet.payload.clone(),
                None => return Progress::Failed,
            };
            let seq = self.tx.broadcast_seq;
            self.tx.broadcast_seq = seq.wrapping_add(1);

            let frame = Frame::Broadcast { seq, payload };
            let packet = Packet::new(self.addr, L2Addr::BROADCAST, frame);
            match encode_packet(&packet) {
                Ok(raw) => self.tx.broadcast_frame = Some(raw),
                Err(e) => {
                    error!(error = %e, "cannot encode broadcast, dropping it");
                    if let Some(packet) = self.tx.packet.take() {
                        self.fail_packet(self.tx.current, packet);
                    }
                    return Progress::Failed;
                }
            }

            info!(seq, "starting broadcast");
            self.timeouts
                .set(TimeoutKind::BroadcastEnd, self.timing.broadcast_duration, now);
            self.radio.set_auto_ack(false);
            first = true;
        }

        if first || self.timeouts.is_expired(TimeoutKind::NextBroadcast) {
            let radio_state = self.radio.state();
            if first && radio_state == RadioState::Rx {
                debug!("reception in progress, postponing broadcast");
                self.timeouts.clear(TimeoutKind::BroadcastEnd);
                self.tx.broadcast_seq = self.tx.broadcast_seq.wrapping_sub(1);
                self.requeue_held_packet();
                self.tx.broadcast_frame = None;
                return Progress::Failed;
            }

            if radio_state != RadioState::Idle {
                // skip this copy, the channel or the transceiver is busy
                self.timeouts
                    .set(TimeoutKind::NextBroadcast, self.timing.time_between_broadcast, now);
                return Progress::Pending;
            }

            let raw = match &self.tx.broadcast_frame {
                Some(raw) => raw.clone(),
                None => return Progress::Failed,
            };
            self.tx_feedback = TxFeedback::Undefined;
            if let Err(e) = self.radio.send(raw) {
                error!(error = %e, "sending broadcast failed");
                return Progress::Failed;
            }
            self.timeouts
                .set(TimeoutKind::NextBroadcast, self.timing.time_between_broadcast, now);
            debug!("broadcast copy sent");
        }

        Progress::Pending
    }

    fn tx_send_wr(&mut self) -> bool {
        if self.radio.state() == RadioState::Rx {
            debug!("reception in progress, postponing wake request");
            self.requeue_held_packet();
            return false;
        }

        let dst = match self.tx.current.and_then(|t| self.neighbors.addr_of(t)) {
            Some(dst) => dst,
            None => return false,
        };

        let packet = Packet::new(self.addr, L2Addr::BROADCAST, Frame::WakeRequest { dst });
        self.radio.set_auto_ack(false);
        if let Err(e) = self.transmit(&packet) {
            error!(error = %e, "sending wake request failed");
            return false;
        }

        self.tx.wr_sent_at = self.now();
        // replies to earlier wake requests are meaningless now
        self.rx_queue.clear();
        true
    }

    fn tx_wait_wr_sent(&mut self) -> bool {
        if self.timeouts.is_expired(TimeoutKind::NoResponse) {
            warn!("no response from destination");
            self.tx.state = TxState::Failed;
            return true;
        }

        match self.tx_feedback {
            TxFeedback::Undefined => return false,
            feedback if feedback.is_busy() => {
                debug!(?feedback, "channel busy, postponing");
                self.requeue_held_packet();
                self.tx.state = TxState::Failed;
                return true;
            }
            _ => {}
        }

        if self.tx.wr_sent == 0 {
            // the channel is known to be clear for the rest of the hunt
            self.radio.set_csma(false);
        }
        self.tx.wr_sent += 1;

        let now = self.now();
        self.timeouts
            .set(TimeoutKind::Wr, self.timing.time_between_wr, now);
        self.set_radio_state(RadioState::Idle);
        self.tx.state = TxState::WaitForWa;
        false
    }

    fn tx_wait_for_wa(&mut self) -> bool {
        if self.timeouts.is_expired(TimeoutKind::NoResponse) {
            warn!(wr_sent = self.tx.wr_sent, "no response from destination");
            self.tx.state = TxState::Failed;
            return true;
        }

        if self.timeouts.is_expired(TimeoutKind::Wr) {
            if self.tx.tx_continue {
                info!("burst ended, destination stopped answering");
                self.requeue_held_packet();
                self.tx.state = TxState::Failed;
            } else {
                self.tx.state = TxState::SendWr;
            }
            return true;
        }

        if self.radio.state() == RadioState::Rx {
            return false;
        }

        match self.tx_process_wake_acks() {
            Progress::Pending => false,
            Progress::Done => {
                self.tx.state = TxState::SendData;
                true
            }
            Progress::Failed => {
                self.tx.state = TxState::Failed;
                true
            }
        }
    }

    fn tx_process_wake_acks(&mut self) -> Progress {
        let (index, expected) = match self.tx.current {
            Some(NeighborRef::Unicast(i)) => match self.neighbors.get(i) {
                Some(neighbor) => (i, neighbor.addr()),
                None => return Progress::Failed,
            },
            _ => return Progress::Failed,
        };

        while let Some(packet) = self.rx_queue.pop_front() {
            let from_expected = packet.src == expected;

            if let Frame::Broadcast { .. } = packet.frame {
                self.defer_dispatch(packet);
                self.dispatch();
                continue;
            }

            if from_expected && packet.target() != self.addr {
                warn!(%expected, "destination is talking to another node, postponing");
                self.requeue_held_packet();
                return Progress::Failed;
            }

            let responder_phase = match packet.frame {
                Frame::WakeRequest { .. } => {
                    warn!(src = %packet.src, "competing wake request, postponing");
                    self.requeue_held_packet();
                    return Progress::Failed;
                }
                Frame::WakeAck { responder_phase, .. } => responder_phase,
                _ => {
                    debug!(kind = packet.frame.kind(), "not a wake ack, discarding");
                    continue;
                }
            };

            if !from_expected {
                debug!(src = %packet.src, "wake ack from unexpected node");
                break;
            }

            self.learn_phase(index, responder_phase);
            self.timeouts.clear(TimeoutKind::Wr);
            // bounds the wait for the data frame's feedback
            let now = self.now();
            self.timeouts
                .set(TimeoutKind::NoResponse, self.timing.preamble_duration, now);
            self.rx_queue.clear();
            return Progress::Done;
        }

        Progress::Pending
    }

    /// Derives the destination's wake-up schedule from its wake ack
    ///
    /// The ack reports how long ago the destination woke up, so the wake-up
    /// itself lies that many ticks before now.
    fn learn_phase(&mut self, index: usize, responder_phase: Tick) {
        let interval = self.timing.interval;
        let now = self.now();
        let elapsed = now.wrapping_sub(self.tx.wr_sent_at);
        let anchor = now.wrapping_sub(responder_phase % interval);
        self.neighbors.set_wake_anchor(index, anchor);

        let distance = phase_distance(self.scheduler.last_wakeup(), anchor, interval);
        info!(anchor, responder_phase, elapsed, wr_sent = self.tx.wr_sent, "destination answered");

        if distance < self.timing.phase_guard() {
            warn!(anchor, distance, "phase too close to destination");
            self.flags.phase_backoff = true;
        }
    }

    fn tx_send_data(&mut self) -> bool {
        if self.radio.state() == RadioState::Rx {
            debug!("reception in progress, postponing data");
            self.requeue_held_packet();
            return false;
        }

        self.radio.set_auto_ack(true);
        self.radio.set_csma_retries(self.config.data_csma_retries);
        self.radio.set_csma(true);

        let (target, dst) = match self.tx.current {
            Some(target @ NeighborRef::Unicast(_)) => match self.neighbors.addr_of(target) {
                Some(dst) => (target, dst),
                None => return false,
            },
            _ => return false,
        };
        let payload = match &self.tx.packet {
            Some(packet) => packet.payload.clone(),
            None => return false,
        };

        // a pending frame that reaches the cap keeps the target for the next cycle
        let frame = if self.neighbors.queue_len(target) > 0
            && self.tx.burst_count < self.config.max_burst
        {
            self.tx.tx_continue = true;
            self.tx.burst_count += 1;
            Frame::DataPending { payload }
        } else {
            self.tx.tx_continue = false;
            Frame::Data { payload }
        };

        let packet = Packet::new(self.addr, dst, frame);
        if let Err(e) = self.transmit(&packet) {
            error!(error = %e, "sending data failed, dropping packet");
            if let Some(held) = self.tx.packet.take() {
                self.fail_packet(Some(target), held);
            }
            return false;
        }

        debug!(%dst, kind = packet.frame.kind(), burst = self.tx.burst_count, "data sent");
        self.tx.in_flight = self.tx.packet.take();
        true
    }

    fn tx_wait_feedback(&mut self) -> bool {
        if self.timeouts.is_expired(TimeoutKind::NoResponse) {
            warn!("no transmission feedback for data");
            self.drop_in_flight();
            self.tx.state = TxState::Failed;
            return true;
        }

        match self.tx_feedback {
            TxFeedback::Undefined => false,
            TxFeedback::Success => {
                self.tx.in_flight = None;
                self.tx.state = TxState::Successful;
                true
            }
            feedback => {
                error!(?feedback, "data not delivered");
                self.drop_in_flight();
                self.tx.state = TxState::Failed;
                true
            }
        }
    }

    fn drop_in_flight(&mut self) {
        if let Some(packet) = self.tx.in_flight.take() {
            self.fail_packet(self.tx.current, packet);
        }
    }

    fn tx_management_stopped(&mut self) {
        if self.tx.packet.is_some() {
            info!(
                retries = self.tx.packet.as_ref().map_or(0, |p| p.retries),
                "retransmitting packet"
            );
            self.tx.state = TxState::Init;
            self.tx.wr_sent = 0;
            self.tx_update();
            return;
        }

        let next = self
            .tx
            .current
            .and_then(|target| self.neighbors.pop(target).map(|packet| (target, packet)));
        match next {
            Some((target, packet)) => {
                self.tx_start(packet, target);
                self.tx_update();
            }
            None => self.set_state(MacState::Sleeping),
        }
    }

    fn tx_management_success(&mut self) {
        if self.tx.current == Some(NeighborRef::Broadcast) {
            debug!("broadcast transaction finished");
        }
        self.tx_stop();

        if self.tx.tx_continue && self.tx.burst_count < self.config.max_burst {
            // stay in TRANSMITTING, the next packet of the burst follows
            self.reschedule = true;
        } else {
            self.set_state(MacState::Sleeping);
        }
    }

    /// Transmit management while in [`MacState::Transmitting`]
    pub(super) fn tx_management(&mut self) {
        let state_before = self.tx.state;

        match self.tx.state {
            TxState::Stopped => self.tx_management_stopped(),
            TxState::Failed => {
                // no more transmissions this cycle
                self.tx.tx_continue = false;
                self.flags.quit_tx = true;
                self.tx_management_success();
            }
            TxState::Successful => self.tx_management_success(),
            _ => self.tx_update(),
        }

        if self.tx.state != state_before {
            self.reschedule = true;
        }
    }
}
