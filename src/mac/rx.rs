//! Reception of a rendezvous: wake request, wake ack, data

use tracing::{debug, error, info, warn};

use crate::core::L2Addr;
use crate::protocol::{Frame, Packet};
use crate::radio::{Radio, RadioState, TxFeedback};
use crate::time::{phase_offset, Ticker};

use super::timeout::TimeoutKind;
use super::{Mac, MacState};

/// State of the receive machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    Stopped,
    Init,
    WaitForWr,
    SendWa,
    WaitWaSent,
    WaitForData,
    Successful,
    Failed,
}

#[derive(Debug, Default)]
pub(crate) struct RxContext {
    pub(crate) state: RxState,
    /// Sender of the wake request being answered
    pub(crate) sender: Option<L2Addr>,
    /// Failed receptions in the current cycle
    pub(crate) bad_attempts: u8,
    /// The last data frame announced more to come
    pub(crate) more_pending: bool,
}

enum DataOutcome {
    Received(Packet),
    /// The sender repeated its wake request; our wake ack got lost
    WakeAckLost(Packet),
}

impl<R: Radio, T: Ticker> Mac<R, T> {
    pub(super) fn rx_start(&mut self) {
        self.rx.sender = None;
        self.rx.more_pending = false;
        // control frames must go out without contention backoff
        self.radio.set_csma(false);
        self.rx.state = RxState::Init;
    }

    pub(super) fn rx_stop(&mut self) {
        self.timeouts.clear(TimeoutKind::Data);
        self.timeouts.clear(TimeoutKind::Wa);
        self.rx.state = RxState::Stopped;
        self.rx.sender = None;
    }

    fn rx_update(&mut self) {
        while self.rx_step() {}
    }

    /// Runs one state; returns whether the next state should run right away
    fn rx_step(&mut self) -> bool {
        match self.rx.state {
            RxState::Init => {
                self.timeouts.clear(TimeoutKind::Data);
                self.rx.state = RxState::WaitForWr;
                true
            }
            RxState::WaitForWr => self.rx_wait_for_wr(),
            RxState::SendWa => self.rx_send_wa(),
            RxState::WaitWaSent => self.rx_wait_wa_sent(),
            RxState::WaitForData => self.rx_wait_for_data(),
            RxState::Stopped | RxState::Successful | RxState::Failed => false,
        }
    }

    fn rx_wait_for_wr(&mut self) -> bool {
        let mut found_wr = false;
        let mut found_broadcast = false;

        while let Some(packet) = self.rx_queue.pop_front() {
            match packet.frame {
                Frame::Broadcast { .. } => {
                    self.defer_dispatch(packet);
                    found_broadcast = true;
                    // one copy per cycle is enough, and the sender keeps the channel busy
                    self.flags.quit_rx = true;
                    self.flags.quit_tx = true;
                }
                Frame::WakeRequest { dst } if dst == self.addr => {
                    self.rx.sender = Some(packet.src);
                    found_wr = true;
                    break;
                }
                Frame::WakeRequest { dst } => {
                    debug!(src = %packet.src, %dst, "wake request for another node");
                    self.flags.quit_tx = true;
                }
                _ => debug!(kind = packet.frame.kind(), "not a wake request, discarding"),
            }
        }

        if found_broadcast {
            self.rx.state = RxState::Successful;
            return true;
        }

        if !found_wr {
            debug!("no wake request for us");
            self.rx.bad_attempts = self.rx.bad_attempts.saturating_add(1);
            self.rx.state = RxState::Failed;
            return true;
        }

        // anything queued behind the wake request is stale now
        self.rx_queue.clear();
        self.rx.state = RxState::SendWa;
        true
    }

    fn rx_send_wa(&mut self) -> bool {
        let sender = match self.rx.sender {
            Some(sender) => sender,
            None => {
                self.rx.state = RxState::Failed;
                return true;
            }
        };

        if self.radio.state() == RadioState::Rx {
            debug!("reception in progress, not sending wake ack");
            self.rx.bad_attempts = self.rx.bad_attempts.saturating_add(1);
            self.rx.state = RxState::Failed;
            return true;
        }

        let interval = self.timing.interval;
        let now = self.now();
        let responder_phase = phase_offset(self.scheduler.last_wakeup(), now, interval);
        let packet = Packet::new(
            self.addr,
            L2Addr::BROADCAST,
            Frame::WakeAck {
                dst: sender,
                responder_phase,
            },
        );

        self.radio.set_auto_ack(false);
        let sent = self.transmit(&packet);
        // the data frame that follows must be acked
        self.radio.set_auto_ack(true);

        if let Err(e) = sent {
            error!(error = %e, "sending wake ack failed");
            self.flags.quit_rx = true;
            self.rx.state = RxState::Failed;
            return true;
        }

        debug!(%sender, responder_phase, "wake ack sent");
        self.timeouts
            .set(TimeoutKind::Wa, self.timing.time_between_wr, now);
        self.rx.state = RxState::WaitWaSent;
        false
    }

    fn rx_wait_wa_sent(&mut self) -> bool {
        if self.tx_feedback == TxFeedback::Undefined {
            if self.timeouts.is_expired(TimeoutKind::Wa) {
                warn!("no confirmation for wake ack");
                self.rx.bad_attempts = self.rx.bad_attempts.saturating_add(1);
                self.rx.state = RxState::Failed;
                return true;
            }
            return false;
        }

        self.timeouts.clear(TimeoutKind::Wa);
        let now = self.now();
        self.timeouts
            .set(TimeoutKind::Data, self.timing.data_delay, now);
        self.set_radio_state(RadioState::Idle);
        self.rx.state = RxState::WaitForData;
        false
    }

    fn rx_wait_for_data(&mut self) -> bool {
        let mut outcome = None;

        while let Some(packet) = self.rx_queue.pop_front() {
            if let Frame::Broadcast { .. } = packet.frame {
                self.defer_dispatch(packet);
                self.flags.quit_rx = true;
                continue;
            }

            if Some(packet.src) != self.rx.sender || packet.target() != self.addr {
                debug!(src = %packet.src, kind = packet.frame.kind(), "unrelated frame while waiting for data");
                let now = self.now();
                self.timeouts
                    .set(TimeoutKind::Data, self.timing.data_delay, now);
                continue;
            }

            match packet.frame {
                Frame::WakeRequest { .. } => {
                    self.timeouts.clear(TimeoutKind::Data);
                    outcome = Some(DataOutcome::WakeAckLost(packet));
                    break;
                }
                _ if packet.frame.is_data() => {
                    self.timeouts.clear(TimeoutKind::Data);
                    outcome = Some(DataOutcome::Received(packet));
                    break;
                }
                _ => debug!(kind = packet.frame.kind(), "unexpected frame from sender"),
            }
        }

        match outcome {
            Some(DataOutcome::WakeAckLost(packet)) => {
                warn!(src = %packet.src, "wake ack probably lost, restarting reception");
                self.rx_queue.push_front(packet);
                self.rx.state = RxState::Init;
                true
            }
            Some(DataOutcome::Received(packet)) => {
                self.rx.more_pending = matches!(packet.frame, Frame::DataPending { .. });
                self.defer_dispatch(packet);
                self.rx.state = RxState::Successful;
                true
            }
            None => {
                if !self.rx_started && self.timeouts.is_expired(TimeoutKind::Data) {
                    info!("data timed out");
                    self.rx.bad_attempts = self.rx.bad_attempts.saturating_add(1);
                    self.rx.state = RxState::Failed;
                    return true;
                }
                false
            }
        }
    }

    /// Ends listening early once the window is mostly used up
    fn rx_check_window(&mut self) {
        let elapsed = self.now().wrapping_sub(self.scheduler.last_wakeup());
        if u64::from(elapsed) * 5 > u64::from(self.timing.interval) * 4 {
            debug!(elapsed, "listening window mostly used up");
            self.flags.quit_rx = true;
        }
    }

    fn rx_finish(&mut self) {
        if self.flags.quit_rx {
            self.set_state(MacState::Sleeping);
        } else {
            self.set_state(MacState::Listening);
        }
    }

    /// Receive management while in [`MacState::Receiving`]
    pub(super) fn rx_management(&mut self) {
        let state_before = self.rx.state;

        match self.rx.state {
            RxState::Stopped => {
                self.rx_start();
                self.rx_update();
            }
            RxState::Failed => {
                self.rx_stop();
                self.dispatch();
                if self.rx.bad_attempts >= self.config.max_rx_extensions {
                    debug!(attempts = self.rx.bad_attempts, "too many failed receptions");
                    self.flags.quit_rx = true;
                }
                self.rx_check_window();
                self.rx_finish();
            }
            RxState::Successful => {
                let more_pending = self.rx.more_pending;
                self.rx_stop();
                self.dispatch();
                if !more_pending {
                    self.rx_check_window();
                }
                self.rx_finish();
            }
            _ => self.rx_update(),
        }

        if self.rx.state != state_before {
            self.reschedule = true;
        }
    }
}
