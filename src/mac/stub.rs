//! Hand-driven radio and ticker for unit tests

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::core::{L2Addr, Result};
use crate::protocol::{decode_packet, encode_packet, Packet};
use crate::radio::{Radio, RadioState};
use crate::time::{AlarmTag, Tick, Ticker};

#[derive(Debug)]
pub(crate) struct StubRadio {
    pub(crate) addr: L2Addr,
    pub(crate) state: RadioState,
    pub(crate) receiving: bool,
    pub(crate) auto_ack: bool,
    pub(crate) csma: bool,
    pub(crate) sent: Vec<Packet>,
    pub(crate) inbox: VecDeque<Bytes>,
}

impl StubRadio {
    pub(crate) fn new(addr: L2Addr) -> Self {
        StubRadio {
            addr,
            state: RadioState::Off,
            receiving: false,
            auto_ack: false,
            csma: false,
            sent: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Buffers a frame as if it had been received
    pub(crate) fn inject(&mut self, packet: &Packet) {
        self.inbox.push_back(encode_packet(packet).unwrap());
    }
}

impl Radio for StubRadio {
    fn address(&self) -> L2Addr {
        self.addr
    }

    fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sent.push(decode_packet(&frame)?);
        Ok(())
    }

    fn recv(&mut self) -> Option<Bytes> {
        self.inbox.pop_front()
    }

    fn state(&self) -> RadioState {
        if self.receiving && self.state == RadioState::Idle {
            RadioState::Rx
        } else {
            self.state
        }
    }

    fn set_state(&mut self, state: RadioState) {
        self.state = state;
    }

    fn set_auto_ack(&mut self, enabled: bool) {
        self.auto_ack = enabled;
    }

    fn set_csma(&mut self, enabled: bool) {
        self.csma = enabled;
    }

    fn set_csma_retries(&mut self, _retries: u8) {}
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StubTicker {
    pub(crate) now: Rc<Cell<Tick>>,
    pub(crate) alarm: Cell<Option<(Tick, AlarmTag)>>,
}

impl Ticker for StubTicker {
    fn now(&self) -> Tick {
        self.now.get()
    }

    fn set_alarm(&mut self, at: Tick, tag: AlarmTag) {
        self.alarm.set(Some((at, tag)));
    }

    fn clear_alarm(&mut self) {
        self.alarm.set(None);
    }
}
