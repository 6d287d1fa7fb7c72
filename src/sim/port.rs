//! Simulated radio and ticker
//!
//! Both hold shared handles into the [`SimNetwork`](super::SimNetwork), which owns
//! the virtual clock and the medium. The MAC only sees the [`Radio`] and
//! [`Ticker`] traits.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::core::{Error, L2Addr, Result};
use crate::radio::{Radio, RadioState};
use crate::time::{AlarmTag, Tick, Ticker};

/// Transceiver state shared between a [`SimRadio`] and the medium
#[derive(Debug)]
pub(crate) struct Port {
    pub(crate) addr: L2Addr,
    /// Power state requested by the MAC
    pub(crate) requested: RadioState,
    pub(crate) auto_ack: bool,
    pub(crate) csma: bool,
    pub(crate) csma_retries: u8,
    /// Frames handed over by the MAC, picked up by the medium
    pub(crate) outbox: Vec<Bytes>,
    pub(crate) inbox: VecDeque<Bytes>,
    /// Frame on air from this port
    pub(crate) transmitting: Option<u64>,
    /// Waiting for a clear channel
    pub(crate) backing_off: bool,
    /// Frames being received
    pub(crate) receiving: Vec<u64>,
    /// Received frames damaged by an overlap
    pub(crate) corrupted: Vec<u64>,
}

impl Port {
    pub(crate) fn new(addr: L2Addr) -> Self {
        Port {
            addr,
            requested: RadioState::Off,
            auto_ack: true,
            csma: false,
            csma_retries: 0,
            outbox: Vec::new(),
            inbox: VecDeque::new(),
            transmitting: None,
            backing_off: false,
            receiving: Vec::new(),
            corrupted: Vec::new(),
        }
    }

    pub(crate) fn is_sending(&self) -> bool {
        self.transmitting.is_some() || self.backing_off || !self.outbox.is_empty()
    }

    /// Powered, not sending, so able to pick up a frame
    pub(crate) fn is_listening(&self) -> bool {
        self.requested == RadioState::Idle && !self.is_sending()
    }

    pub(crate) fn state(&self) -> RadioState {
        if self.is_sending() {
            RadioState::Tx
        } else if self.requested == RadioState::Idle && !self.receiving.is_empty() {
            RadioState::Rx
        } else {
            self.requested
        }
    }

    pub(crate) fn drop_receptions(&mut self) {
        self.receiving.clear();
        self.corrupted.clear();
    }
}

/// [`Radio`] attached to the simulated medium
#[derive(Debug, Clone)]
pub struct SimRadio {
    pub(crate) port: Rc<RefCell<Port>>,
}

impl Radio for SimRadio {
    fn address(&self) -> L2Addr {
        self.port.borrow().addr
    }

    fn send(&mut self, frame: Bytes) -> Result<()> {
        let mut port = self.port.borrow_mut();
        if port.is_sending() {
            return Err(Error::radio("transmission already in progress"));
        }
        port.drop_receptions();
        port.outbox.push(frame);
        Ok(())
    }

    fn recv(&mut self) -> Option<Bytes> {
        self.port.borrow_mut().inbox.pop_front()
    }

    fn state(&self) -> RadioState {
        self.port.borrow().state()
    }

    fn set_state(&mut self, state: RadioState) {
        let mut port = self.port.borrow_mut();
        port.requested = state;
        if matches!(state, RadioState::Sleep | RadioState::Off) {
            port.drop_receptions();
        }
    }

    fn set_auto_ack(&mut self, enabled: bool) {
        self.port.borrow_mut().auto_ack = enabled;
    }

    fn set_csma(&mut self, enabled: bool) {
        self.port.borrow_mut().csma = enabled;
    }

    fn set_csma_retries(&mut self, retries: u8) {
        self.port.borrow_mut().csma_retries = retries;
    }
}

/// [`Ticker`] reading the virtual clock, one tick per microsecond
#[derive(Debug, Clone)]
pub struct SimTicker {
    pub(crate) clock: Rc<Cell<u64>>,
    pub(crate) alarm: Rc<Cell<Option<(Tick, AlarmTag)>>>,
}

impl Ticker for SimTicker {
    fn now(&self) -> Tick {
        // the hardware counter wraps
        self.clock.get() as Tick
    }

    fn set_alarm(&mut self, at: Tick, tag: AlarmTag) {
        self.alarm.set(Some((at, tag)));
    }

    fn clear_alarm(&mut self) {
        self.alarm.set(None);
    }
}
