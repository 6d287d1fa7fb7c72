//! Radio driver collaborator
//!
//! The MAC never touches a transceiver directly. It talks to a [`Radio`], which
//! sends encoded frames, hands back received buffers and exposes the few knobs the
//! rendezvous logic needs (power state, auto-ack, CSMA). Completion of asynchronous
//! operations is reported as [`RadioEvent`]s through the MAC event channel.

use bytes::Bytes;

use crate::core::{L2Addr, Result};

/// Device power / activity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    Off,
    Sleep,
    Idle,
    /// A frame is being received
    Rx,
    /// A frame is being transmitted
    Tx,
}

/// Asynchronous radio notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    RxStarted,
    /// One or more received buffers can be fetched with [`Radio::recv`]
    RxComplete,
    TxStarted,
    /// Transmission done and, for acknowledged frames, acked
    TxComplete,
    TxNoAck,
    TxBusy,
    TxMediumBusy,
}

/// Result of the last transmission as seen by the MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFeedback {
    /// Transmission in progress or no result yet
    Undefined,
    Success,
    NoAck,
    Busy,
    MediumBusy,
}

impl TxFeedback {
    /// Feedback carried by a radio event, if any
    pub fn from_event(event: RadioEvent) -> Option<Self> {
        match event {
            RadioEvent::TxStarted => Some(TxFeedback::Undefined),
            RadioEvent::TxComplete => Some(TxFeedback::Success),
            RadioEvent::TxNoAck => Some(TxFeedback::NoAck),
            RadioEvent::TxBusy => Some(TxFeedback::Busy),
            RadioEvent::TxMediumBusy => Some(TxFeedback::MediumBusy),
            RadioEvent::RxStarted | RadioEvent::RxComplete => None,
        }
    }

    /// Returns whether the channel was found occupied
    pub fn is_busy(&self) -> bool {
        matches!(self, TxFeedback::Busy | TxFeedback::MediumBusy)
    }
}

/// Radio driver collaborator
pub trait Radio {
    /// Own link address
    fn address(&self) -> L2Addr;

    /// Starts transmitting an encoded frame; the outcome arrives as a [`RadioEvent`]
    fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Fetches the next received buffer
    fn recv(&mut self) -> Option<Bytes>;

    /// Current device state, including in-progress reception or transmission
    fn state(&self) -> RadioState;

    /// Requests a power state (`Off`, `Sleep` or `Idle`)
    fn set_state(&mut self, state: RadioState);

    /// Enables or disables acknowledging received unicast frames
    fn set_auto_ack(&mut self, enabled: bool);

    /// Enables or disables channel-contention avoidance
    fn set_csma(&mut self, enabled: bool);

    /// Retry budget of channel-contention avoidance
    fn set_csma_retries(&mut self, retries: u8);
}
