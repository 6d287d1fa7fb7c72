use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::L2Addr;
use crate::time::Tick;

/// MAC frame body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Preamble repeated while hunting for a sleeping destination
    WakeRequest {
        /// Node being woken
        dst: L2Addr,
    },

    /// Reply to a wake request
    WakeAck {
        /// Node that sent the wake request
        dst: L2Addr,
        /// Ticks elapsed since the responder's own last wake-up
        responder_phase: Tick,
    },

    /// Last data frame of a rendezvous
    Data {
        payload: Bytes,
    },

    /// Data frame announcing that the sender has more frames queued
    DataPending {
        payload: Bytes,
    },

    /// Repeated broadcast copy
    Broadcast {
        /// Sequence number shared by all copies of one broadcast
        seq: u8,
        payload: Bytes,
    },
}

impl Frame {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::WakeRequest { .. } => "WR",
            Frame::WakeAck { .. } => "WA",
            Frame::Data { .. } => "DATA",
            Frame::DataPending { .. } => "DATA_PENDING",
            Frame::Broadcast { .. } => "BROADCAST",
        }
    }

    /// Upper-layer payload carried by this frame
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Data { payload }
            | Frame::DataPending { payload }
            | Frame::Broadcast { payload, .. } => Some(payload),
            Frame::WakeRequest { .. } | Frame::WakeAck { .. } => None,
        }
    }

    /// Returns whether this is a unicast data frame
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Data { .. } | Frame::DataPending { .. })
    }
}

/// A frame together with its link header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Link source address
    pub src: L2Addr,
    /// Link destination address, broadcast for control frames
    pub dst: L2Addr,
    /// Frame body
    pub frame: Frame,
}

impl Packet {
    /// Creates a new packet
    pub fn new(src: L2Addr, dst: L2Addr, frame: Frame) -> Self {
        Packet { src, dst, frame }
    }

    /// Node the frame is meant for
    ///
    /// Wake requests and wake acks travel as link broadcasts and name their
    /// target in the body; every other frame uses the link destination.
    pub fn target(&self) -> L2Addr {
        match &self.frame {
            Frame::WakeRequest { dst } | Frame::WakeAck { dst, .. } => *dst,
            _ => self.dst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_target() {
        let a = L2Addr::from_short(1);
        let b = L2Addr::from_short(2);

        let wr = Packet::new(a, L2Addr::BROADCAST, Frame::WakeRequest { dst: b });
        assert_eq!(wr.target(), b);

        let data = Packet::new(a, b, Frame::Data { payload: Bytes::from_static(b"x") });
        assert_eq!(data.target(), b);
        assert!(data.frame.is_data());
        assert_eq!(data.frame.payload().map(|p| p.as_ref()), Some(&b"x"[..]));
    }

    #[test]
    fn test_frame_kind() {
        let frame = Frame::Broadcast {
            seq: 4,
            payload: Bytes::new(),
        };
        assert_eq!(frame.kind(), "BROADCAST");
        assert!(!frame.is_data());
        assert!(Frame::WakeRequest { dst: L2Addr::BROADCAST }.payload().is_none());
    }
}
