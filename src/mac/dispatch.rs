//! Deferred upward delivery with broadcast duplicate suppression

use std::collections::VecDeque;

use bytes::Bytes;

use crate::core::{L2Addr, BROADCAST_HISTORY_LEN};
use crate::protocol::{Frame, Packet};

/// Payload ready for the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub src: L2Addr,
    pub payload: Bytes,
    /// Sequence number when the payload came from a broadcast
    pub broadcast_seq: Option<u8>,
}

impl Delivery {
    /// Extracts the deliverable part of a received packet
    pub fn from_packet(packet: Packet) -> Option<Self> {
        let broadcast_seq = match packet.frame {
            Frame::Broadcast { seq, .. } => Some(seq),
            _ => None,
        };
        packet.frame.payload().map(|payload| Delivery {
            src: packet.src,
            payload: payload.clone(),
            broadcast_seq,
        })
    }
}

/// Result of deferring a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Queued,
    Duplicate,
    Full,
}

/// Buffer of deliveries waiting for the next dispatch
#[derive(Debug)]
pub struct DispatchBuffer {
    pending: Vec<Delivery>,
    capacity: usize,
    /// Recently accepted broadcasts as `(source, sequence)`
    recent: VecDeque<(L2Addr, u8)>,
}

impl DispatchBuffer {
    pub fn new(capacity: usize) -> Self {
        DispatchBuffer {
            pending: Vec::with_capacity(capacity),
            capacity,
            recent: VecDeque::with_capacity(BROADCAST_HISTORY_LEN),
        }
    }

    /// Holds a delivery until the next [`DispatchBuffer::drain`]
    ///
    /// A broadcast whose `(source, sequence)` was already accepted is dropped.
    pub fn defer(&mut self, delivery: Delivery) -> Deferred {
        if let Some(seq) = delivery.broadcast_seq {
            let key = (delivery.src, seq);
            if self.recent.contains(&key) {
                return Deferred::Duplicate;
            }
            if self.pending.len() >= self.capacity {
                return Deferred::Full;
            }
            if self.recent.len() == BROADCAST_HISTORY_LEN {
                self.recent.pop_front();
            }
            self.recent.push_back(key);
        } else if self.pending.len() >= self.capacity {
            return Deferred::Full;
        }
        self.pending.push(delivery);
        Deferred::Queued
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Takes every held delivery in arrival order
    pub fn drain(&mut self) -> std::vec::Drain<'_, Delivery> {
        self.pending.drain(..)
    }
}
