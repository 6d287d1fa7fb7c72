//! Neighbour table and outbound queues

use std::collections::VecDeque;

use bytes::Bytes;

use crate::core::{Destination, L2Addr};
use crate::time::{next_in_phase, Tick};

/// Outbound payload waiting in a neighbour queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub payload: Bytes,
    /// Failed attempts so far
    pub retries: u8,
}

impl QueuedPacket {
    /// Creates a packet that has not been tried yet
    pub fn new(payload: Bytes) -> Self {
        QueuedPacket { payload, retries: 0 }
    }
}

/// Handle to a transmit target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighborRef {
    /// The broadcast queue
    Broadcast,
    /// Index into the neighbour table
    Unicast(usize),
}

/// Known neighbour
#[derive(Debug, Clone)]
pub struct Neighbor {
    addr: L2Addr,
    queue: VecDeque<QueuedPacket>,
    /// A tick at which the neighbour woke up, learned from its wake acks
    wake_anchor: Option<Tick>,
}

impl Neighbor {
    fn new(addr: L2Addr) -> Self {
        Neighbor {
            addr,
            queue: VecDeque::new(),
            wake_anchor: None,
        }
    }

    pub fn addr(&self) -> L2Addr {
        self.addr
    }

    pub fn wake_anchor(&self) -> Option<Tick> {
        self.wake_anchor
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Why a packet could not be queued
#[derive(Debug)]
pub enum EnqueueError {
    /// The target queue is at capacity
    QueueFull(QueuedPacket),
    /// No room for another neighbour entry
    TableFull(QueuedPacket),
}

impl EnqueueError {
    /// Gives back the rejected packet
    pub fn into_packet(self) -> QueuedPacket {
        match self {
            EnqueueError::QueueFull(packet) | EnqueueError::TableFull(packet) => packet,
        }
    }
}

/// Neighbour entries plus the broadcast queue
#[derive(Debug)]
pub struct NeighborTable {
    broadcast: VecDeque<QueuedPacket>,
    entries: Vec<Neighbor>,
    rr_next: usize,
    queue_capacity: usize,
    max_neighbors: usize,
}

impl NeighborTable {
    pub fn new(queue_capacity: usize, max_neighbors: usize) -> Self {
        NeighborTable {
            broadcast: VecDeque::new(),
            entries: Vec::new(),
            rr_next: 0,
            queue_capacity,
            max_neighbors,
        }
    }

    /// Index of the entry for `addr`
    pub fn find(&self, addr: L2Addr) -> Option<usize> {
        self.entries.iter().position(|n| n.addr == addr)
    }

    pub fn get(&self, index: usize) -> Option<&Neighbor> {
        self.entries.get(index)
    }

    /// Destination a target stands for
    pub fn destination(&self, target: NeighborRef) -> Option<Destination> {
        match target {
            NeighborRef::Broadcast => Some(Destination::Broadcast),
            NeighborRef::Unicast(i) => self.entries.get(i).map(|n| Destination::Unicast(n.addr)),
        }
    }

    /// Link address a target stands for
    pub fn addr_of(&self, target: NeighborRef) -> Option<L2Addr> {
        self.destination(target).map(|d| d.link_addr())
    }

    /// Known wake anchor of a target; broadcasts never have one
    pub fn wake_anchor(&self, target: NeighborRef) -> Option<Tick> {
        match target {
            NeighborRef::Broadcast => None,
            NeighborRef::Unicast(i) => self.entries.get(i).and_then(|n| n.wake_anchor),
        }
    }

    /// Stores a freshly learned wake anchor
    pub fn set_wake_anchor(&mut self, index: usize, anchor: Tick) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.wake_anchor = Some(anchor);
        }
    }

    /// Moves every anchor to the neighbour's next wake-up at or after `now`
    ///
    /// Anchors must stay within half the counter range of the current time for
    /// the phase arithmetic to hold, so this runs once per own wake-up.
    pub fn rebase_anchors(&mut self, now: Tick, interval: Tick) {
        for entry in &mut self.entries {
            if let Some(anchor) = entry.wake_anchor {
                entry.wake_anchor = Some(next_in_phase(now, anchor, interval, 0));
            }
        }
    }

    /// Appends a packet, creating the neighbour entry on first use
    pub fn enqueue(
        &mut self,
        dst: Destination,
        packet: QueuedPacket,
    ) -> Result<NeighborRef, EnqueueError> {
        let target = match dst {
            Destination::Broadcast => NeighborRef::Broadcast,
            Destination::Unicast(addr) => match self.find(addr) {
                Some(i) => NeighborRef::Unicast(i),
                None if self.entries.len() < self.max_neighbors => {
                    self.entries.push(Neighbor::new(addr));
                    NeighborRef::Unicast(self.entries.len() - 1)
                }
                None => return Err(EnqueueError::TableFull(packet)),
            },
        };
        let capacity = self.queue_capacity;
        match self.queue_mut(target) {
            Some(queue) if queue.len() < capacity => {
                queue.push_back(packet);
                Ok(target)
            }
            _ => Err(EnqueueError::QueueFull(packet)),
        }
    }

    /// Puts a packet back at the head of its queue
    pub fn requeue_front(
        &mut self,
        target: NeighborRef,
        packet: QueuedPacket,
    ) -> Result<(), EnqueueError> {
        let capacity = self.queue_capacity;
        match self.queue_mut(target) {
            Some(queue) if queue.len() < capacity => {
                queue.push_front(packet);
                Ok(())
            }
            _ => Err(EnqueueError::QueueFull(packet)),
        }
    }

    /// Takes the next packet for a target
    pub fn pop(&mut self, target: NeighborRef) -> Option<QueuedPacket> {
        self.queue_mut(target).and_then(|q| q.pop_front())
    }

    pub fn queue_len(&self, target: NeighborRef) -> usize {
        match target {
            NeighborRef::Broadcast => self.broadcast.len(),
            NeighborRef::Unicast(i) => self.entries.get(i).map_or(0, |n| n.queue.len()),
        }
    }

    pub fn has_broadcast(&self) -> bool {
        !self.broadcast.is_empty()
    }

    /// Returns whether anything at all waits for transmission
    pub fn has_pending(&self) -> bool {
        self.has_broadcast() || self.entries.iter().any(|n| !n.queue.is_empty())
    }

    /// Next neighbour with queued packets, rotating fairly between neighbours
    pub fn next_round_robin(&mut self) -> Option<NeighborRef> {
        let count = self.entries.len();
        for step in 0..count {
            let index = (self.rr_next + step) % count;
            if !self.entries[index].queue.is_empty() {
                self.rr_next = (index + 1) % count;
                return Some(NeighborRef::Unicast(index));
            }
        }
        None
    }

    fn queue_mut(&mut self, target: NeighborRef) -> Option<&mut VecDeque<QueuedPacket>> {
        match target {
            NeighborRef::Broadcast => Some(&mut self.broadcast),
            NeighborRef::Unicast(i) => self.entries.get_mut(i).map(|n| &mut n.queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: &'static [u8]) -> QueuedPacket {
        QueuedPacket::new(Bytes::from_static(tag))
    }

    #[test]
    fn test_enqueue_creates_entry_lazily() {
        let mut table = NeighborTable::new(4, 4);
        let addr = L2Addr::from_short(5);
        assert!(table.find(addr).is_none());

        let target = table.enqueue(Destination::Unicast(addr), packet(b"a")).unwrap();
        assert_eq!(target, NeighborRef::Unicast(0));
        assert_eq!(table.find(addr), Some(0));
        assert_eq!(table.queue_len(target), 1);
        assert!(table.wake_anchor(target).is_none());

        // the entry outlives its queue
        assert_eq!(table.pop(target), Some(packet(b"a")));
        assert!(!table.has_pending());
        assert_eq!(table.find(addr), Some(0));
    }

    #[test]
    fn test_queue_and_table_limits() {
        let mut table = NeighborTable::new(1, 1);
        let a = Destination::Unicast(L2Addr::from_short(1));
        let b = Destination::Unicast(L2Addr::from_short(2));

        table.enqueue(a, packet(b"1")).unwrap();
        match table.enqueue(a, packet(b"2")) {
            Err(EnqueueError::QueueFull(p)) => assert_eq!(p, packet(b"2")),
            other => panic!("Expected full queue, got {:?}", other),
        }
        match table.enqueue(b, packet(b"3")) {
            Err(EnqueueError::TableFull(p)) => assert_eq!(p, packet(b"3")),
            other => panic!("Expected full table, got {:?}", other),
        }
        // the broadcast queue does not need an entry
        assert_eq!(table.enqueue(Destination::Broadcast, packet(b"4")).unwrap(), NeighborRef::Broadcast);
        assert!(table.has_broadcast());
    }

    #[test]
    fn test_requeue_keeps_order_and_retries() {
        let mut table = NeighborTable::new(4, 4);
        let dst = Destination::Unicast(L2Addr::from_short(1));
        let target = table.enqueue(dst, packet(b"1")).unwrap();
        table.enqueue(dst, packet(b"2")).unwrap();

        let mut first = table.pop(target).unwrap();
        first.retries = 2;
        table.requeue_front(target, first.clone()).unwrap();
        assert_eq!(table.pop(target), Some(first));
        assert_eq!(table.pop(target), Some(packet(b"2")));
    }

    #[test]
    fn test_round_robin_is_fair() {
        let mut table = NeighborTable::new(4, 4);
        let addrs: Vec<_> = (1..=3).map(L2Addr::from_short).collect();
        for addr in &addrs {
            table.enqueue(Destination::Unicast(*addr), packet(b"x")).unwrap();
            table.enqueue(Destination::Unicast(*addr), packet(b"y")).unwrap();
        }

        let picks: Vec<_> = (0..6).map(|_| table.next_round_robin().unwrap()).collect();
        assert_eq!(
            picks,
            vec![
                NeighborRef::Unicast(0),
                NeighborRef::Unicast(1),
                NeighborRef::Unicast(2),
                NeighborRef::Unicast(0),
                NeighborRef::Unicast(1),
                NeighborRef::Unicast(2),
            ]
        );

        // empty queues are skipped
        table.pop(NeighborRef::Unicast(1));
        table.pop(NeighborRef::Unicast(1));
        assert_eq!(table.next_round_robin(), Some(NeighborRef::Unicast(0)));
        assert_eq!(table.next_round_robin(), Some(NeighborRef::Unicast(2)));
        assert_eq!(table.next_round_robin(), Some(NeighborRef::Unicast(0)));
    }

    #[test]
    fn test_wake_anchor_update() {
        let mut table = NeighborTable::new(4, 4);
        let addr = L2Addr::from_short(9);
        let target = table.enqueue(Destination::Unicast(addr), packet(b"x")).unwrap();
        table.set_wake_anchor(0, 1_234);
        assert_eq!(table.wake_anchor(target), Some(1_234));
        assert_eq!(table.get(0).and_then(|n| n.wake_anchor()), Some(1_234));
        assert_eq!(table.addr_of(target), Some(addr));
        assert_eq!(table.addr_of(NeighborRef::Broadcast), Some(L2Addr::BROADCAST));
    }

    #[test]
    fn test_rebase_keeps_phase_across_wraparound() {
        let mut table = NeighborTable::new(4, 4);
        let interval = 100_000;
        for id in [3, 4] {
            table.enqueue(Destination::Unicast(L2Addr::from_short(id)), packet(b"x")).unwrap();
        }
        table.set_wake_anchor(0, u32::MAX - 1_000);

        // a few intervals later, past the wrap
        table.rebase_anchors(250_000, interval);
        assert_eq!(table.wake_anchor(NeighborRef::Unicast(0)), Some(298_999));
        // unknown neighbours stay unknown
        assert_eq!(table.wake_anchor(NeighborRef::Unicast(1)), None);

        table.rebase_anchors(298_999, interval);
        assert_eq!(table.wake_anchor(NeighborRef::Unicast(0)), Some(298_999));
    }
}
