//! Deterministic discrete-event simulation of several MACs on one channel
//!
//! Every node is in range of every other node. Virtual time advances in
//! microseconds and the ticker of every node runs at [`SIM_TICK_HZ`], so one tick
//! is one microsecond. The medium models:
//!
//! - airtime of 250 kbit/s O-QPSK (fixed header plus 32 µs per byte)
//! - link-address filtering: unicast frames only reach their destination
//! - overlapping receptions corrupt each other
//! - clear-channel assessment with random backoff when CSMA is enabled
//! - acknowledgements for unicast frames received with auto-ack enabled
//!
//! Runs are reproducible: the medium and every MAC draw from seeded generators.

mod port;

pub use self::port::{SimRadio, SimTicker};

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::{Destination, Error, L2Addr, MacConfig, NetState, Result};
use crate::mac::{Indication, Mac, MacEvent};
use crate::protocol::{decode_packet, Packet};
use crate::radio::RadioEvent;
use crate::time::{remaining, AlarmTag, Tick};

use self::port::Port;

/// Ticker frequency of simulated nodes
pub const SIM_TICK_HZ: u32 = 1_000_000;

/// Synchronisation header and PHY header airtime
const PHY_OVERHEAD_US: u64 = 192;
/// Airtime per payload byte at 250 kbit/s
const BYTE_US: u64 = 32;
/// Time until a sent acknowledgement is reported
const ACK_US: u64 = 352;
/// Time until a missing acknowledgement is reported
const NO_ACK_US: u64 = 864;
/// Backoff unit of clear-channel assessment
const BACKOFF_UNIT_US: u64 = 320;
/// Backoff exponent range of clear-channel assessment
const MIN_BACKOFF_EXP: u32 = 3;
const MAX_BACKOFF_EXP: u32 = 5;

/// Capacity of each node's indication channel
const INDICATION_CAPACITY: usize = 256;

/// Configuration suitable for a simulated node
pub fn sim_config(seed: u64) -> MacConfig {
    MacConfig {
        tick_hz: SIM_TICK_HZ,
        rng_seed: Some(seed),
        ..Default::default()
    }
}

/// Frame seen on the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirRecord {
    /// Start of the transmission in microseconds
    pub at_us: u64,
    /// Index of the sending node
    pub from: usize,
    pub packet: Packet,
}

#[derive(Debug)]
enum SimEvent {
    Start { node: usize },
    Deliver { node: usize, event: MacEvent },
    Alarm { node: usize, generation: u64, tag: AlarmTag },
    Backoff { node: usize, raw: Bytes, attempt: u8 },
    TxEnd { frame: u64 },
}

#[derive(Debug)]
struct Scheduled {
    at: u64,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // reversed, so the heap pops the earliest event first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct AirFrame {
    from: usize,
    raw: Bytes,
    dst: L2Addr,
}

struct SimNode {
    mac: Mac<SimRadio, SimTicker>,
    port: Rc<RefCell<Port>>,
    alarm: Rc<Cell<Option<(Tick, AlarmTag)>>>,
    /// Alarm value the pending `Alarm` event was scheduled for
    armed: Option<(Tick, AlarmTag)>,
    generation: u64,
    indications: mpsc::Receiver<Indication>,
}

/// Shared channel with a set of simulated nodes
pub struct SimNetwork {
    clock: Rc<Cell<u64>>,
    nodes: Vec<SimNode>,
    queue: BinaryHeap<Scheduled>,
    seq: u64,
    on_air: HashMap<u64, AirFrame>,
    next_frame: u64,
    air_log: Vec<AirRecord>,
    rng: StdRng,
}

impl SimNetwork {
    /// Creates an empty network at time zero
    pub fn new(seed: u64) -> Self {
        SimNetwork {
            clock: Rc::new(Cell::new(0)),
            nodes: Vec::new(),
            queue: BinaryHeap::new(),
            seq: 0,
            on_air: HashMap::new(),
            next_frame: 0,
            air_log: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Adds a stopped node; returns its index
    pub fn add_node(&mut self, addr: L2Addr, config: MacConfig) -> Result<usize> {
        if config.tick_hz != SIM_TICK_HZ {
            return Err(Error::config(format!(
                "simulated nodes tick at {} Hz, got {}",
                SIM_TICK_HZ, config.tick_hz
            )));
        }
        if self.nodes.iter().any(|n| n.port.borrow().addr == addr) {
            return Err(Error::config(format!("duplicate node address {}", addr)));
        }

        let port = Rc::new(RefCell::new(Port::new(addr)));
        let alarm = Rc::new(Cell::new(None));
        let radio = SimRadio { port: port.clone() };
        let ticker = SimTicker {
            clock: self.clock.clone(),
            alarm: alarm.clone(),
        };
        let (up_tx, up_rx) = mpsc::channel(INDICATION_CAPACITY);
        let mac = Mac::new(config, radio, ticker, up_tx)?;

        self.nodes.push(SimNode {
            mac,
            port,
            alarm,
            armed: None,
            generation: 0,
            indications: up_rx,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Current virtual time in microseconds
    pub fn now_us(&self) -> u64 {
        self.clock.get()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn mac(&self, node: usize) -> &Mac<SimRadio, SimTicker> {
        &self.nodes[node].mac
    }

    /// Every frame put on the air so far
    pub fn air_log(&self) -> &[AirRecord] {
        &self.air_log
    }

    /// Starts duty cycling of `node` at `at_us`
    pub fn start_node_at(&mut self, node: usize, at_us: u64) {
        self.schedule(at_us, SimEvent::Start { node });
    }

    /// Hands a payload to `node` at `at_us`
    pub fn send_at(&mut self, node: usize, at_us: u64, dst: Destination, payload: Bytes) {
        let event = MacEvent::Send { dst, payload };
        self.schedule(at_us, SimEvent::Deliver { node, event });
    }

    /// Requests an interface state change of `node` at `at_us`
    pub fn set_state_at(&mut self, node: usize, at_us: u64, state: NetState) {
        let event = MacEvent::SetState(state);
        self.schedule(at_us, SimEvent::Deliver { node, event });
    }

    /// Indications the node produced so far
    pub fn take_indications(&mut self, node: usize) -> Vec<Indication> {
        let mut out = Vec::new();
        while let Ok(indication) = self.nodes[node].indications.try_recv() {
            out.push(indication);
        }
        out
    }

    /// Processes every event up to and including `end_us`
    pub fn run_until(&mut self, end_us: u64) {
        loop {
            match self.queue.peek() {
                Some(next) if next.at <= end_us => {}
                _ => break,
            }
            let next = match self.queue.pop() {
                Some(next) => next,
                None => break,
            };
            if next.at > self.clock.get() {
                self.clock.set(next.at);
            }
            self.process(next.event);
        }
        if end_us > self.clock.get() {
            self.clock.set(end_us);
        }
    }

    fn schedule(&mut self, at: u64, event: SimEvent) {
        self.seq += 1;
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            event,
        });
    }

    fn deliver(&mut self, at: u64, node: usize, event: RadioEvent) {
        let event = MacEvent::Radio(event);
        self.schedule(at, SimEvent::Deliver { node, event });
    }

    fn process(&mut self, event: SimEvent) {
        match event {
            SimEvent::Start { node } => {
                self.nodes[node].mac.start();
                self.sync(node);
            }
            SimEvent::Deliver { node, event } => {
                self.nodes[node].mac.handle_event(event);
                self.sync(node);
            }
            SimEvent::Alarm {
                node,
                generation,
                tag,
            } => {
                let sim_node = &mut self.nodes[node];
                if sim_node.generation != generation {
                    return;
                }
                // the alarm register is one-shot
                sim_node.alarm.set(None);
                sim_node.armed = None;
                sim_node.mac.handle_event(MacEvent::Alarm(tag));
                self.sync(node);
            }
            SimEvent::Backoff { node, raw, attempt } => self.clear_channel(node, raw, attempt),
            SimEvent::TxEnd { frame } => self.end_transmission(frame),
        }
    }

    /// Picks up alarm and transmit requests a node made while handling an event
    fn sync(&mut self, node: usize) {
        let now = self.clock.get();
        let sim_node = &mut self.nodes[node];

        let current = sim_node.alarm.get();
        if current != sim_node.armed {
            sim_node.armed = current;
            sim_node.generation += 1;
            if let Some((at, tag)) = current {
                let generation = sim_node.generation;
                let delay = remaining(at, now as Tick).max(0) as u64;
                self.schedule(
                    now + delay,
                    SimEvent::Alarm {
                        node,
                        generation,
                        tag,
                    },
                );
            }
        }

        let outbox: Vec<Bytes> = self.nodes[node].port.borrow_mut().outbox.drain(..).collect();
        for raw in outbox {
            let csma = self.nodes[node].port.borrow().csma;
            if csma {
                self.nodes[node].port.borrow_mut().backing_off = true;
                let delay = self.backoff(0);
                self.schedule(now + delay, SimEvent::Backoff { node, raw, attempt: 0 });
            } else {
                self.start_transmission(node, raw);
            }
        }
    }

    fn backoff(&mut self, attempt: u8) -> u64 {
        let exp = (MIN_BACKOFF_EXP + u32::from(attempt)).min(MAX_BACKOFF_EXP);
        let slots = self.rng.gen_range(0..(1u64 << exp));
        slots * BACKOFF_UNIT_US
    }

    fn clear_channel(&mut self, node: usize, raw: Bytes, attempt: u8) {
        let now = self.clock.get();
        if self.on_air.is_empty() {
            self.nodes[node].port.borrow_mut().backing_off = false;
            self.start_transmission(node, raw);
            return;
        }

        let retries = self.nodes[node].port.borrow().csma_retries;
        if attempt >= retries {
            trace!(node, attempt, "channel busy, giving up");
            self.nodes[node].port.borrow_mut().backing_off = false;
            self.deliver(now, node, RadioEvent::TxMediumBusy);
            return;
        }

        let delay = self.backoff(attempt + 1);
        self.schedule(
            now + delay,
            SimEvent::Backoff {
                node,
                raw,
                attempt: attempt + 1,
            },
        );
    }

    fn start_transmission(&mut self, node: usize, raw: Bytes) {
        let now = self.clock.get();
        let id = self.next_frame;
        self.next_frame += 1;

        let dst = match decode_packet(&raw) {
            Ok(packet) => {
                debug!(node, kind = packet.frame.kind(), dst = %packet.dst, "frame on air");
                let dst = packet.dst;
                self.air_log.push(AirRecord {
                    at_us: now,
                    from: node,
                    packet,
                });
                dst
            }
            Err(_) => L2Addr::BROADCAST,
        };

        {
            let mut port = self.nodes[node].port.borrow_mut();
            port.transmitting = Some(id);
            port.drop_receptions();
        }
        self.deliver(now, node, RadioEvent::TxStarted);

        for other in 0..self.nodes.len() {
            if other == node {
                continue;
            }
            let accepted = {
                let mut port = self.nodes[other].port.borrow_mut();
                let addressed = dst.is_broadcast() || dst == port.addr;
                if !addressed || !port.is_listening() {
                    false
                } else {
                    if !port.receiving.is_empty() {
                        let overlapping = port.receiving.clone();
                        port.corrupted.extend(overlapping);
                        port.corrupted.push(id);
                    }
                    port.receiving.push(id);
                    true
                }
            };
            if accepted {
                self.deliver(now, other, RadioEvent::RxStarted);
            }
        }

        let airtime = PHY_OVERHEAD_US + BYTE_US * raw.len() as u64;
        self.on_air.insert(id, AirFrame { from: node, raw, dst });
        self.schedule(now + airtime, SimEvent::TxEnd { frame: id });
    }

    fn end_transmission(&mut self, id: u64) {
        let now = self.clock.get();
        let frame = match self.on_air.remove(&id) {
            Some(frame) => frame,
            None => return,
        };
        self.nodes[frame.from].port.borrow_mut().transmitting = None;

        let mut acked = false;
        for other in 0..self.nodes.len() {
            if other == frame.from {
                continue;
            }
            let outcome = {
                let mut port = self.nodes[other].port.borrow_mut();
                match port.receiving.iter().position(|&f| f == id) {
                    None => None,
                    Some(pos) => {
                        port.receiving.remove(pos);
                        let damaged = match port.corrupted.iter().position(|&f| f == id) {
                            Some(pos) => {
                                port.corrupted.remove(pos);
                                true
                            }
                            None => false,
                        };
                        if !damaged {
                            port.inbox.push_back(frame.raw.clone());
                            if frame.dst == port.addr && port.auto_ack {
                                acked = true;
                            }
                        }
                        Some(damaged)
                    }
                }
            };
            if let Some(damaged) = outcome {
                if damaged {
                    trace!(node = other, frame = id, "reception corrupted");
                }
                self.deliver(now, other, RadioEvent::RxComplete);
            }
        }

        if frame.dst.is_broadcast() {
            self.deliver(now, frame.from, RadioEvent::TxComplete);
        } else if acked {
            self.deliver(now + ACK_US, frame.from, RadioEvent::TxComplete);
        } else {
            self.deliver(now + NO_ACK_US, frame.from, RadioEvent::TxNoAck);
        }
    }
}
