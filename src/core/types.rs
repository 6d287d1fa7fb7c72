use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::time::Tick;
use crate::util::duration_to_ticks;

/// Link-layer (long) address of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L2Addr(pub [u8; super::MAX_L2_ADDR_LEN]);

impl L2Addr {
    /// The all-ones link broadcast address
    pub const BROADCAST: L2Addr = L2Addr([0xff; super::MAX_L2_ADDR_LEN]);

    /// Creates an address whose last byte is `id`, handy for small networks
    pub fn from_short(id: u16) -> Self {
        let mut bytes = [0u8; super::MAX_L2_ADDR_LEN];
        bytes[super::MAX_L2_ADDR_LEN - 2..].copy_from_slice(&id.to_be_bytes());
        L2Addr(bytes)
    }

    /// Returns whether this is the link broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Returns the raw address bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for L2Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for L2Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Destination of an upper-layer send request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Deliver to every neighbour in range
    Broadcast,
    /// Deliver to one neighbour
    Unicast(L2Addr),
}

impl Destination {
    /// Link address a frame to this destination is sent to
    pub fn link_addr(&self) -> L2Addr {
        match self {
            Destination::Broadcast => L2Addr::BROADCAST,
            Destination::Unicast(addr) => *addr,
        }
    }
}

impl From<L2Addr> for Destination {
    fn from(addr: L2Addr) -> Self {
        if addr.is_broadcast() {
            Destination::Broadcast
        } else {
            Destination::Unicast(addr)
        }
    }
}

/// Interface state requested by the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetState {
    /// Stop duty cycling and switch the radio off
    Off,
    /// Start duty cycling
    Idle,
    /// Stop and start again
    Reset,
}

/// Configuration for the duty-cycled MAC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    /// Frequency of the hardware ticker
    pub tick_hz: u32,
    /// Period between two consecutive wake-ups
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub wakeup_interval: Duration,
    /// Length of the listening window after each wake-up
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub wakeup_duration: Duration,
    /// Spacing between two wake requests of one hunt
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub time_between_wr: Duration,
    /// Overall budget of a wake request hunt (no-response timeout)
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub preamble_duration: Duration,
    /// How long one broadcast is repeated
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub broadcast_duration: Duration,
    /// Spacing between two copies of a broadcast
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub time_between_broadcast: Duration,
    /// Lead time before a known destination phase at which hunting starts
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub wr_preparation: Duration,
    /// Time a receiver waits for data after its wake ack (data timeout)
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub data_delay: Duration,
    /// Minimum distance between "now" and a newly armed duty-cycle alarm
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub event_margin: Duration,
    /// Maximum number of packets sent to one neighbour per cycle
    pub max_burst: u32,
    /// Retransmissions of a packet before it is dropped
    pub max_data_retries: u8,
    /// Failed receptions tolerated before listening ends early
    pub max_rx_extensions: u8,
    /// CSMA retries for data frames
    pub data_csma_retries: u8,
    /// CSMA retries for broadcast frames
    pub broadcast_csma_retries: u8,
    /// Capacity of the event channel feeding the MAC
    pub event_queue_size: usize,
    /// Capacity of each neighbour transmit queue
    pub tx_queue_capacity: usize,
    /// Capacity of the inbound frame queue
    pub rx_queue_capacity: usize,
    /// Maximum number of tracked neighbours
    pub max_neighbors: usize,
    /// Seed for the jitter generator, entropy when absent
    pub rng_seed: Option<u64>,
}

impl Default for MacConfig {
    fn default() -> Self {
        let wakeup_interval = Duration::from_millis(100);
        let time_between_wr = Duration::from_millis(5);
        let wakeup_duration = time_between_wr * 2;
        MacConfig {
            tick_hz: super::DEFAULT_TICK_HZ,
            wakeup_interval,
            wakeup_duration,
            time_between_wr,
            preamble_duration: wakeup_interval * 13 / 10,
            broadcast_duration: wakeup_interval * 11 / 10,
            time_between_broadcast: time_between_wr,
            wr_preparation: Duration::from_millis(3),
            data_delay: Duration::from_millis(10),
            event_margin: Duration::from_millis(2),
            max_burst: (wakeup_interval.as_micros() / wakeup_duration.as_micros()) as u32,
            max_data_retries: 3,
            max_rx_extensions: 3,
            data_csma_retries: 3,
            broadcast_csma_retries: 3,
            event_queue_size: 8,
            tx_queue_capacity: 8,
            rx_queue_capacity: 8,
            max_neighbors: 8,
            rng_seed: None,
        }
    }
}

impl MacConfig {
    /// Checks the configuration for values the MAC cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tick_hz == 0 {
            return Err(Error::config("tick frequency must be non-zero"));
        }
        let timing = self.timing();
        if timing.interval == 0 || timing.wakeup_duration == 0 || timing.time_between_wr == 0 {
            return Err(Error::config(
                "wake-up interval, listen window and wake request spacing must be non-zero",
            ));
        }
        if timing.wakeup_duration >= timing.interval {
            return Err(Error::config("listen window must be shorter than the wake-up interval"));
        }
        if timing.time_between_wr >= timing.wakeup_duration {
            return Err(Error::config(
                "wake request spacing must be shorter than the listen window",
            ));
        }
        if timing.phase_guard() * 2 >= timing.interval {
            return Err(Error::config("listen window too long for phase backoff"));
        }
        if timing.preamble_duration <= timing.interval {
            return Err(Error::config("preamble duration must exceed one wake-up interval"));
        }
        if timing.broadcast_duration <= timing.interval {
            return Err(Error::config("broadcast duration must exceed one wake-up interval"));
        }
        // wrapping deadline comparisons only hold within half the counter range
        if timing.preamble_duration > i32::MAX as Tick
            || timing.broadcast_duration > i32::MAX as Tick
        {
            return Err(Error::config("timeouts must stay below half the tick counter range"));
        }
        if timing.time_between_broadcast == 0 {
            return Err(Error::config("broadcast spacing must be non-zero"));
        }
        if timing.event_margin >= timing.wakeup_duration {
            return Err(Error::config("event margin must be shorter than the listen window"));
        }
        if self.max_burst == 0 {
            return Err(Error::config("burst limit must be at least 1"));
        }
        if self.event_queue_size == 0
            || self.tx_queue_capacity == 0
            || self.rx_queue_capacity == 0
            || self.max_neighbors == 0
        {
            return Err(Error::config("queue capacities must be at least 1"));
        }
        Ok(())
    }

    /// Converts all durations to ticks of the configured ticker
    pub fn timing(&self) -> Timing {
        let ticks = |d: Duration| duration_to_ticks(d, self.tick_hz);
        Timing {
            interval: ticks(self.wakeup_interval),
            wakeup_duration: ticks(self.wakeup_duration),
            time_between_wr: ticks(self.time_between_wr),
            preamble_duration: ticks(self.preamble_duration),
            broadcast_duration: ticks(self.broadcast_duration),
            time_between_broadcast: ticks(self.time_between_broadcast),
            wr_preparation: ticks(self.wr_preparation),
            data_delay: ticks(self.data_delay),
            event_margin: ticks(self.event_margin),
        }
    }
}

/// MAC timing expressed in ticker ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub interval: Tick,
    pub wakeup_duration: Tick,
    pub time_between_wr: Tick,
    pub preamble_duration: Tick,
    pub broadcast_duration: Tick,
    pub time_between_broadcast: Tick,
    pub wr_preparation: Tick,
    pub data_delay: Tick,
    pub event_margin: Tick,
}

impl Timing {
    /// Closest distance to a wake-interval boundary a neighbour phase may have
    /// before our own phase is moved away from it
    pub fn phase_guard(&self) -> Tick {
        self.wakeup_duration * 3 / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_address() {
        let addr = L2Addr::from_short(0x0102);
        assert_eq!(addr.0, [0, 0, 0, 0, 0, 0, 1, 2]);
        assert!(!addr.is_broadcast());
        assert!(L2Addr::BROADCAST.is_broadcast());
        assert_eq!(addr.to_string(), "00:00:00:00:00:00:01:02");
    }

    #[test]
    fn test_destination_from_addr() {
        assert_eq!(Destination::from(L2Addr::BROADCAST), Destination::Broadcast);
        let addr = L2Addr::from_short(7);
        assert_eq!(Destination::from(addr), Destination::Unicast(addr));
        assert_eq!(Destination::Unicast(addr).link_addr(), addr);
    }

    #[test]
    fn test_default_config() {
        let config = MacConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wakeup_duration, Duration::from_millis(10));
        assert_eq!(config.preamble_duration, Duration::from_millis(130));
        assert_eq!(config.broadcast_duration, Duration::from_millis(110));
        assert_eq!(config.max_burst, 10);
    }

    #[test]
    fn test_timing_in_ticks() {
        let config = MacConfig {
            tick_hz: 1_000_000,
            ..Default::default()
        };
        let timing = config.timing();
        assert_eq!(timing.interval, 100_000);
        assert_eq!(timing.wakeup_duration, 10_000);
        assert_eq!(timing.phase_guard(), 15_000);
        assert_eq!(timing.event_margin, 2_000);
    }

    #[test]
    fn test_invalid_config() {
        let config = MacConfig {
            wakeup_duration: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = MacConfig {
            max_burst: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // a 40 min preamble at 1 MHz does not fit half the counter
        let config = MacConfig {
            wakeup_interval: Duration::from_secs(1_800),
            preamble_duration: Duration::from_secs(2_400),
            broadcast_duration: Duration::from_secs(2_000),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_serde() {
        let config = MacConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: MacConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.wakeup_interval, config.wakeup_interval);
        assert_eq!(decoded.data_delay, config.data_delay);
        assert_eq!(decoded.max_burst, config.max_burst);
    }
}
