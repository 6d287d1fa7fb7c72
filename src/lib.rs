//! Duty-cycled MAC for low-power wireless radios
//!
//! Nodes sleep most of the time and wake up periodically for a short listening
//! window. A sender hunts for the destination's window with repeated wake
//! requests, learns its wake-up phase from the wake ack, and later transmissions
//! start right before the destination wakes. Broadcasts are repeated for one full
//! interval so every neighbour hears a copy.
//!
//! The MAC is a single-threaded, event-driven state machine ([`mac::Mac`]) driven
//! by radio notifications, upper-layer requests and one hardware alarm. The
//! [`sim`] module runs several MACs against a shared virtual medium.
pub mod core;
pub mod mac;
pub mod protocol;
pub mod radio;
pub mod sim;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Destination, Error, L2Addr, MacConfig, NetState, Result};
pub use crate::mac::{channel, channel_for, Indication, Mac, MacEvent, MacHandle, MacState};
pub use crate::radio::{Radio, RadioEvent, RadioState};
pub use crate::time::{Tick, Ticker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
