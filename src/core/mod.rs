//! Core types for the duty-cycled MAC
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    Destination,
    L2Addr,
    MacConfig,
    NetState,
    Timing,
};

/// Length of a link-layer address in bytes
pub const MAX_L2_ADDR_LEN: usize = 8;

/// Default hardware ticker frequency (32.768 kHz real-time timer)
pub const DEFAULT_TICK_HZ: u32 = 32_768;

/// Largest encoded frame the radio accepts
pub const MAX_FRAME_SIZE: usize = 127;

/// Number of recently dispatched broadcasts remembered for duplicate suppression
pub const BROADCAST_HISTORY_LEN: usize = 16;
