//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use std::time::Duration;

use crate::time::Tick;

/// Converts a duration to ticks of a ticker running at `tick_hz`
///
/// Saturates at the largest representable tick count.
pub fn duration_to_ticks(duration: Duration, tick_hz: u32) -> Tick {
    let ticks = duration.as_micros() * u128::from(tick_hz) / 1_000_000;
    Tick::try_from(ticks).unwrap_or(Tick::MAX)
}

/// Converts a tick count of a ticker running at `tick_hz` to a duration
pub fn ticks_to_duration(ticks: Tick, tick_hz: u32) -> Duration {
    if tick_hz == 0 {
        return Duration::ZERO;
    }
    let micros = u64::from(ticks) * 1_000_000 / u64::from(tick_hz);
    Duration::from_micros(micros)
}

/// Installs a global `tracing` subscriber printing at `level` and above
///
/// Does nothing when a subscriber is already installed.
pub fn init_logging(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// Installs a subscriber that writes through the test harness capture
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversion() {
        let duration = Duration::from_millis(100);
        assert_eq!(duration_to_ticks(duration, 1_000_000), 100_000);
        assert_eq!(duration_to_ticks(duration, 32_768), 3_276);
        assert_eq!(ticks_to_duration(100_000, 1_000_000), duration);
    }

    #[test]
    fn test_duration_conversion_saturates() {
        let long = Duration::from_secs(1_000_000);
        assert_eq!(duration_to_ticks(long, 1_000_000), Tick::MAX);
        assert_eq!(ticks_to_duration(10, 0), Duration::ZERO);
    }
}
