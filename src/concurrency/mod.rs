//! Concurrency primitives shared by handlers and background tasks:
//! - Backpressure: semaphore cap on in-flight handlers
//! - Cooldown: per-destination single-token rate limiter
//! - TTL cache: get-or-fetch store with a periodic sweep

pub mod backpressure;
pub mod cooldown;
pub mod ttl_cache;

pub use backpressure::{Backpressure, BackpressurePermit, BackpressureStats};
pub use cooldown::{CooldownTable, RateLimiter};
pub use ttl_cache::{CacheMap, SweepPolicy, TtlCache};

use std::time::Duration;

/// Weather lookups expire individually after ten minutes.
pub const WEATHER_TTL: Duration = Duration::from_secs(10 * 60);
pub const WEATHER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Prices are flushed wholesale every ten minutes.
pub const PRICE_TTL: Duration = Duration::from_secs(10 * 60);
pub const PRICE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert!(WEATHER_SWEEP_INTERVAL < WEATHER_TTL);
        assert_eq!(PRICE_SWEEP_INTERVAL, Duration::from_secs(600));
    }
}
