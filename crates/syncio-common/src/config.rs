//! Configuration types for syncio
//!
//! Every tuning constant of the proxy is a configuration field. The
//! defaults reproduce long-standing production values; none of them is
//! load-bearing for correctness.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for one target proxy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Object-id pool configuration
    pub pool: PoolConfig,
    /// Dispatcher configuration
    pub dispatch: DispatchConfig,
    /// Capacity monitor configuration
    pub capacity: CapacityConfig,
}

/// Object-id pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Reservations block once fewer than this many ids remain usable
    pub low_water_mark: u64,
    /// How many ids a single pre-create request asks the target for
    pub window_step: u64,
    /// How long the control worker sleeps before retrying a failed
    /// pre-create request
    pub topup_retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 10,
            window_step: 50,
            topup_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Dispatcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrently sent requests
    pub max_in_flight: usize,
    /// Maximum records under active processing (admitted but not yet
    /// cancelled)
    pub max_in_progress: usize,
    /// The commit hook wakes the dispatcher eagerly once this many
    /// committed records are waiting; below it the wake is deferred to
    /// the next completion so small batches coalesce
    pub new_work_threshold: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            max_in_progress: 3,
            new_work_threshold: 3,
        }
    }
}

/// Capacity monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// How long a capacity snapshot stays fresh
    pub refresh_interval: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Durable intent log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum log file size in bytes
    pub max_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.pool.low_water_mark, 10);
        assert_eq!(config.pool.window_step, 50);
        assert_eq!(config.dispatch.max_in_flight, 5);
        assert_eq!(config.dispatch.max_in_progress, 3);
        assert_eq!(config.dispatch.new_work_threshold, 3);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = ProxyConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool.window_step, config.pool.window_step);
        assert_eq!(back.capacity.refresh_interval, config.capacity.refresh_interval);
    }
}
