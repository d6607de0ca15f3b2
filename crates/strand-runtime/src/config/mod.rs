//! Runtime Configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .max_carriers(256)
//!     .carrier_idle_timeout(Duration::from_secs(1));
//! ```

pub mod defaults;

use std::time::Duration;

use strand_core::env::{env_get, env_get_bool, env_get_duration_ms, env_get_duration_us};
use strand_core::error::{StrandError, StrandResult};

use crate::timer::TimerThreadConfig;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long an idle carrier waits for a new fiber before exiting
    pub carrier_idle_timeout: Duration,
    /// Stack size of each carrier thread
    pub carrier_stack_size: usize,
    /// Maximum carriers running fibers at once
    ///
    /// Carriers whose fiber is parked don't count. Fibers spawned past the
    /// limit wait in the ready queue.
    pub max_carriers: usize,
    /// Timer thread settings
    pub timer: TimerThreadConfig,
    /// Log carrier lifecycle at info level
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_CARRIER_IDLE_MS` - Idle carrier lifetime in milliseconds
    /// - `STRAND_CARRIER_STACK_KB` - Carrier stack size in KiB
    /// - `STRAND_MAX_CARRIERS` - Maximum carriers running fibers at once
    /// - `STRAND_TIMER_POLL_US` - Longest timer thread sleep in microseconds
    /// - `STRAND_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            carrier_idle_timeout: env_get_duration_ms(
                "STRAND_CARRIER_IDLE_MS",
                base.carrier_idle_timeout,
            ),
            carrier_stack_size: env_get(
                "STRAND_CARRIER_STACK_KB",
                base.carrier_stack_size / 1024,
            ) * 1024,
            max_carriers: env_get("STRAND_MAX_CARRIERS", base.max_carriers),
            timer: TimerThreadConfig {
                max_poll_interval: env_get_duration_us(
                    "STRAND_TIMER_POLL_US",
                    base.timer.max_poll_interval,
                ),
                ..base.timer
            },
            debug_logging: env_get_bool("STRAND_DEBUG", base.debug_logging),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            carrier_idle_timeout: Duration::from_millis(defaults::CARRIER_IDLE_MS),
            carrier_stack_size: defaults::CARRIER_STACK_SIZE,
            max_carriers: defaults::MAX_CARRIERS,
            timer: TimerThreadConfig {
                max_poll_interval: Duration::from_micros(defaults::TIMER_MAX_POLL_US),
                ..TimerThreadConfig::default()
            },
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn carrier_idle_timeout(mut self, d: Duration) -> Self {
        self.carrier_idle_timeout = d;
        self
    }

    pub fn carrier_stack_size(mut self, size: usize) -> Self {
        self.carrier_stack_size = size;
        self
    }

    pub fn max_carriers(mut self, n: usize) -> Self {
        self.max_carriers = n;
        self
    }

    pub fn timer(mut self, timer: TimerThreadConfig) -> Self {
        self.timer = timer;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> StrandResult<()> {
        if self.max_carriers == 0 {
            return Err(StrandError::InvalidConfig("max_carriers must be > 0"));
        }
        if self.carrier_stack_size < 64 * 1024 {
            return Err(StrandError::InvalidConfig("carrier_stack_size must be >= 64KB"));
        }
        if self.carrier_idle_timeout.is_zero() {
            return Err(StrandError::InvalidConfig("carrier_idle_timeout must be > 0"));
        }
        if self.timer.max_poll_interval < self.timer.min_sleep {
            return Err(StrandError::InvalidConfig(
                "timer max_poll_interval must be >= min_sleep",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        strand_core::kprintln!("strand configuration:");
        strand_core::kprintln!("  carrier_idle_timeout:   {:?}", self.carrier_idle_timeout);
        strand_core::kprintln!("  carrier_stack_size:     {}", self.carrier_stack_size);
        strand_core::kprintln!("  max_carriers:           {}", self.max_carriers);
        strand_core::kprintln!("  timer.max_poll:         {:?}", self.timer.max_poll_interval);
        strand_core::kprintln!("  timer.min_sleep:        {:?}", self.timer.min_sleep);
        strand_core::kprintln!("  debug_logging:          {}", self.debug_logging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert_eq!(config.max_carriers, defaults::MAX_CARRIERS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .max_carriers(8)
            .carrier_idle_timeout(Duration::from_millis(250))
            .debug_logging(true);

        assert_eq!(config.max_carriers, 8);
        assert_eq!(config.carrier_idle_timeout, Duration::from_millis(250));
        assert!(config.debug_logging);
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig::new().max_carriers(0);
        assert_eq!(
            config.validate(),
            Err(StrandError::InvalidConfig("max_carriers must be > 0"))
        );

        let config = RuntimeConfig::new().carrier_stack_size(4096);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().carrier_idle_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
