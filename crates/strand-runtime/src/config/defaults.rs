//! Library defaults for `RuntimeConfig`

/// Idle carrier lifetime before it retires
pub const CARRIER_IDLE_MS: u64 = 5_000;

/// Stack size per carrier thread
pub const CARRIER_STACK_SIZE: usize = 1024 * 1024;

/// Upper bound on simultaneously alive carriers (= concurrently live fibers)
pub const MAX_CARRIERS: usize = 4096;

/// Longest the timer thread sleeps between polls
pub const TIMER_MAX_POLL_US: u64 = 10_000;

pub const DEBUG_LOGGING: bool = false;
