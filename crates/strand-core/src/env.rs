//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `RuntimeConfig::from_env` and the
//! logger.
//!
//! ```ignore
//! use strand_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let carriers: usize = env_get("STRAND_MAX_CARRIERS", 4096);
//! let idle = env_get_duration_ms("STRAND_CARRIER_IDLE_MS", Duration::from_secs(5));
//! let debug = env_get_bool("STRAND_DEBUG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or `default` if unset/unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true, any other value is
/// false. Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Duration given in milliseconds
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map_or(default, Duration::from_millis)
}

/// Duration given in microseconds
#[inline]
pub fn env_get_duration_us(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map_or(default, Duration::from_micros)
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_defaults() {
        let key = "__STRAND_TEST_UNSET__";
        assert_eq!(env_get::<usize>(key, 42), 42);
        assert!(env_get_bool(key, true));
        assert!(env_get_opt::<usize>(key).is_none());
        assert_eq!(env_get_str(key, "hello"), "hello");
        assert_eq!(env_get_duration_ms(key, Duration::from_secs(1)), Duration::from_secs(1));
        assert!(!env_is_set(key));
    }

    #[test]
    fn test_parse_set_values() {
        std::env::set_var("__STRAND_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__STRAND_TEST_NUM__", 0), 123);
        assert_eq!(
            env_get_duration_ms("__STRAND_TEST_NUM__", Duration::ZERO),
            Duration::from_millis(123)
        );
        assert_eq!(
            env_get_duration_us("__STRAND_TEST_NUM__", Duration::ZERO),
            Duration::from_micros(123)
        );
        std::env::remove_var("__STRAND_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        let key = "__STRAND_TEST_BOOL__";
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, truthy);
            assert!(env_get_bool(key, false), "{} should be true", truthy);
        }
        for falsy in ["0", "false", "garbage"] {
            std::env::set_var(key, falsy);
            assert!(!env_get_bool(key, true), "{} should be false", falsy);
        }
        std::env::remove_var(key);
    }

    #[test]
    fn test_invalid_parse_falls_back() {
        std::env::set_var("__STRAND_TEST_INVALID__", "not_a_number");
        assert_eq!(env_get::<usize>("__STRAND_TEST_INVALID__", 99), 99);
        std::env::remove_var("__STRAND_TEST_INVALID__");
    }
}
