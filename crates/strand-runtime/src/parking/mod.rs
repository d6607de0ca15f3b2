//! Fiber parking mechanism
//!
//! Every fiber owns exactly one parker. A blocked fiber parks on it; whoever
//! makes the fiber runnable again (an event, a mutex release, the timer
//! thread) unparks it through a [`FiberWaker`](crate::FiberWaker).
//!
//! Parkers hold a single wake permit. `unpark` before `park` is not lost:
//! the next `park` consumes the permit and returns immediately. Spurious
//! returns are allowed, so callers always re-check their condition.

use std::time::Duration;

/// Single-owner park/unpark primitive
pub trait Parker: Send + Sync {
    /// Block the owning fiber until unparked or `timeout` elapses
    ///
    /// Returns `true` if a wake permit was consumed, `false` on timeout or
    /// spurious wakeup.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Make a permit available, waking the owner if it is parked
    fn unpark(&self);
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParker as PlatformParker;
    } else {
        mod fallback;
        pub use fallback::FallbackParker as PlatformParker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parker = PlatformParker::new();
        let start = Instant::now();
        let woken = parker.park(Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(!woken);
        assert!(elapsed >= Duration::from_millis(40));
    }

    #[test]
    fn test_unpark_before_park_is_kept() {
        let parker = PlatformParker::new();
        parker.unpark();

        let start = Instant::now();
        assert!(parker.park(Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(1));

        // Permit was consumed
        assert!(!parker.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_unpark_wakes_parked() {
        let parker = Arc::new(PlatformParker::new());
        let parker2 = Arc::clone(&parker);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(10) {
                if parker2.park(Some(Duration::from_secs(10))) {
                    return true;
                }
            }
            false
        });

        thread::sleep(Duration::from_millis(50));
        parker.unpark();

        assert!(handle.join().unwrap());
    }
}
