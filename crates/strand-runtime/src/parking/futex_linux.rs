//! Linux futex-based parker
//!
//! Futex word semantics:
//! - `EMPTY` = no permit, owner running
//! - `NOTIFIED` = permit available
//! - `PARKED` = owner sleeping in FUTEX_WAIT
//!
//! `park` decrements the word, so `NOTIFIED -> EMPTY` consumes a permit and
//! `EMPTY -> PARKED` announces the sleep. `unpark` swaps in `NOTIFIED` and
//! only issues FUTEX_WAKE if it displaced `PARKED`.

use super::Parker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const EMPTY: u32 = 0;
const NOTIFIED: u32 = 1;
const PARKED: u32 = u32::MAX;

/// Linux futex-based parker
pub struct FutexParker {
    state: AtomicU32,
}

impl FutexParker {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY),
        }
    }

    fn futex_wait(&self, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // ETIMEDOUT, EAGAIN (word changed) and EINTR all just return to the
        // caller, which inspects the word itself.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                PARKED,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.state.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for FutexParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.state.fetch_sub(1, Ordering::Acquire) == NOTIFIED {
            return true;
        }

        self.futex_wait(timeout);

        // Either NOTIFIED (woken) or still PARKED (timeout / spurious)
        self.state.swap(EMPTY, Ordering::Acquire) == NOTIFIED
    }

    fn unpark(&self) {
        if self.state.swap(NOTIFIED, Ordering::Release) == PARKED {
            self.futex_wake();
        }
    }
}
