//! Fallback parker using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::Parker;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Condvar-based parker (fallback)
pub struct FallbackParker {
    /// `true` = permit available
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl FallbackParker {
    pub const fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for FallbackParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for FallbackParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        if !*guard {
            guard = match timeout {
                Some(t) => {
                    self.condvar
                        .wait_timeout(guard, t)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.condvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
        std::mem::replace(&mut *guard, false)
    }

    fn unpark(&self) {
        *self.notified.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_one();
    }
}
