//! Fiber-aware mutex
//!
//! Unlike std::sync::Mutex, a contended lock parks only the waiting fiber.
//! Waiters are served in FIFO order and ownership is handed directly to the
//! next waiter on unlock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strand_core::SpinLock;

use crate::fiber::FiberWaker;
use crate::scheduler::{current_waker, park_current};

struct Waiter {
    waker: FiberWaker,
    granted: AtomicBool,
}

/// A mutex that parks the fiber when contended
///
/// # Example
///
/// ```ignore
/// let mutex = FiberMutex::new(0);
///
/// // In a fiber:
/// {
///     let mut guard = mutex.lock();
///     *guard += 1;
/// } // Guard dropped, mutex unlocked
/// ```
pub struct FiberMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

// Safety: FiberMutex provides exclusive access to T
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Acquire the lock, parking the fiber if contended
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }
        self.lock_slow()
    }

    #[cold]
    fn lock_slow(&self) -> FiberMutexGuard<'_, T> {
        let waiter = Arc::new(Waiter {
            waker: current_waker(),
            granted: AtomicBool::new(false),
        });

        {
            let mut waiters = self.waiters.lock();
            // Unlock decides under the same lock, so this can't miss a release
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return FiberMutexGuard { mutex: self };
            }
            waiters.push_back(Arc::clone(&waiter));
        }

        while !waiter.granted.load(Ordering::Acquire) {
            park_current(None);
        }
        FiberMutexGuard { mutex: self }
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FiberMutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        let next = {
            let mut waiters = self.waiters.lock();
            let next = waiters.pop_front();
            if next.is_none() {
                self.locked.store(false, Ordering::Release);
            }
            next
        };

        // Ownership passes to the waiter, `locked` stays set
        if let Some(waiter) = next {
            waiter.granted.store(true, Ordering::Release);
            waiter.waker.wake();
        }
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("FiberMutex").field("data", &*guard).finish(),
            None => f.debug_struct("FiberMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Guard that releases the mutex when dropped
pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T> Deref for FiberMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for FiberMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
