//! Fiber-aware waitables
//!
//! Blocking here parks only the calling fiber's carrier via its parker; on
//! threads that are not running a fiber the master fiber's parker is used,
//! so every type in this module also works from plain OS threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use strand_core::SpinLock;

use crate::fiber::FiberWaker;
use crate::scheduler::{current_waker, park_current};

/// Manual-reset event
///
/// Once `set`, every current and future `wait` returns immediately.
/// Everything written before `set` is visible after `wait` returns.
pub struct Event {
    set: AtomicBool,
    waiters: SpinLock<Vec<FiberWaker>>,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            waiters: SpinLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Block until `set` has been called
    pub fn wait(&self) {
        if self.is_set() || !self.register() {
            return;
        }
        while !self.is_set() {
            park_current(None);
        }
    }

    /// Block until `set` or `deadline`, returns whether the event is set
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_set() {
            return true;
        }
        let waker = current_waker();
        if !self.register_waker(waker.clone()) {
            return true;
        }
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            park_current(Some(deadline - now));
        }

        self.waiters.lock().retain(|w| !w.will_wake(&waker));
        self.is_set()
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Set the event and wake every waiter
    ///
    /// Calling this more than once is harmless.
    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn register(&self) -> bool {
        self.register_waker(current_waker())
    }

    /// `false` if the event got set meanwhile
    fn register_waker(&self, waker: FiberWaker) -> bool {
        let mut waiters = self.waiters.lock();
        if self.is_set() {
            return false;
        }
        waiters.push(waker);
        true
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

/// Event that sets itself once its deadline passes
///
/// `set` before the deadline wakes waiters early. Either way the event only
/// ever transitions once.
pub struct OneshotTimedEvent {
    expires_at: Instant,
    event: Event,
}

impl OneshotTimedEvent {
    pub fn new(expires_at: Instant) -> Self {
        Self {
            expires_at,
            event: Event::new(),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Block until `set` or expiry, returns `true` if woken by `set`
    pub fn wait(&self) -> bool {
        self.event.wait_until(self.expires_at)
    }

    pub fn set(&self) {
        if !self.event.is_set() {
            self.event.set();
        }
    }

    /// Set explicitly (expiry alone does not count)
    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }
}

/// Single-use countdown
///
/// `wait` blocks until `count_down` has been called enough times to bring
/// the counter to zero.
pub struct Latch {
    remaining: AtomicUsize,
    event: Event,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        let latch = Self {
            remaining: AtomicUsize::new(count),
            event: Event::new(),
        };
        if count == 0 {
            latch.event.set();
        }
        latch
    }

    /// Decrement by `n`, releasing waiters when the count reaches zero
    ///
    /// # Panics
    ///
    /// If `n` is more than the remaining count.
    pub fn count_down(&self, n: usize) {
        let prev = self.remaining.fetch_sub(n, Ordering::AcqRel);
        assert!(prev >= n, "latch counted down below zero");
        if prev == n {
            self.event.set();
        }
    }

    pub fn try_wait(&self) -> bool {
        self.event.is_set()
    }

    pub fn wait(&self) {
        self.event.wait();
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.event.wait_for(timeout)
    }

    pub fn arrive_and_wait(&self, n: usize) {
        self.count_down(n);
        self.wait();
    }
}
