//! Fiber entity
//!
//! The runtime's per-fiber record: identity, parker and the two local
//! storage arrays consumed through [`FiberEntity`].

use std::sync::Arc;
use std::time::Duration;

use strand_core::constants::{INLINE_FLS_SLOTS, INLINE_TRIVIAL_FLS_SLOTS};
use strand_core::{ErasedPtr, FiberEntity, FiberId, OverflowSlots, TrivialFls};

use crate::parking::{Parker, PlatformParker};
use crate::scheduler::Scheduler;

/// A fiber as seen by local storage and waitables
///
/// Created by the carrier that runs it and dropped when the fiber's closure
/// returns. Every OS thread also owns a *master* fiber, used whenever code
/// that is not running on a fiber touches fiber-local state.
pub struct Fiber {
    id: FiberId,
    parker: Arc<PlatformParker>,
    /// Scheduler whose carrier runs this fiber, `None` for master fibers
    scheduler: Option<&'static Scheduler>,
    trivial_fls: [TrivialFls; INLINE_TRIVIAL_FLS_SLOTS],
    fls: [ErasedPtr; INLINE_FLS_SLOTS],
    external_trivial_fls: OverflowSlots<TrivialFls>,
    external_fls: OverflowSlots<ErasedPtr>,
}

impl Fiber {
    pub(crate) fn new(id: FiberId) -> Self {
        Self {
            id,
            parker: Arc::new(PlatformParker::new()),
            scheduler: None,
            trivial_fls: std::array::from_fn(|_| TrivialFls::new(0)),
            fls: std::array::from_fn(|_| ErasedPtr::new()),
            external_trivial_fls: OverflowSlots::new(),
            external_fls: OverflowSlots::new(),
        }
    }

    pub(crate) fn on_carrier(id: FiberId, scheduler: &'static Scheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
            ..Self::new(id)
        }
    }

    /// Master fiber of an OS thread
    pub(crate) fn master() -> Self {
        Self::new(FiberId::NONE)
    }

    /// `FiberId::NONE` for master fibers
    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn is_master(&self) -> bool {
        self.id.is_none()
    }

    /// Handle that can make this fiber runnable from anywhere
    pub fn waker(&self) -> FiberWaker {
        FiberWaker {
            fiber: self.id,
            parker: Arc::clone(&self.parker),
        }
    }

    /// Block this fiber until woken or `timeout` elapses
    ///
    /// Must only be called by the fiber itself. May return spuriously.
    pub(crate) fn park(&self, timeout: Option<Duration>) -> bool {
        match self.scheduler {
            Some(scheduler) => {
                scheduler.fiber_parking();
                let woken = self.parker.park(timeout);
                scheduler.fiber_resumed();
                woken
            }
            None => self.parker.park(timeout),
        }
    }
}

impl FiberEntity for Fiber {
    #[inline]
    fn trivial_fls(&self, index: usize) -> &TrivialFls {
        match self.trivial_fls.get(index) {
            Some(slot) => slot,
            None => self.external_trivial_fls.get_or_insert(index),
        }
    }

    #[inline]
    fn fls(&self, index: usize) -> &ErasedPtr {
        match self.fls.get(index) {
            Some(slot) => slot,
            None => self.external_fls.get_or_insert(index),
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("overflow_trivial", &self.external_trivial_fls.len())
            .field("overflow_boxed", &self.external_fls.len())
            .finish()
    }
}

/// Wakes one particular fiber
///
/// Cheap to clone. Waking a fiber that is not parked leaves a permit, so a
/// wake racing with the fiber going to sleep is never lost.
#[derive(Clone)]
pub struct FiberWaker {
    fiber: FiberId,
    parker: Arc<PlatformParker>,
}

impl FiberWaker {
    #[inline]
    pub fn wake(&self) {
        self.parker.unpark();
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    /// Whether both wakers target the same fiber
    pub fn will_wake(&self, other: &FiberWaker) -> bool {
        Arc::ptr_eq(&self.parker, &other.parker)
    }
}

impl std::fmt::Debug for FiberWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FiberWaker").field(&self.fiber).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_inline_and_overflow_slots() {
        let fiber = Fiber::new(FiberId::new(1));

        fiber.trivial_fls(3).set(7);
        fiber.trivial_fls(100).set(9);
        assert_eq!(fiber.trivial_fls(3).get(), 7);
        assert_eq!(fiber.trivial_fls(100).get(), 9);
        assert_eq!(fiber.trivial_fls(101).get(), 0);

        assert!(fiber.fls(0).is_empty());
        assert!(fiber.fls(50).is_empty());
        assert!(std::ptr::eq(fiber.fls(50), fiber.fls(50)));
    }

    #[test]
    fn test_slots_do_not_alias_between_fibers() {
        let a = Fiber::new(FiberId::new(1));
        let b = Fiber::new(FiberId::new(2));
        a.trivial_fls(0).set(1);
        assert_eq!(b.trivial_fls(0).get(), 0);
        assert!(!std::ptr::eq(a.fls(20), b.fls(20)));
    }

    #[test]
    fn test_boxed_slot_dropped_with_fiber() {
        let counter = Arc::new(());
        {
            let fiber = Fiber::new(FiberId::new(3));
            unsafe {
                fiber.fls(9).publish(Box::new(Arc::clone(&counter)));
            }
            assert_eq!(Arc::strong_count(&counter), 2);
        }
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_waker_unparks() {
        let fiber = Fiber::master();
        assert!(fiber.is_master());

        let waker = fiber.waker();
        assert!(waker.will_wake(&fiber.waker()));
        waker.wake();

        let start = Instant::now();
        assert!(fiber.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
