//! Thread-local storage for the running fiber
//!
//! Provides fast access to the fiber a carrier is currently running, or the
//! OS thread's master fiber when none is.

use std::cell::Cell;

use strand_core::FiberId;

use crate::fiber::Fiber;

thread_local! {
    /// Fiber running on this carrier, null outside fibers
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Stands in for a fiber on threads not running one
    static MASTER_FIBER: Fiber = Fiber::master();
}

/// Set the fiber running on this carrier
///
/// `fiber` must stay alive until `clear_current_fiber` is called.
#[inline]
pub(crate) fn set_current_fiber(fiber: &Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber as *const Fiber));
}

/// Clear the current fiber (carrier going idle)
#[inline]
pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|cell| cell.set(std::ptr::null()));
}

/// Run `f` with the current fiber, falling back to the master fiber
#[inline]
pub fn with_current_fiber<R>(f: impl FnOnce(&Fiber) -> R) -> R {
    let current = CURRENT_FIBER.with(Cell::get);
    if !current.is_null() {
        // Safety: set by the carrier for exactly the fiber's lifetime.
        return f(unsafe { &*current });
    }
    MASTER_FIBER.with(|master| f(master))
}

/// Id of the running fiber, `FiberId::NONE` outside fibers
#[inline]
pub fn current_fiber_id() -> FiberId {
    with_current_fiber(Fiber::id)
}

/// Check if we're running inside a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    CURRENT_FIBER.with(|cell| !cell.get().is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::FiberEntity;

    #[test]
    fn test_master_fiber_outside_fibers() {
        assert!(!is_in_fiber());
        assert!(current_fiber_id().is_none());

        with_current_fiber(|f| f.trivial_fls(0).set(11));
        assert_eq!(with_current_fiber(|f| f.trivial_fls(0).get()), 11);

        // Another thread has its own master fiber
        let other = std::thread::spawn(|| with_current_fiber(|f| f.trivial_fls(0).get()))
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn test_current_fiber_override() {
        let fiber = Fiber::new(FiberId::new(77));
        set_current_fiber(&fiber);
        assert!(is_in_fiber());
        assert_eq!(current_fiber_id(), FiberId::new(77));
        clear_current_fiber();
        assert!(!is_in_fiber());
    }
}
