//! Fiber-local storage
//!
//! Like `thread_local!`, but scoped to a fiber: every fiber sees its own
//! copy of each variable, no matter which carrier runs it. Code outside any
//! fiber gets the OS thread's master fiber.
//!
//! ```ignore
//! static REQUEST_ID: TrivialFiberLocal<u64> = TrivialFiberLocal::new();
//! static SCRATCH: FiberLocal<RefCell<Vec<u8>>> = FiberLocal::new();
//!
//! REQUEST_ID.set(42);
//! SCRATCH.with(|buf| buf.borrow_mut().clear());
//! ```
//!
//! Each variable owns one slot index, allocated on first access from a
//! namespace shared by all variables of its kind and returned when the
//! variable is dropped.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use strand_core::{FiberEntity, LazyIndex, TrivialValue};

use crate::tls::with_current_fiber;

/// Index namespace of trivial fiber locals
enum TrivialSlots {}

/// Index namespace of boxed fiber locals
enum BoxedSlots {}

/// Fiber-local word-sized plain value
///
/// Every fiber starts out seeing the all-zero value.
pub struct TrivialFiberLocal<T: TrivialValue> {
    index: LazyIndex<TrivialSlots>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TrivialValue> TrivialFiberLocal<T> {
    pub const fn new() -> Self {
        Self {
            index: LazyIndex::new(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> T {
        let index = self.index.get();
        with_current_fiber(|fiber| T::from_slot(fiber.trivial_fls(index).get()))
    }

    #[inline]
    pub fn set(&self, value: T) {
        let index = self.index.get();
        with_current_fiber(|fiber| fiber.trivial_fls(index).set(value.into_slot()));
    }

    /// Store `value`, returning the previous one
    #[inline]
    pub fn replace(&self, value: T) -> T {
        let index = self.index.get();
        with_current_fiber(|fiber| {
            T::from_slot(fiber.trivial_fls(index).replace(value.into_slot()))
        })
    }
}

impl<T: TrivialValue> Default for TrivialFiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fiber-local value, default-constructed on first use in each fiber
///
/// Values are destroyed when their fiber exits. Mutation goes through
/// interior mutability (`Cell`, `RefCell`), as with `thread_local!`.
pub struct FiberLocal<T: Default + Send + 'static> {
    index: LazyIndex<BoxedSlots>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Default + Send + 'static> FiberLocal<T> {
    pub const fn new() -> Self {
        Self {
            index: LazyIndex::new(),
            _marker: PhantomData,
        }
    }

    /// Run `f` with this fiber's value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let index = self.index.get();
        with_current_fiber(|fiber| {
            let slot = fiber.fls(index);
            let value = if slot.holds::<T>() {
                slot.load(Ordering::Acquire) as *const T
            } else {
                // Empty, or left over from a dropped variable that used the
                // same index. Only this fiber touches its slots, and nothing
                // can still borrow a dropped variable's value.
                unsafe {
                    slot.clear_unchecked();
                    slot.publish(Box::new(T::default())) as *const T
                }
            };
            // Safety: the value lives until the fiber exits or the slot is
            // reused by another variable after this one is dropped.
            f(unsafe { &*value })
        })
    }

    /// Clone of this fiber's value
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }
}

impl<T: Default + Send + 'static> Default for FiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::spawn;
    use std::cell::RefCell;
    use std::sync::mpsc;
    use std::time::Duration;

    static COUNTER: TrivialFiberLocal<u32> = TrivialFiberLocal::new();
    static NAME: FiberLocal<RefCell<String>> = FiberLocal::new();

    #[test]
    fn test_trivial_get_set_replace() {
        let local: TrivialFiberLocal<i64> = TrivialFiberLocal::new();
        assert_eq!(local.get(), 0);
        local.set(-3);
        assert_eq!(local.replace(9), -3);
        assert_eq!(local.get(), 9);
    }

    #[test]
    fn test_fibers_see_own_values() {
        let (tx, rx) = mpsc::channel();
        for i in 0..16u32 {
            let tx = tx.clone();
            spawn(move || {
                assert_eq!(COUNTER.get(), 0);
                COUNTER.set(i);
                NAME.with(|n| n.borrow_mut().push_str(&i.to_string()));
                std::thread::sleep(Duration::from_millis(5));
                tx.send((i, COUNTER.get(), NAME.get().into_inner())).unwrap();
            });
        }
        for _ in 0..16 {
            let (i, seen, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(seen, i);
            assert_eq!(name, i.to_string());
        }
    }

    #[test]
    fn test_value_dropped_at_fiber_exit() {
        #[derive(Default)]
        struct Probe(Option<mpsc::Sender<()>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        static PROBE: FiberLocal<RefCell<Probe>> = FiberLocal::new();

        let (tx, rx) = mpsc::channel();
        spawn(move || {
            PROBE.with(|p| p.borrow_mut().0 = Some(tx));
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_recycled_index_resets_foreign_value() {
        let first: FiberLocal<String> = FiberLocal::new();
        first.with(|s| assert!(s.is_empty()));
        drop(first);

        // Likely reuses the freed index on this thread's master fiber
        let second: FiberLocal<Vec<u32>> = FiberLocal::new();
        second.with(|v| assert!(v.is_empty()));
    }

    #[test]
    fn test_many_locals_spill_to_overflow() {
        let locals: Vec<TrivialFiberLocal<usize>> =
            (0..40).map(|_| TrivialFiberLocal::new()).collect();
        for (i, local) in locals.iter().enumerate() {
            local.set(i * 10);
        }
        for (i, local) in locals.iter().enumerate() {
            assert_eq!(local.get(), i * 10);
        }
    }
}
