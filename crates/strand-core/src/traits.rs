//! Fiber entity interface
//!
//! Local storage never talks to a scheduler directly. It only needs the
//! currently running fiber's two slot arrays, and any scheduler backend that
//! can hand those out can host fiber-local and execution-local variables.

use core::cell::Cell;

use crate::constants::TRIVIAL_SLOT_SIZE;
use crate::erased::ErasedPtr;

/// One trivial fiber-local slot: a single zero-initialized machine word
pub type TrivialFls = Cell<u64>;

/// Per-fiber storage exposed by a scheduler backend
///
/// Both methods must return the same slot for the same index for the whole
/// life of the fiber, and slots of different fibers must never alias. A
/// fiber's entity is only touched by the carrier currently running it, so
/// implementations need no internal locking on the inline path.
pub trait FiberEntity {
    /// Trivial slot `index` (zero on first access)
    fn trivial_fls(&self, index: usize) -> &TrivialFls;

    /// Boxed slot `index` (empty on first access)
    fn fls(&self, index: usize) -> &ErasedPtr;
}

/// Plain data that fits in one trivial slot
///
/// # Safety
///
/// Implementors must be `Copy`, no larger and no more aligned than `u64`,
/// and every bit pattern of their size (in particular all zeros, which is
/// what a fresh slot holds) must be a valid value. Trivial slots are not
/// reset when an index is recycled, so a new variable may observe a
/// previous owner's bits.
pub unsafe trait TrivialValue: Copy + 'static {
    /// Convert a value to its slot representation
    #[inline]
    fn into_slot(self) -> u64 {
        let mut word = 0u64;
        // Safety: size/alignment requirements of the trait.
        unsafe {
            core::ptr::write(&mut word as *mut u64 as *mut Self, self);
        }
        word
    }

    /// Reinterpret a slot word as a value
    #[inline]
    fn from_slot(word: u64) -> Self {
        // Safety: every bit pattern is valid per the trait contract.
        unsafe { core::ptr::read(&word as *const u64 as *const Self) }
    }
}

macro_rules! trivial_value {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl TrivialValue for $t {}
            const _: () = assert!(core::mem::size_of::<$t>() <= TRIVIAL_SLOT_SIZE);
        )*
    };
}

trivial_value!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

unsafe impl<T: 'static> TrivialValue for *const T {}
unsafe impl<T: 'static> TrivialValue for *mut T {}
