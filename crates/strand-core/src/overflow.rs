//! Overflow slots
//!
//! Slot arrays keep a small inline prefix for the hot indices. Indices past
//! the inline capacity land here: a lazily allocated map from index to a
//! heap-allocated slot. Slots are never moved or removed until `clear`, so a
//! reference obtained from `get_or_insert` stays valid for as long as the
//! shared borrow of the map it came from.

use core::ptr::NonNull;
use std::collections::HashMap;

use crate::spinlock::SpinLock;

/// Address-stable, lazily allocated slot map
pub struct OverflowSlots<T> {
    map: SpinLock<Option<HashMap<usize, NonNull<T>>>>,
}

// Safety: slots are owned boxes handed out as shared references only.
unsafe impl<T: Send> Send for OverflowSlots<T> {}
unsafe impl<T: Send + Sync> Sync for OverflowSlots<T> {}

impl<T> OverflowSlots<T> {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new(None),
        }
    }

    /// Look up an existing slot
    pub fn get(&self, index: usize) -> Option<&T> {
        let map = self.map.lock();
        map.as_ref()
            .and_then(|m| m.get(&index))
            // Safety: the slot lives until `clear(&mut self)` / drop.
            .map(|p| unsafe { &*p.as_ptr() })
    }

    /// Number of slots allocated so far
    pub fn len(&self) -> usize {
        self.map.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every slot
    pub fn clear(&mut self) {
        if let Some(map) = self.map.get_mut().take() {
            for (_, slot) in map {
                // Safety: created by `Box::into_raw` in `get_or_insert_with`.
                drop(unsafe { Box::from_raw(slot.as_ptr()) });
            }
        }
    }

    /// Get slot `index`, creating it with `init` if it doesn't exist yet
    ///
    /// `init` runs with the map locked and must not touch this map.
    pub fn get_or_insert_with(&self, index: usize, init: impl FnOnce() -> T) -> &T {
        let mut map = self.map.lock();
        let slot = *map
            .get_or_insert_with(HashMap::new)
            .entry(index)
            .or_insert_with(|| NonNull::from(Box::leak(Box::new(init()))));
        // Safety: the slot lives until `clear(&mut self)` / drop.
        unsafe { &*slot.as_ptr() }
    }
}

impl<T: Default> OverflowSlots<T> {
    /// Get slot `index`, default-constructing it on first use
    pub fn get_or_insert(&self, index: usize) -> &T {
        self.get_or_insert_with(index, T::default)
    }
}

impl<T> Default for OverflowSlots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OverflowSlots<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_lazy_allocation() {
        let slots: OverflowSlots<Cell<u64>> = OverflowSlots::new();
        assert!(slots.is_empty());
        assert!(slots.get(100).is_none());

        slots.get_or_insert(100).set(7);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.get(100).map(Cell::get), Some(7));
    }

    #[test]
    fn test_addresses_stable_across_growth() {
        let slots: OverflowSlots<Cell<u64>> = OverflowSlots::new();
        let first = slots.get_or_insert(8);
        first.set(42);

        // Force the map to rehash a few times
        for i in 9..1000 {
            slots.get_or_insert(i).set(i as u64);
        }

        assert_eq!(first.get(), 42);
        assert!(std::ptr::eq(first, slots.get_or_insert(8)));
    }

    #[test]
    fn test_clear_drops_slots() {
        let mut slots: OverflowSlots<String> = OverflowSlots::new();
        slots.get_or_insert_with(12, || "x".repeat(3));
        assert_eq!(slots.get(12).map(String::as_str), Some("xxx"));

        slots.clear();
        assert!(slots.is_empty());
        assert!(slots.get(12).is_none());
    }
}
