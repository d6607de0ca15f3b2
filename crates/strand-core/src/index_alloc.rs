//! Tagged slot-index allocator
//!
//! Hands out small integer indices for fiber-local and execution-local
//! variables. Each tag type owns an independent namespace, so the trivial
//! FLS, boxed FLS and ELS indices never collide with each other.
//!
//! Recycling is LIFO: the most recently freed index is handed out first,
//! which keeps the set of live indices dense and inside the inline slot
//! arrays as much as possible.
//!
//! Allocators are created lazily on first use of a tag and are never torn
//! down. There is no destruction-order hazard at process exit.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::spinlock::SpinLock;

struct Inner {
    /// LIFO stack of freed indices
    recycled: Vec<usize>,

    /// Next never-used index
    next_fresh: usize,
}

/// Slot-index allocator for one tag namespace
pub struct IndexAlloc {
    inner: SpinLock<Inner>,
}

/// Process-wide tag registry. Entries are leaked on purpose.
static REGISTRY: SpinLock<Option<HashMap<TypeId, &'static IndexAlloc>>> = SpinLock::new(None);

impl IndexAlloc {
    /// Create a standalone allocator (not registered under any tag)
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                recycled: Vec::new(),
                next_fresh: 0,
            }),
        }
    }

    /// Get the allocator for tag `Tag`
    ///
    /// The first call for a given tag creates it; later calls from any
    /// thread return the same instance.
    pub fn for_tag<Tag: ?Sized + 'static>() -> &'static IndexAlloc {
        let mut registry = REGISTRY.lock();
        let map = registry.get_or_insert_with(HashMap::new);
        *map
            .entry(TypeId::of::<Tag>())
            .or_insert_with(|| &*Box::leak(Box::new(IndexAlloc::new())))
    }

    /// Allocate an index
    ///
    /// Returns the most recently freed index if any, otherwise a fresh one.
    pub fn next(&self) -> usize {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.recycled.pop() {
            return index;
        }
        let index = inner.next_fresh;
        inner.next_fresh += 1;
        index
    }

    /// Return an index to the allocator
    ///
    /// Each allocated index must be freed exactly once. Freeing twice hands
    /// the same index to two owners.
    pub fn free(&self, index: usize) {
        let mut inner = self.inner.lock();

        cfg_if::cfg_if! {
            if #[cfg(any(debug_assertions, feature = "debug-assertions"))] {
                assert!(
                    index < inner.next_fresh,
                    "freeing index {} that was never allocated",
                    index
                );
                assert!(
                    !inner.recycled.contains(&index),
                    "index {} freed twice",
                    index
                );
            }
        }

        inner.recycled.push(index);
    }

    /// Number of indices currently allocated
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.next_fresh - inner.recycled.len()
    }

    /// Number of indices waiting on the recycle stack
    pub fn recycled_count(&self) -> usize {
        self.inner.lock().recycled.len()
    }

    /// Highest index ever handed out plus one
    pub fn high_water(&self) -> usize {
        self.inner.lock().next_fresh
    }
}

impl Default for IndexAlloc {
    fn default() -> Self {
        Self::new()
    }
}

const UNALLOCATED: usize = usize::MAX;

/// Index of one local variable, allocated from `Tag`'s namespace on first
/// use and freed on drop
///
/// `const`-constructible so variables holding one can be `static`.
pub struct LazyIndex<Tag: ?Sized + 'static> {
    index: AtomicUsize,
    _tag: PhantomData<fn() -> *const Tag>,
}

impl<Tag: ?Sized + 'static> LazyIndex<Tag> {
    pub const fn new() -> Self {
        Self {
            index: AtomicUsize::new(UNALLOCATED),
            _tag: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> usize {
        let index = self.index.load(Ordering::Acquire);
        if index != UNALLOCATED {
            return index;
        }
        self.allocate()
    }

    /// Index if already allocated
    pub fn peek(&self) -> Option<usize> {
        let index = self.index.load(Ordering::Acquire);
        (index != UNALLOCATED).then_some(index)
    }

    #[cold]
    fn allocate(&self) -> usize {
        let alloc = IndexAlloc::for_tag::<Tag>();
        let fresh = alloc.next();
        match self
            .index
            .compare_exchange(UNALLOCATED, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => {
                alloc.free(fresh);
                winner
            }
        }
    }
}

impl<Tag: ?Sized + 'static> Default for LazyIndex<Tag> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tag: ?Sized + 'static> Drop for LazyIndex<Tag> {
    fn drop(&mut self) {
        let index = *self.index.get_mut();
        if index != UNALLOCATED {
            IndexAlloc::for_tag::<Tag>().free(index);
        }
    }
}
