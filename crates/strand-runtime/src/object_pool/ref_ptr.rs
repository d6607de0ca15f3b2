//! Intrusively reference-counted pooled objects
//!
//! A `RefPtr<T>` shares ownership of a pooled `T` whose counter lives inside
//! the object itself. Releasing the last reference returns the object to its
//! pool instead of freeing it.

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use super::{get, put, PoolTraits};

/// Embedded reference counter
///
/// Zero means "not owned by any `RefPtr`".
#[derive(Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// Pooled type with an embedded reference counter
///
/// # Safety
///
/// `ref_count` must always return the same counter, embedded in `self`, and
/// nothing but `RefPtr` may modify it.
pub unsafe trait RefCounted: PoolTraits {
    fn ref_count(&self) -> &RefCount;
}

/// Shared owner of a pooled `T`
pub struct RefPtr<T: RefCounted> {
    ptr: NonNull<T>,
}

// Safety: same rules as `Arc<T>`.
unsafe impl<T: RefCounted + Sync> Send for RefPtr<T> {}
unsafe impl<T: RefCounted + Sync> Sync for RefPtr<T> {}

impl<T: RefCounted> RefPtr<T> {
    /// Take an object from `T`'s pool with a reference count of one
    pub fn from_pool() -> Self {
        Self::adopt(get::<T>())
    }

    /// Take ownership of a boxed object
    pub fn adopt(obj: Box<T>) -> Self {
        obj.ref_count().0.store(1, Ordering::Relaxed);
        Self {
            ptr: NonNull::from(Box::leak(obj)),
        }
    }

    /// New reference to an object already owned by some `RefPtr`
    ///
    /// `None` if `obj` isn't shared-owned (e.g. still in its `Box`).
    pub fn upgrade(obj: &T) -> Option<Self> {
        // A live `&T` to a shared-owned object implies a live `RefPtr`, so
        // the count can't drop to zero under us.
        if obj.ref_count().get() == 0 {
            return None;
        }
        obj.ref_count().0.fetch_add(1, Ordering::Relaxed);
        Some(Self {
            ptr: NonNull::from(obj),
        })
    }

    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Current number of references
    pub fn strong_count(this: &Self) -> usize {
        this.ref_count().get()
    }

    /// Mutable access if this is the only reference
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if Self::strong_count(this) == 1 {
            // Safety: unique owner, nobody else can observe the object.
            Some(unsafe { this.ptr.as_mut() })
        } else {
            None
        }
    }
}

impl<T: RefCounted> Clone for RefPtr<T> {
    fn clone(&self) -> Self {
        self.ref_count().0.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr }
    }
}

impl<T: RefCounted> Deref for RefPtr<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: kept alive by our reference.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> Drop for RefPtr<T> {
    fn drop(&mut self) {
        if self.ref_count().0.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // Safety: last reference, the object came from `Box::leak`.
        let obj = unsafe { Box::from_raw(self.ptr.as_ptr()) };
        put(obj);
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for RefPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{thread_cached, PoolType};
    use super::*;

    #[derive(Default)]
    struct Counted {
        refs: RefCount,
        value: u32,
    }

    impl PoolTraits for Counted {
        const POOL_TYPE: PoolType = PoolType::ThreadLocal;

        fn create() -> Box<Self> {
            Box::default()
        }

        fn on_put(obj: &mut Self) {
            obj.value = 0;
        }
    }

    unsafe impl RefCounted for Counted {
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }
    }

    #[test]
    fn test_last_release_returns_to_pool() {
        let mut a = RefPtr::<Counted>::from_pool();
        if let Some(c) = RefPtr::get_mut(&mut a) {
            c.value = 5;
        }
        assert_eq!(a.value, 5);

        let b = a.clone();
        assert_eq!(RefPtr::strong_count(&a), 2);
        assert!(RefPtr::get_mut(&mut a).is_none());
        drop(a);
        assert_eq!(thread_cached::<Counted>(), 0);

        drop(b);
        assert_eq!(thread_cached::<Counted>(), 1);

        let c = RefPtr::<Counted>::from_pool();
        assert_eq!(c.value, 0);
        assert_eq!(RefPtr::strong_count(&c), 1);
    }

    #[test]
    fn test_upgrade() {
        let boxed = Counted::create();
        assert!(RefPtr::upgrade(&*boxed).is_none());

        let owned = RefPtr::adopt(boxed);
        let again = RefPtr::upgrade(&*owned).unwrap();
        assert!(RefPtr::ptr_eq(&owned, &again));
        assert_eq!(RefPtr::strong_count(&owned), 2);
    }
}
