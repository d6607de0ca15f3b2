//! Type-erased local storage entry
//!
//! One `ErasedPtr` backs one fiber-local or execution-local slot. It owns a
//! heap value of a type only known at the access site, together with the
//! `TypeId` of that value and a deleter that knows how to drop it.
//!
//! Publication protocol:
//! - the metadata (type + deleter) is written first,
//! - then the pointer is stored with `Release`,
//! - readers load the pointer with `Acquire` and only then look at the
//!   metadata or the value.
//!
//! A null pointer means "not initialized". Clearing needs exclusive access,
//! which `clear(&mut self)` gets from the borrow checker and
//! `clear_unchecked` gets from its caller.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::any::TypeId;

/// Drops the erased value. Zero-sized for the default deleter.
type Deleter = Box<dyn FnOnce(*mut ()) + Send>;

struct Meta {
    type_id: TypeId,
    deleter: Deleter,
}

/// Owning, type-erased pointer with its deleter
pub struct ErasedPtr {
    ptr: AtomicPtr<()>,
    meta: UnsafeCell<Option<Meta>>,
}

// Safety: `meta` is only written before the release-store of `ptr` (by a
// single publisher) and only read after an acquire-load of a non-null `ptr`
// or under exclusive access. The stored values are required to be `Send`.
unsafe impl Send for ErasedPtr {}
unsafe impl Sync for ErasedPtr {}

impl ErasedPtr {
    /// Create an empty entry
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            meta: UnsafeCell::new(None),
        }
    }

    /// Raw pointer load with the given ordering
    #[inline]
    pub fn load(&self, order: Ordering) -> *mut () {
        self.ptr.load(order)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Typed access to the stored value, `None` if not yet initialized
    ///
    /// The caller must know that the entry holds a `T`; this is checked in
    /// debug builds only.
    #[inline]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        debug_assert!(self.holds::<T>(), "slot holds a value of a different type");
        // Safety: non-null pointer was published from a `Box<T>` and stays
        // valid until exclusive clearing.
        Some(unsafe { &*(p as *const T) })
    }

    /// Whether the entry is initialized with a value of type `T`
    #[inline]
    pub fn holds<T: 'static>(&self) -> bool {
        if self.ptr.load(Ordering::Acquire).is_null() {
            return false;
        }
        // Safety: acquire-load of a non-null pointer synchronizes with the
        // publisher, which wrote `meta` before releasing the pointer.
        unsafe { (*self.meta.get()).as_ref() }
            .map_or(false, |m| m.type_id == TypeId::of::<T>())
    }

    /// Install `value` with the default deleter
    ///
    /// # Safety
    ///
    /// The entry must be empty and the caller must be the only publisher
    /// (holding the initialization lock, or with exclusive access).
    pub unsafe fn publish<T: Send + 'static>(&self, value: Box<T>) -> *mut T {
        self.publish_raw(
            Box::into_raw(value),
            Box::new(|p: *mut ()| {
                drop(Box::from_raw(p as *mut T));
            }),
        )
    }

    /// Install `value` with a caller-supplied deleter
    ///
    /// # Safety
    ///
    /// Same as [`ErasedPtr::publish`].
    pub unsafe fn publish_with<T: Send + 'static>(
        &self,
        value: Box<T>,
        deleter: fn(Box<T>),
    ) -> *mut T {
        self.publish_raw(
            Box::into_raw(value),
            Box::new(move |p: *mut ()| {
                deleter(Box::from_raw(p as *mut T));
            }),
        )
    }

    unsafe fn publish_raw<T: 'static>(&self, raw: *mut T, deleter: Deleter) -> *mut T {
        debug_assert!(
            self.ptr.load(Ordering::Relaxed).is_null(),
            "publishing into an initialized slot"
        );
        *self.meta.get() = Some(Meta {
            type_id: TypeId::of::<T>(),
            deleter,
        });
        self.ptr.store(raw as *mut (), Ordering::Release);
        raw
    }

    /// Destroy the stored value (if any) and reset to empty
    pub fn clear(&mut self) {
        // Safety: `&mut self` proves exclusive access.
        unsafe { self.clear_unchecked() }
    }

    /// Destroy the stored value through a shared reference
    ///
    /// # Safety
    ///
    /// No other thread may access the entry concurrently and no reference
    /// previously returned by [`ErasedPtr::get`] may still be alive.
    pub unsafe fn clear_unchecked(&self) {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::Acquire);
        let meta = (*self.meta.get()).take();
        match meta {
            Some(meta) if !p.is_null() => (meta.deleter)(p),
            _ => {}
        }
    }
}

impl Default for ErasedPtr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErasedPtr {
    fn drop(&mut self) {
        self.clear();
    }
}
