//! Execution context and execution-local storage
//!
//! An execution context carries local state for a logical task across fiber
//! hops. Whoever installs a context with [`ExecutionContext::execute`] sees
//! the same [`ExecutionLocal`] values, whether that is the original fiber,
//! an async continuation, or a timer callback that captured the context.
//!
//! ```ignore
//! static USER: ExecutionLocal<Mutex<String>> = ExecutionLocal::new();
//!
//! let ctx = ExecutionContext::create();
//! ctx.execute(|| {
//!     USER.with(|u| *u.lock().unwrap() = "alice".into());
//!     spawn_async(|| USER.with(|u| u.lock().unwrap().clone())); // "alice"
//! });
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use strand_core::constants::INLINE_ELS_SLOTS;
use strand_core::{kwarn, ErasedPtr, LazyIndex, OverflowSlots};

use crate::fiber_local::TrivialFiberLocal;
use crate::mutex::FiberMutex;
use crate::object_pool::{PoolTraits, PoolType, RefCount, RefCounted, RefPtr};

/// Context installed on the running fiber, null if none
static CURRENT: TrivialFiberLocal<*const ExecutionContext> = TrivialFiberLocal::new();

/// Set after the first overflow slot is used anywhere in the process
static OVERFLOW_WARNED: AtomicBool = AtomicBool::new(false);

/// Shared local storage of a logical task
pub struct ExecutionContext {
    ref_count: RefCount,
    inline_els: [ErasedPtr; INLINE_ELS_SLOTS],
    external_els: OverflowSlots<ErasedPtr>,
    /// Serializes lazy construction of execution-local values
    init_lock: FiberMutex<()>,
}

impl ExecutionContext {
    fn new() -> Self {
        Self {
            ref_count: RefCount::new(),
            inline_els: std::array::from_fn(|_| ErasedPtr::new()),
            external_els: OverflowSlots::new(),
            init_lock: FiberMutex::new(()),
        }
    }

    /// Fresh, empty context
    pub fn create() -> RefPtr<ExecutionContext> {
        RefPtr::from_pool()
    }

    /// Run `f` with this context installed as current
    ///
    /// The previous context is restored when `f` returns or unwinds.
    pub fn execute<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore(*const ExecutionContext);

        impl Drop for Restore {
            fn drop(&mut self) {
                CURRENT.set(self.0);
            }
        }

        let _restore = Restore(CURRENT.replace(self as *const ExecutionContext));
        f()
    }

    /// New reference to the current context, if any
    ///
    /// # Panics
    ///
    /// If the current context is not owned by a `RefPtr`.
    pub fn capture() -> Option<RefPtr<ExecutionContext>> {
        let current = CURRENT.get();
        if current.is_null() {
            return None;
        }
        // Safety: installed by an `execute` frame still running on this fiber.
        let ctx = unsafe { &*current };
        match RefPtr::upgrade(ctx) {
            Some(captured) => Some(captured),
            None => panic!("execution context is not shared-owned and cannot be captured"),
        }
    }

    /// Address of the current context (null if none), for identity checks
    #[inline]
    pub fn current_ptr() -> *const ExecutionContext {
        CURRENT.get()
    }

    pub fn is_current(&self) -> bool {
        std::ptr::eq(Self::current_ptr(), self)
    }

    /// Destroy every execution-local value
    ///
    /// `&mut` guarantees no other holder can observe the entries. Only the
    /// pool does this, right before recycling the context.
    pub fn clear(&mut self) {
        debug_assert!(self.ref_count.get() <= 1, "clearing a shared execution context");
        for entry in &mut self.inline_els {
            entry.clear();
        }
        self.external_els.clear();
    }

    #[inline]
    fn entry(&self, index: usize) -> &ErasedPtr {
        match self.inline_els.get(index) {
            Some(entry) => entry,
            None => self.overflow_entry(index),
        }
    }

    #[cold]
    fn overflow_entry(&self, index: usize) -> &ErasedPtr {
        warn_overflow_once(index);
        self.external_els.get_or_insert(index)
    }
}

/// `true` if this call logged the warning
fn warn_overflow_once(index: usize) -> bool {
    if OVERFLOW_WARNED.swap(true, Ordering::Relaxed) {
        return false;
    }
    kwarn!(
        "execution-local slot {} is beyond the {} inline slots, using the overflow map",
        index,
        INLINE_ELS_SLOTS
    );
    true
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ref_count", &self.ref_count.get())
            .field("initialized_inline", &self.inline_els.iter().filter(|e| !e.is_empty()).count())
            .field("overflow", &self.external_els.len())
            .finish()
    }
}

impl PoolTraits for ExecutionContext {
    const POOL_TYPE: PoolType = PoolType::MemoryNodeShared;
    const LOW_WATER_MARK: usize = 8192;
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MINIMUM_THREAD_CACHE_SIZE: usize = 1024;
    const TRANSFER_BATCH_SIZE: usize = 1024;

    fn create() -> Box<Self> {
        Box::new(Self::new())
    }

    fn on_put(obj: &mut Self) {
        obj.clear();
    }
}

unsafe impl RefCounted for ExecutionContext {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

/// Run `f` inside `ctx` if there is one, as-is otherwise
pub fn with_execution_context_if_present<R>(
    ctx: Option<&ExecutionContext>,
    f: impl FnOnce() -> R,
) -> R {
    match ctx {
        Some(ctx) => ctx.execute(f),
        None => f(),
    }
}

/// Index namespace of execution locals
enum ElsSlots {}

/// Variable scoped to the current execution context
///
/// The value is default-constructed on first access within each context
/// and destroyed when the context is recycled. Contexts are shared between
/// fibers on different carriers, hence `T: Sync`.
///
/// Execution locals are meant to be `static`. Dropping one while a context
/// that used it is still alive leaves a value of the wrong type behind for
/// the next variable that is handed the same index.
pub struct ExecutionLocal<T: Default + Send + Sync + 'static> {
    index: LazyIndex<ElsSlots>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Default + Send + Sync + 'static> ExecutionLocal<T> {
    pub const fn new() -> Self {
        Self {
            index: LazyIndex::new(),
            _marker: PhantomData,
        }
    }

    /// Run `f` with the current context's value
    ///
    /// `T::default()` runs under the context's initialization lock and must
    /// not initialize other execution locals of the same context.
    ///
    /// # Panics
    ///
    /// If no execution context is current.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let ctx = current_or_panic();
        let entry = ctx.entry(self.index.get());
        let value = match entry.get::<T>() {
            Some(value) => value as *const T,
            None => Self::init_slow(ctx, entry),
        };
        // Safety: entries live until the context is cleared, which needs
        // exclusive access, and `ctx` is kept alive by `execute`.
        f(unsafe { &*value })
    }

    #[cold]
    fn init_slow(ctx: &ExecutionContext, entry: &ErasedPtr) -> *const T {
        let _guard = ctx.init_lock.lock();
        if let Some(value) = entry.get::<T>() {
            return value as *const T;
        }
        // Safety: we hold the initialization lock and the entry is empty.
        unsafe { entry.publish(Box::new(T::default())) }
    }

    /// Clone of the current context's value
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Install a prebuilt value with a custom deleter, bypassing the lock
    ///
    /// # Safety
    ///
    /// The current context's entry must be empty and nothing may access it
    /// concurrently, e.g. right after `ExecutionContext::create`, before
    /// the context is shared.
    pub unsafe fn unsafe_init(&self, value: Box<T>, deleter: fn(Box<T>)) {
        let entry = current_or_panic().entry(self.index.get());
        assert!(entry.is_empty(), "execution-local initialized twice");
        entry.publish_with(value, deleter);
    }
}

impl<T: Default + Send + Sync + 'static> Default for ExecutionLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn current_or_panic() -> &'static ExecutionContext {
    let current = CURRENT.get();
    assert!(!current.is_null(), "execution-local accessed without an execution context");
    // Safety: installed by an `execute` frame still running on this fiber,
    // which outlives any use in the caller.
    unsafe { &*current }
}
