//! Object pool
//!
//! Recycles expensive-to-construct objects by type. Each pooled type picks
//! its policy through [`PoolTraits`]:
//!
//! - `ThreadLocal` - per-thread cache only, objects never cross threads
//! - `MemoryNodeShared` - per-thread cache backed by a global queue; batches
//!   of `TRANSFER_BATCH_SIZE` objects move between the two
//! - `Disabled` - every `get` creates, every `put` destroys
//!
//! Idle objects above `LOW_WATER_MARK` are destroyed once they have been
//! idle for `MAX_IDLE`; objects above `HIGH_WATER_MARK` are destroyed right
//! away. An empty pool never fails, `get` falls back to `T::create()`.

mod ref_ptr;

pub use ref_ptr::{RefCount, RefCounted, RefPtr};

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use strand_core::{ktrace, SpinLock};

/// Pool scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolType {
    Disabled,
    ThreadLocal,
    MemoryNodeShared,
}

/// Per-type pool policy
pub trait PoolTraits: Sized + Send + 'static {
    const POOL_TYPE: PoolType;

    /// Idle objects kept regardless of age
    const LOW_WATER_MARK: usize = 0;

    /// Idle objects beyond this count are destroyed immediately
    const HIGH_WATER_MARK: usize = usize::MAX;

    /// Idle time after which objects above the low watermark are destroyed
    const MAX_IDLE: Duration = Duration::from_secs(10);

    /// Objects a thread cache keeps before spilling to the global queue
    const MINIMUM_THREAD_CACHE_SIZE: usize = 0;

    /// Objects moved per transfer between thread cache and global queue
    const TRANSFER_BATCH_SIZE: usize = 1;

    fn create() -> Box<Self>;

    /// Called on every object handed out by `get`
    fn on_get(_obj: &mut Self) {}

    /// Called on every object returned through `put`
    fn on_put(_obj: &mut Self) {}
}

/// Take an object from the pool, creating one if the pool is empty
pub fn get<T: PoolTraits>() -> Box<T> {
    let cached = match T::POOL_TYPE {
        PoolType::Disabled => None,
        _ => with_local_cache::<T, _>(LocalCache::pop).flatten(),
    };
    let mut obj = cached.unwrap_or_else(T::create);
    T::on_get(&mut obj);
    obj
}

/// Return an object to the pool
pub fn put<T: PoolTraits>(mut obj: Box<T>) {
    T::on_put(&mut obj);
    if T::POOL_TYPE == PoolType::Disabled {
        return;
    }
    // Doomed objects are dropped here, outside the cache borrow, so their
    // destructors may use the pool again.
    let doomed = with_local_cache::<T, _>(move |cache| cache.push(obj));
    drop(doomed);
}

/// Idle objects cached by the calling thread
pub fn thread_cached<T: PoolTraits>() -> usize {
    with_local_cache::<T, _>(|cache| cache.objects.len()).unwrap_or(0)
}

/// Idle objects in the global queue
pub fn globally_cached<T: PoolTraits>() -> usize {
    global_pool::<T>().map_or(0, |g| g.len.load(Ordering::Relaxed))
}

struct Idle<T> {
    obj: Box<T>,
    since: Instant,
}

/// Shared half of a `MemoryNodeShared` pool
struct GlobalPool<T> {
    queue: SegQueue<Idle<T>>,
    len: AtomicUsize,
}

impl<T> GlobalPool<T> {
    fn push(&self, idle: Idle<T>) {
        self.queue.push(idle);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    fn pop(&self) -> Option<Idle<T>> {
        let idle = self.queue.pop()?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(idle)
    }
}

type GlobalRegistry = HashMap<TypeId, &'static (dyn Any + Send + Sync)>;

/// Global pools are leaked, like the index allocators.
static GLOBAL_POOLS: SpinLock<Option<GlobalRegistry>> = SpinLock::new(None);

fn global_pool<T: PoolTraits>() -> Option<&'static GlobalPool<T>> {
    if T::POOL_TYPE != PoolType::MemoryNodeShared {
        return None;
    }
    let mut registry = GLOBAL_POOLS.lock();
    let pool = *registry
        .get_or_insert_with(HashMap::new)
        .entry(TypeId::of::<T>())
        .or_insert_with(|| {
            let pool: &'static GlobalPool<T> = Box::leak(Box::new(GlobalPool {
                queue: SegQueue::new(),
                len: AtomicUsize::new(0),
            }));
            pool as &'static (dyn Any + Send + Sync)
        });
    pool.downcast_ref::<GlobalPool<T>>()
}

/// Calling thread's half of a pool
struct LocalCache<T: PoolTraits> {
    /// Oldest at the front, most recently returned at the back
    objects: VecDeque<Idle<T>>,
    global: Option<&'static GlobalPool<T>>,
}

impl<T: PoolTraits> LocalCache<T> {
    fn new() -> Self {
        Self {
            objects: VecDeque::new(),
            global: global_pool::<T>(),
        }
    }

    fn idle_total(&self) -> usize {
        self.objects.len() + self.global.map_or(0, |g| g.len.load(Ordering::Relaxed))
    }

    fn pop(&mut self) -> Option<Box<T>> {
        if self.objects.is_empty() {
            self.refill();
        }
        self.objects.pop_back().map(|idle| idle.obj)
    }

    fn refill(&mut self) {
        let Some(global) = self.global else {
            return;
        };
        for _ in 0..T::TRANSFER_BATCH_SIZE.max(1) {
            match global.pop() {
                Some(idle) => self.objects.push_front(idle),
                None => break,
            }
        }
    }

    /// Cache `obj`, returning whatever must be destroyed
    fn push(&mut self, obj: Box<T>) -> Vec<Box<T>> {
        let mut doomed = Vec::new();
        if self.idle_total() >= T::HIGH_WATER_MARK {
            doomed.push(obj);
            return doomed;
        }

        let now = Instant::now();
        self.objects.push_back(Idle { obj, since: now });

        if let Some(global) = self.global {
            let spill_at = T::MINIMUM_THREAD_CACHE_SIZE + T::TRANSFER_BATCH_SIZE.max(1);
            if self.objects.len() > spill_at {
                for _ in 0..T::TRANSFER_BATCH_SIZE.max(1) {
                    match self.objects.pop_front() {
                        Some(idle) => global.push(idle),
                        None => break,
                    }
                }
            }
        }

        self.evict_idle(now, &mut doomed);
        doomed
    }

    fn evict_idle(&mut self, now: Instant, doomed: &mut Vec<Box<T>>) {
        while self.idle_total() > T::LOW_WATER_MARK {
            match self.objects.front() {
                Some(oldest) if now.duration_since(oldest.since) > T::MAX_IDLE => {
                    if let Some(idle) = self.objects.pop_front() {
                        doomed.push(idle.obj);
                    }
                }
                _ => break,
            }
        }
        // Objects flushed by exited threads age in the global queue
        if let Some(global) = self.global {
            for _ in 0..T::TRANSFER_BATCH_SIZE.max(1) {
                if self.idle_total() <= T::LOW_WATER_MARK {
                    break;
                }
                match global.pop() {
                    Some(idle) if now.duration_since(idle.since) > T::MAX_IDLE => {
                        doomed.push(idle.obj)
                    }
                    Some(idle) => {
                        global.push(idle);
                        break;
                    }
                    None => break,
                }
            }
        }
        if !doomed.is_empty() {
            ktrace!("evicting {} idle {}", doomed.len(), std::any::type_name::<T>());
        }
    }
}

impl<T: PoolTraits> Drop for LocalCache<T> {
    fn drop(&mut self) {
        // Thread exit: shared objects outlive the thread
        if let Some(global) = self.global {
            while let Some(idle) = self.objects.pop_front() {
                global.push(idle);
            }
        }
    }
}

thread_local! {
    static LOCAL_CACHES: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// `None` during thread teardown, or if the cache is already borrowed
fn with_local_cache<T: PoolTraits, R>(f: impl FnOnce(&mut LocalCache<T>) -> R) -> Option<R> {
    LOCAL_CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            let cache = caches
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Box::new(LocalCache::<T>::new()));
            cache.downcast_mut::<LocalCache<T>>().map(f)
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    static CREATED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Local {
        dirty: bool,
    }

    impl PoolTraits for Local {
        const POOL_TYPE: PoolType = PoolType::ThreadLocal;
        const HIGH_WATER_MARK: usize = 4;

        fn create() -> Box<Self> {
            CREATED.fetch_add(1, Ordering::Relaxed);
            Box::default()
        }

        fn on_put(obj: &mut Self) {
            obj.dirty = false;
        }
    }

    #[test]
    fn test_thread_local_reuse() {
        let mut a = get::<Local>();
        a.dirty = true;
        let addr = &*a as *const Local;
        put(a);
        assert_eq!(thread_cached::<Local>(), 1);

        let b = get::<Local>();
        assert_eq!(&*b as *const Local, addr);
        assert!(!b.dirty);
        assert_eq!(thread_cached::<Local>(), 0);
    }

    #[test]
    fn test_high_water_mark() {
        let objs: Vec<_> = (0..10).map(|_| get::<Local>()).collect();
        for obj in objs {
            put(obj);
        }
        assert_eq!(thread_cached::<Local>(), Local::HIGH_WATER_MARK);
    }

    struct Shared;

    impl PoolTraits for Shared {
        const POOL_TYPE: PoolType = PoolType::MemoryNodeShared;
        const MINIMUM_THREAD_CACHE_SIZE: usize = 2;
        const TRANSFER_BATCH_SIZE: usize = 4;

        fn create() -> Box<Self> {
            Box::new(Shared)
        }
    }

    #[test]
    fn test_shared_spills_and_refills() {
        thread::spawn(|| {
            let objs: Vec<_> = (0..7).map(|_| get::<Shared>()).collect();
            for obj in objs {
                put(obj);
            }
            // 7 > 2 + 4, one batch of 4 went global
            assert_eq!(thread_cached::<Shared>(), 3);
        })
        .join()
        .unwrap();

        // The exiting thread flushed everything to the global queue
        assert!(globally_cached::<Shared>() >= 7);

        thread::spawn(|| {
            let before = globally_cached::<Shared>();
            let _obj = get::<Shared>();
            assert_eq!(thread_cached::<Shared>(), 3);
            assert!(globally_cached::<Shared>() <= before - 4);
        })
        .join()
        .unwrap();
    }

    static DESTROYED: AtomicBool = AtomicBool::new(false);

    struct Aging;

    impl Drop for Aging {
        fn drop(&mut self) {
            DESTROYED.store(true, Ordering::SeqCst);
        }
    }

    impl PoolTraits for Aging {
        const POOL_TYPE: PoolType = PoolType::ThreadLocal;
        const MAX_IDLE: Duration = Duration::from_millis(10);

        fn create() -> Box<Self> {
            Box::new(Aging)
        }
    }

    #[test]
    fn test_idle_eviction() {
        put(get::<Aging>());
        thread::sleep(Duration::from_millis(30));
        assert!(!DESTROYED.load(Ordering::SeqCst));

        // Next return evicts the stale one, keeps the fresh one
        put(Box::new(Aging));
        assert!(DESTROYED.load(Ordering::SeqCst));
        assert_eq!(thread_cached::<Aging>(), 1);
    }

    static ORPHANS_DROPPED: AtomicUsize = AtomicUsize::new(0);

    struct Orphan;

    impl Drop for Orphan {
        fn drop(&mut self) {
            ORPHANS_DROPPED.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PoolTraits for Orphan {
        const POOL_TYPE: PoolType = PoolType::MemoryNodeShared;
        const MAX_IDLE: Duration = Duration::from_millis(10);
        const TRANSFER_BATCH_SIZE: usize = 4;

        fn create() -> Box<Self> {
            Box::new(Orphan)
        }
    }

    #[test]
    fn test_global_queue_idle_eviction() {
        thread::spawn(|| {
            for _ in 0..3 {
                put(Box::new(Orphan));
            }
        })
        .join()
        .unwrap();
        assert_eq!(globally_cached::<Orphan>(), 3);

        thread::sleep(Duration::from_millis(30));
        thread::spawn(|| {
            put(Box::new(Orphan));
            assert_eq!(thread_cached::<Orphan>(), 1);
        })
        .join()
        .unwrap();

        assert_eq!(ORPHANS_DROPPED.load(Ordering::SeqCst), 3);
        // Only the fresh one, flushed by the second thread, is left
        assert_eq!(globally_cached::<Orphan>(), 1);
    }

    struct Off;

    impl PoolTraits for Off {
        const POOL_TYPE: PoolType = PoolType::Disabled;

        fn create() -> Box<Self> {
            Box::new(Off)
        }
    }

    #[test]
    fn test_disabled_pool() {
        put(get::<Off>());
        assert_eq!(thread_cached::<Off>(), 0);
    }
}
