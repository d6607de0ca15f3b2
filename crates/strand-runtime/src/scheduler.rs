//! Reference scheduler
//!
//! Fibers run to completion on pooled OS threads ("carriers"). A fiber
//! that blocks parks its carrier on the fiber's own parker and stops
//! counting against `max_carriers`, so blocked fibers never keep runnable
//! ones from starting. Finished carriers drain the ready queue, then wait on
//! an idle stack for the next spawn and retire after `carrier_idle_timeout`.
//!
//! ```text
//!   spawn(f) ──► idle stack ──pop──► Carrier (hand off f, unpark)
//!                    │
//!                    └─ empty ──► start a new carrier thread
//!                                   │
//!                                   └─ at limit ──► ready queue
//!
//!   fiber parks ──► parked += 1 ──► ready queue ──► new carriers
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use strand_core::error::{StrandError, StrandResult};
use strand_core::{kdebug, kerror, kinfo, ktrace, kwarn, FiberId, SpinLock};

use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, FiberWaker};
use crate::parking::{Parker, PlatformParker};
use crate::tls;

type FiberTask = Box<dyn FnOnce() + Send + 'static>;

/// Global scheduler instance
static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// An OS thread that runs fibers one after another
struct Carrier {
    id: usize,
    parker: PlatformParker,
    /// Next fiber, written by the spawner that popped this carrier
    task: SpinLock<Option<FiberTask>>,
}

impl Carrier {
    fn hand_off(&self, task: FiberTask) {
        *self.task.lock() = Some(task);
        self.parker.unpark();
    }
}

/// Idle carriers and fibers waiting for one, under a single lock so a
/// carrier going idle never misses a queued fiber
#[derive(Default)]
struct RunQueues {
    /// Most recently idle on top
    idle: Vec<Arc<Carrier>>,
    /// Fibers admitted while every carrier slot was busy
    ready: VecDeque<FiberTask>,
}

/// Main scheduler
pub struct Scheduler {
    config: RuntimeConfig,

    queues: SpinLock<RunQueues>,

    /// Carrier threads alive
    carriers: AtomicUsize,

    /// Carriers whose fiber is parked
    parked: AtomicUsize,

    /// Fibers spawned and not yet finished
    live_fibers: AtomicUsize,

    spawned_total: AtomicU64,
    next_carrier_id: AtomicUsize,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(config: RuntimeConfig) -> StrandResult<Self> {
        config.validate()?;
        Ok(Self::with_validated(config))
    }

    fn with_validated(config: RuntimeConfig) -> Self {
        Self {
            config,
            queues: SpinLock::new(RunQueues::default()),
            carriers: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            live_fibers: AtomicUsize::new(0),
            spawned_total: AtomicU64::new(0),
            next_carrier_id: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn a new fiber
    ///
    /// Only fails once the scheduler is shut down. When `max_carriers`
    /// carriers are busy running fibers the new fiber waits in the ready
    /// queue.
    pub fn spawn<F>(&'static self, f: F) -> StrandResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(StrandError::ShutDown);
        }

        let id = FiberId::next();
        self.live_fibers.fetch_add(1, Ordering::AcqRel);
        let task: FiberTask = Box::new(move || {
            run_fiber(self, id, f);
            self.live_fibers.fetch_sub(1, Ordering::AcqRel);
        });

        let idle = self.queues.lock().idle.pop();
        match idle {
            Some(carrier) => carrier.hand_off(task),
            None => {
                if let Err(task) = self.start_carrier(task) {
                    self.enqueue(task);
                }
            }
        }

        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Hand `task` to an idle carrier, or queue it
    fn enqueue(&self, task: FiberTask) {
        let mut queues = self.queues.lock();
        match queues.idle.pop() {
            Some(carrier) => {
                drop(queues);
                carrier.hand_off(task);
            }
            None => {
                queues.ready.push_back(task);
                ktrace!("fiber queued, {} waiting", queues.ready.len());
            }
        }
    }

    /// Carriers running a fiber that isn't parked (approximate)
    pub fn busy_carriers(&self) -> usize {
        self.carriers
            .load(Ordering::Acquire)
            .saturating_sub(self.parked.load(Ordering::Acquire))
    }

    /// Start a carrier running `first`, giving the task back if the carrier
    /// limit is reached or the OS refuses a thread
    fn start_carrier(&'static self, first: FiberTask) -> Result<(), FiberTask> {
        let alive = self.carriers.fetch_add(1, Ordering::AcqRel) + 1;
        let busy = alive.saturating_sub(self.parked.load(Ordering::Acquire));
        if busy > self.config.max_carriers {
            self.carriers.fetch_sub(1, Ordering::AcqRel);
            ktrace!("carrier limit {} reached", self.config.max_carriers);
            return Err(first);
        }

        let carrier = Arc::new(Carrier {
            id: self.next_carrier_id.fetch_add(1, Ordering::Relaxed),
            parker: PlatformParker::new(),
            task: SpinLock::new(Some(first)),
        });

        let thread_carrier = Arc::clone(&carrier);
        let spawned = thread::Builder::new()
            .name(format!("strand-carrier-{}", carrier.id))
            .stack_size(self.config.carrier_stack_size)
            .spawn(move || self.carrier_main(thread_carrier));

        if let Err(e) = spawned {
            self.carriers.fetch_sub(1, Ordering::AcqRel);
            kerror!("failed to start carrier thread: {}", e);
            // The closure never ran, the task is still in its slot.
            return match carrier.task.lock().take() {
                Some(task) => Err(task),
                None => Ok(()),
            };
        }
        Ok(())
    }

    /// Main carrier loop
    fn carrier_main(&'static self, carrier: Arc<Carrier>) {
        if self.config.debug_logging {
            kinfo!("carrier {} started", carrier.id);
        }

        let mut next = carrier.task.lock().take();
        while let Some(task) = next.take() {
            task();
            next = self.wait_for_work(&carrier);
        }

        self.carriers.fetch_sub(1, Ordering::AcqRel);
        if self.config.debug_logging {
            kinfo!("carrier {} retired", carrier.id);
        }
    }

    /// Take a queued fiber or park on the idle stack until handed one,
    /// `None` = retire
    fn wait_for_work(&self, carrier: &Arc<Carrier>) -> Option<FiberTask> {
        {
            let mut queues = self.queues.lock();
            if let Some(task) = queues.ready.pop_front() {
                return Some(task);
            }
            if self.is_shutdown() {
                return None;
            }
            queues.idle.push(Arc::clone(carrier));
        }

        let deadline = Instant::now() + self.config.carrier_idle_timeout;
        // Set once a spawner has popped us; the task is then on its way
        let mut claimed = false;
        loop {
            if let Some(task) = carrier.task.lock().take() {
                return Some(task);
            }
            if claimed {
                carrier.parker.park(None);
                continue;
            }

            let now = Instant::now();
            if now >= deadline || self.is_shutdown() {
                if self.remove_idle(carrier) {
                    return None;
                }
                claimed = true;
                continue;
            }
            carrier.parker.park(Some(deadline - now));
        }
    }

    fn remove_idle(&self, carrier: &Arc<Carrier>) -> bool {
        let mut queues = self.queues.lock();
        match queues.idle.iter().position(|c| Arc::ptr_eq(c, carrier)) {
            Some(pos) => {
                queues.idle.remove(pos);
                true
            }
            None => false,
        }
    }

    /// A fiber on one of our carriers is about to park
    ///
    /// Its carrier stops counting against the limit, queued fibers get
    /// carriers of their own.
    pub(crate) fn fiber_parking(&'static self) {
        self.parked.fetch_add(1, Ordering::AcqRel);
        loop {
            let task = match self.queues.lock().ready.pop_front() {
                Some(task) => task,
                None => return,
            };
            if let Err(task) = self.start_carrier(task) {
                self.requeue_front(task);
                return;
            }
        }
    }

    pub(crate) fn fiber_resumed(&self) {
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    fn requeue_front(&self, task: FiberTask) {
        let mut queues = self.queues.lock();
        match queues.idle.pop() {
            Some(carrier) => {
                drop(queues);
                carrier.hand_off(task);
            }
            None => queues.ready.push_front(task),
        }
    }

    /// Stop accepting fibers and let idle carriers exit
    ///
    /// Fibers already running or queued finish normally; their carriers
    /// retire afterwards.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        kdebug!("scheduler shutting down");
        for carrier in self.queues.lock().idle.iter() {
            carrier.parker.unpark();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Carrier threads currently alive
    pub fn carrier_count(&self) -> usize {
        self.carriers.load(Ordering::Relaxed)
    }

    pub fn idle_carrier_count(&self) -> usize {
        self.queues.lock().idle.len()
    }

    /// Fibers admitted but waiting for a carrier
    pub fn queued_fibers(&self) -> usize {
        self.queues.lock().ready.len()
    }

    /// Carriers whose fiber is parked
    pub fn parked_fibers(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    /// Fibers spawned and not yet finished
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::Relaxed)
    }

    pub fn spawned_total(&self) -> u64 {
        self.spawned_total.load(Ordering::Relaxed)
    }
}

/// Run one fiber to completion on the calling carrier
fn run_fiber<F: FnOnce()>(scheduler: &'static Scheduler, id: FiberId, f: F) {
    let fiber = Fiber::on_carrier(id, scheduler);
    tls::set_current_fiber(&fiber);
    strand_core::kprint::set_fiber_tag(id.as_u64());

    let result = panic::catch_unwind(AssertUnwindSafe(f));

    if let Err(payload) = result {
        kerror!("fiber panicked: {}", panic_message(payload.as_ref()));
    }

    strand_core::kprint::clear_fiber_tag();
    tls::clear_current_fiber();
    // Fiber-local values are destroyed here, outside the fiber.
    drop(fiber);
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Initialize the global scheduler
pub fn init_global_scheduler(config: RuntimeConfig) -> StrandResult<&'static Scheduler> {
    let scheduler = Scheduler::new(config)?;
    let mut installed = false;
    let global = SCHEDULER.get_or_init(|| {
        installed = true;
        scheduler
    });
    if !installed {
        return Err(StrandError::AlreadyInitialized);
    }
    kdebug!("scheduler initialized");
    Ok(global)
}

/// Get the global scheduler, initializing it from the environment if needed
pub fn global_scheduler() -> &'static Scheduler {
    SCHEDULER.get_or_init(|| {
        match Scheduler::new(RuntimeConfig::from_env()) {
            Ok(s) => s,
            Err(e) => {
                kwarn!("{}, falling back to defaults", e);
                // Library defaults always validate.
                Scheduler::with_validated(RuntimeConfig::new())
            }
        }
    })
}

/// Shutdown the global scheduler
pub fn shutdown_global_scheduler() {
    if let Some(s) = SCHEDULER.get() {
        s.shutdown();
    }
}

/// Spawn a new fiber (uses global scheduler)
///
/// # Panics
///
/// If the runtime is shut down; use [`try_spawn`] to handle that.
pub fn spawn<F>(f: F) -> FiberId
where
    F: FnOnce() + Send + 'static,
{
    global_scheduler().spawn(f).expect("failed to spawn fiber")
}

/// Spawn a new fiber, reporting failure
pub fn try_spawn<F>(f: F) -> StrandResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    global_scheduler().spawn(f)
}

/// Yield the current fiber
#[inline]
pub fn yield_now() {
    thread::yield_now();
}

/// Sleep the current fiber for `duration`
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Sleep the current fiber until `deadline`
pub fn sleep_until(deadline: Instant) {
    tls::with_current_fiber(|fiber| loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        fiber.park(Some(deadline - now));
    });
}

/// Waker for the calling fiber
pub fn current_waker() -> FiberWaker {
    tls::with_current_fiber(Fiber::waker)
}

/// Park the calling fiber until woken through its waker or `timeout`
///
/// May return spuriously; callers re-check their wake condition.
pub fn park_current(timeout: Option<Duration>) -> bool {
    tls::with_current_fiber(|fiber| fiber.park(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawn_runs_on_fiber() {
        let (tx, rx) = mpsc::channel();
        let id = spawn(move || {
            tx.send((tls::is_in_fiber(), tls::current_fiber_id())).unwrap();
        });

        let (in_fiber, seen) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(in_fiber);
        assert_eq!(seen, id);
    }

    #[test]
    fn test_many_fibers_complete() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..200 {
            let counter = counter.clone();
            let tx = tx.clone();
            spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..200 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_panicking_fiber_does_not_kill_carrier() {
        let (tx, rx) = mpsc::channel();
        spawn(|| panic!("boom"));
        spawn(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_park_and_wake_fiber() {
        let (waker_tx, waker_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let flag = Arc::new(AtomicBool::new(false));

        let flag2 = flag.clone();
        spawn(move || {
            waker_tx.send(current_waker()).unwrap();
            while !flag2.load(Ordering::Acquire) {
                park_current(None);
            }
            done_tx.send(()).unwrap();
        });

        let waker = waker_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        waker.wake();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_sleep_for() {
        let start = Instant::now();
        sleep_for(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_init_after_lazy_init_rejected() {
        let _ = global_scheduler();
        assert_eq!(
            init_global_scheduler(RuntimeConfig::new()).err(),
            Some(StrandError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_spawn_after_shutdown_rejected() {
        let sched: &'static Scheduler =
            Box::leak(Box::new(Scheduler::new(RuntimeConfig::new()).unwrap()));
        let (tx, rx) = mpsc::channel();
        sched.spawn(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        sched.shutdown();
        assert!(sched.is_shutdown());
        assert_eq!(sched.spawn(|| {}).err(), Some(StrandError::ShutDown));
    }

    fn leaked_scheduler(max_carriers: usize) -> &'static Scheduler {
        let config = RuntimeConfig::new().max_carriers(max_carriers);
        Box::leak(Box::new(Scheduler::new(config).unwrap()))
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_parked_fibers_do_not_hold_carrier_slots() {
        use crate::blocking::blocking_get;
        use crate::future::Promise;

        let sched = leaked_scheduler(2);
        let (tx, rx) = mpsc::channel();
        let mut promises = Vec::new();
        for i in 0..6u32 {
            let mut promise = Promise::new();
            let fut = promise.get_future();
            promises.push(promise);
            let tx = tx.clone();
            sched
                .spawn(move || tx.send((i, blocking_get(fut))).unwrap())
                .unwrap();
        }

        wait_until("six parked fibers", || sched.parked_fibers() == 6);
        assert!(sched.carrier_count() > 2);
        assert_eq!(sched.busy_carriers(), 0);

        // Runs although more than max_carriers fibers are blocked
        sched
            .spawn(move || {
                for (i, promise) in promises.into_iter().enumerate() {
                    promise.set_value(i as u32 * 10);
                }
            })
            .unwrap();

        let mut seen: Vec<_> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..6u32).map(|i| (i, i * 10)).collect::<Vec<_>>());
    }

    #[test]
    fn test_spawn_at_limit_queues_instead_of_failing() {
        let sched = leaked_scheduler(1);
        let release = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let hold = release.clone();
        sched
            .spawn(move || {
                // Busy, not parked: keeps the only slot
                while !hold.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            })
            .unwrap();

        for i in 0..3 {
            let tx = tx.clone();
            sched.spawn(move || tx.send(i).unwrap()).unwrap();
        }
        assert_eq!(sched.queued_fibers(), 3);
        assert_eq!(sched.carrier_count(), 1);

        release.store(true, Ordering::Release);
        let seen: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2]);
        wait_until("queue drained", || sched.queued_fibers() == 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Scheduler::new(RuntimeConfig::new().max_carriers(0)).is_err());
    }
}
