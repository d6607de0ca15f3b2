//! Timers
//!
//! Callbacks armed here run on a fresh fiber once their deadline passes,
//! inside the execution context that was current when they were armed. This
//! is how execution-local state follows a task across a delayed step.
//!
//! # Architecture
//!
//! ```text
//!     set_timer / set_periodic_timer / set_detached_timer / kill_timer
//!                           │
//!                           ▼
//!               ┌───────────────────────┐
//!               │   dyn TimerBackend    │   HeapTimerBackend
//!               └───────────────────────┘
//!                           │ poll_expired()
//!                           ▼
//!                     timer thread ──► spawn(callback) on a new fiber
//! ```
//!
//! The timer thread is started on first use and lives for the rest of the
//! process.

mod entry;
pub mod impls;
mod worker;

pub use entry::{ExpiredTimer, TimerCallback, TimerEntry, TimerHandle, TimerType};
pub use impls::{create_backend, TimerBackendType};
pub use worker::{spawn_timer_thread, TimerStats, TimerThreadConfig, TimerThreadHandle};

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use strand_core::{kerror, kinfo, kwarn, SpinLock};

use crate::execution_context::{with_execution_context_if_present, ExecutionContext};
use crate::scheduler::{global_scheduler, panic_message, Scheduler};

/// Timer storage, shared by the timer thread and arming callers
pub trait TimerBackend: Send + Sync {
    fn insert(&self, entry: TimerEntry) -> TimerHandle;

    /// Kill a timer, `false` if it isn't armed (fired, or already killed)
    ///
    /// A killed callback never starts, one that is already running is not
    /// interrupted.
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Remove and return everything due at `now`
    ///
    /// Periodic entries are re-armed under the same handle.
    fn poll_expired(&self, now: Instant) -> Vec<ExpiredTimer>;

    /// Earliest queued deadline, if any
    fn next_deadline(&self) -> Option<Instant>;

    /// Number of armed timers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str {
        "unknown"
    }
}

struct TimerService {
    backend: Arc<dyn TimerBackend>,
    thread: TimerThreadHandle,
}

static SERVICE: OnceLock<TimerService> = OnceLock::new();

fn service() -> &'static TimerService {
    SERVICE.get_or_init(|| {
        let config = global_scheduler().config().timer.clone();
        let backend = create_backend(TimerBackendType::default());
        let thread = match spawn_timer_thread(backend.clone(), dispatch, config) {
            Ok(thread) => thread,
            Err(e) => panic!("failed to start timer thread: {}", e),
        };
        kinfo!("timer thread started");
        TimerService { backend, thread }
    })
}

/// Runs on the timer thread
fn dispatch(timer: ExpiredTimer) {
    dispatch_on(global_scheduler(), timer);
}

/// Run a due callback on a new fiber of `scheduler`
///
/// A callback is never dropped: if the scheduler refuses the fiber (it is
/// shut down) the callback runs on a fallback thread, or on the timer thread
/// itself if no thread can be started.
fn dispatch_on(scheduler: &'static Scheduler, timer: ExpiredTimer) {
    let ExpiredTimer { handle, run } = timer;
    // Each attempt takes the callback out of the slot only once it runs, so
    // a refused attempt leaves it in place.
    let slot = Arc::new(SpinLock::new(Some(run)));

    let take = slot.clone();
    let spawned = scheduler.spawn(move || {
        if let Some(run) = take.lock().take() {
            run();
        }
    });
    let err = match spawned {
        Ok(_) => return,
        Err(e) => e,
    };
    kwarn!("{}: {}, running on a fallback thread", handle, err);

    let take = slot.clone();
    let fallback = thread::Builder::new()
        .name("strand-timer-fallback".into())
        .spawn(move || run_guarded(handle, &take));
    if let Err(e) = fallback {
        kerror!("{}: no fallback thread ({}), running inline", handle, e);
        run_guarded(handle, &slot);
    }
}

fn run_guarded(handle: TimerHandle, slot: &SpinLock<Option<Box<dyn FnOnce() + Send>>>) {
    let run = match slot.lock().take() {
        Some(run) => run,
        None => return,
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(run)) {
        kerror!("{} panicked: {}", handle, panic_message(payload.as_ref()));
    }
}

fn arm(entry: TimerEntry) -> TimerHandle {
    let svc = service();
    let deadline = entry.deadline;
    let earliest = svc.backend.next_deadline().map_or(true, |next| deadline < next);
    let handle = svc.backend.insert(entry);
    if earliest {
        svc.thread.kick();
    }
    handle
}

/// Wrap `f` to run inside the current execution context
fn in_current_context<F, R>(f: F) -> impl FnOnce() -> R + Send + 'static
where
    F: FnOnce() -> R + Send + 'static,
{
    let ctx = ExecutionContext::capture();
    move || with_execution_context_if_present(ctx.as_deref(), f)
}

/// Run `f` once at `at`
#[must_use = "an unused handle can't kill the timer, use set_detached_timer"]
pub fn set_timer<F>(at: Instant, f: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    arm(TimerEntry::oneshot(at, in_current_context(f)))
}

/// Run `f` at `at` and then every `interval` until killed
///
/// # Panics
///
/// If `interval` is zero.
#[must_use = "a periodic timer runs until killed"]
pub fn set_periodic_timer<F>(at: Instant, interval: Duration, f: F) -> TimerHandle
where
    F: Fn() + Send + Sync + 'static,
{
    assert!(!interval.is_zero(), "periodic timer interval must be non-zero");
    let ctx = ExecutionContext::capture();
    arm(TimerEntry::periodic(at, interval, move || {
        with_execution_context_if_present(ctx.as_deref(), &f)
    }))
}

/// Run `f` once at `at`, no way to kill it
pub fn set_detached_timer<F>(at: Instant, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let _ = arm(TimerEntry::oneshot(at, in_current_context(f)));
}

/// Kill an armed timer, `false` if it already fired or was killed
pub fn kill_timer(handle: TimerHandle) -> bool {
    service().backend.cancel(handle)
}

/// Kills its timer when dropped
#[derive(Debug, Default)]
pub struct TimerKiller {
    handle: Option<TimerHandle>,
}

impl TimerKiller {
    pub fn new(handle: TimerHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Kill the current timer (if any) and take over `handle`
    pub fn reset(&mut self, handle: Option<TimerHandle>) {
        if let Some(old) = std::mem::replace(&mut self.handle, handle) {
            kill_timer(old);
        }
    }

    /// Give up ownership without killing
    pub fn release(&mut self) -> Option<TimerHandle> {
        self.handle.take()
    }
}

impl Drop for TimerKiller {
    fn drop(&mut self) {
        self.reset(None);
    }
}
