//! # strand - fiber-local storage and execution contexts
//!
//! Thread-local-like variables for code running on fibers, scoped either to
//! one fiber or to one logical task that may hop between fibers and carrier
//! threads, plus the blocking and queueing utilities such tasks are built
//! from.
//!
//! ## Features
//!
//! - **Fiber locals**: `TrivialFiberLocal` (one word, lock-free) and
//!   `FiberLocal` (any `Default` type, lazily built per fiber)
//! - **Execution contexts**: `ExecutionContext::execute` installs a task's
//!   context, `ExecutionLocal` values follow it into `spawn_async`
//!   continuations and timer callbacks
//! - **Blocking bridge**: `blocking_get` / `blocking_try_get` park only the
//!   calling fiber
//! - **Work queues**: ordered, single-consumer, served by a dedicated fiber
//! - **Timers**: callbacks on fresh fibers, killable by handle
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{blocking_get, spawn_async, ExecutionContext, ExecutionLocal, Runtime};
//! use std::sync::Mutex;
//!
//! static USER: ExecutionLocal<Mutex<String>> = ExecutionLocal::new();
//!
//! fn main() -> strand::StrandResult<()> {
//!     let mut runtime = Runtime::new(Default::default())?;
//!     runtime.block_on(|| {
//!         let ctx = ExecutionContext::create();
//!         ctx.execute(|| {
//!             USER.with(|u| *u.lock().unwrap() = "alice".into());
//!             let seen = blocking_get(spawn_async(|| USER.with(|u| u.lock().unwrap().clone())));
//!             assert_eq!(seen, "alice");
//!         });
//!     });
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │   FiberLocal, ExecutionLocal, WorkQueue, blocking_get       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Execution contexts (pooled, ref-counted)           │
//! │       current-context pointer kept in fiber-local slot      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Carrier  │      │  Carrier  │      │   Timer   │
//!    │  Thread   │      │  Thread   │      │   Thread  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   Fiber entity: inline + overflow local-storage slots   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use strand_core::{FiberId, StrandError, StrandResult, TrivialValue};

// Re-export kprint macros for debug logging
pub use strand_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use strand_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel,
};

// Re-export env utilities
pub use strand_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use strand_runtime::{
    blocking_get, blocking_try_get, blocking_try_get_for, current_fiber_id, current_waker,
    is_in_fiber, kill_timer, set_detached_timer, set_periodic_timer, set_timer, sleep_for,
    sleep_until, spawn, spawn_async, try_spawn, try_spawn_async, when_all,
    with_execution_context_if_present, yield_now, Event, ExecutionContext, ExecutionLocal,
    FiberLocal, FiberMutex, FiberMutexGuard, FiberWaker, Future, Latch, OneshotTimedEvent,
    Promise, RefPtr, RuntimeConfig, Scheduler, TimerHandle, TimerKiller, TrivialFiberLocal,
    WorkQueue,
};

use strand_runtime::scheduler;

/// Handle on the process-wide scheduler
///
/// Only one `Runtime` can be created per process. Without one, the
/// scheduler is started lazily from the environment on first spawn.
pub struct Runtime {
    scheduler: &'static Scheduler,
}

impl Runtime {
    /// Start the global scheduler with `config`
    ///
    /// Fails if the configuration is invalid or the scheduler was already
    /// started, explicitly or by an earlier spawn.
    pub fn new(config: RuntimeConfig) -> StrandResult<Self> {
        strand_core::kprint::init();
        if config.debug_logging {
            config.print();
        }
        let scheduler = scheduler::init_global_scheduler(config)?;
        kinfo!("strand runtime started");
        Ok(Self { scheduler })
    }

    pub fn scheduler(&self) -> &'static Scheduler {
        self.scheduler
    }

    /// Run `f`, then shut the runtime down
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let result = f();
        self.shutdown();
        result
    }

    /// Run `f` on a fiber and wait for its result
    ///
    /// Unlike `block_on`, `f` sees fiber-local storage of its own fiber.
    pub fn run<F, T>(&self, f: F) -> StrandResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let future = try_spawn_async(f)?;
        Ok(blocking_get(future))
    }

    /// Stop accepting new fibers; running ones finish on their own
    pub fn shutdown(&mut self) {
        if !self.scheduler.is_shutdown() {
            self.scheduler.shutdown();
            kinfo!("strand runtime shut down");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
