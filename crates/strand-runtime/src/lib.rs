//! # strand-runtime
//!
//! Reference runtime for strand's fiber-local and execution-local storage.
//!
//! This crate provides:
//! - Fibers on pooled carrier threads, with per-fiber parking
//!   (futex on Linux, `Mutex`/`Condvar` elsewhere)
//! - Fiber-local storage (`TrivialFiberLocal`, `FiberLocal`)
//! - Execution contexts and execution-local storage
//! - Fiber-aware waitables: `Event`, `OneshotTimedEvent`, `Latch`, `FiberMutex`
//! - Continuation-style `Future`/`Promise` and blocking adapters
//! - Timers whose callbacks run in the arming execution context
//! - Ordered work queues
//! - A type-keyed object pool with intrusive `RefPtr`

pub mod config;
pub mod parking;
pub mod fiber;
pub mod tls;
pub mod scheduler;
pub mod fiber_local;
pub mod waitable;
pub mod mutex;
pub mod object_pool;
pub mod execution_context;
pub mod future;
pub mod blocking;
pub mod async_task;
pub mod timer;
pub mod work_queue;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::{Fiber, FiberWaker};
pub use scheduler::{
    current_waker, global_scheduler, init_global_scheduler, park_current,
    shutdown_global_scheduler, sleep_for, sleep_until, spawn, try_spawn, yield_now, Scheduler,
};
pub use tls::{current_fiber_id, is_in_fiber};
pub use fiber_local::{FiberLocal, TrivialFiberLocal};
pub use waitable::{Event, Latch, OneshotTimedEvent};
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use object_pool::{PoolTraits, PoolType, RefCount, RefCounted, RefPtr};
pub use execution_context::{with_execution_context_if_present, ExecutionContext, ExecutionLocal};
pub use future::{when_all, Future, Promise};
pub use blocking::{blocking_get, blocking_try_get, blocking_try_get_for};
pub use async_task::{spawn_async, try_spawn_async};
pub use timer::{
    kill_timer, set_detached_timer, set_periodic_timer, set_timer, TimerHandle, TimerKiller,
};
pub use work_queue::WorkQueue;
