//! Running closures asynchronously inside the caller's execution context

use std::panic::{self, AssertUnwindSafe};

use strand_core::StrandResult;

use crate::execution_context::{with_execution_context_if_present, ExecutionContext};
use crate::future::{Future, Promise};
use crate::scheduler::try_spawn;

/// Run `f` on a new fiber, returning a future of its result
///
/// The execution context current at the call, if any, is current while `f`
/// runs. A panic in `f` is carried by the future.
///
/// # Panics
///
/// If the fiber cannot be spawned; see [`try_spawn_async`].
pub fn spawn_async<R, F>(f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    match try_spawn_async(f) {
        Ok(future) => future,
        Err(e) => panic!("failed to spawn async task: {}", e),
    }
}

pub fn try_spawn_async<R, F>(f: F) -> StrandResult<Future<R>>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let mut promise = Promise::new();
    let future = promise.get_future();
    let ctx = ExecutionContext::capture();

    try_spawn(move || {
        let result = with_execution_context_if_present(ctx.as_deref(), || {
            panic::catch_unwind(AssertUnwindSafe(f))
        });
        promise.set_result(result);
    })?;
    Ok(future)
}
