//! Basic strand example
//!
//! A request context follows its task into async continuations, a timer
//! callback and a work queue item.
//!
//! # Environment Variables
//!
//! - `STRAND_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `STRAND_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use strand::{
    blocking_get, blocking_try_get_for, current_fiber_id, kinfo, set_detached_timer, spawn_async,
    when_all, ExecutionContext, ExecutionLocal, FiberLocal, Runtime, RuntimeConfig, StrandResult,
    WorkQueue,
};

/// Per-request id, shared by every fiber working on the request
static REQUEST_ID: ExecutionLocal<AtomicU64> = ExecutionLocal::new();

/// Per-fiber scratch counter
static STEPS: FiberLocal<std::cell::Cell<u32>> = FiberLocal::new();

// STRAND_LOG_LEVEL=debug STRAND_FLUSH_EPRINT=1 cargo run -p strand-basic
fn main() -> StrandResult<()> {
    println!("=== strand Basic Example ===\n");

    let config = RuntimeConfig::from_env().debug_logging(true);
    let mut runtime = Runtime::new(config)?;

    runtime.block_on(|| -> StrandResult<()> {
        for request in 1..=3u64 {
            let ctx = ExecutionContext::create();
            ctx.execute(|| handle_request(request))?;
        }
        Ok(())
    })?;

    println!("\n=== Example Complete ===");
    Ok(())
}

fn handle_request(request: u64) -> StrandResult<()> {
    REQUEST_ID.with(|id| id.store(request, Ordering::Relaxed));
    let start = Instant::now();

    // Fan out: each part runs on its own fiber in the same context
    let parts = (0..3)
        .map(|part| {
            spawn_async(move || {
                STEPS.with(|s| s.set(s.get() + 1));
                let id = REQUEST_ID.with(|id| id.load(Ordering::Relaxed));
                format!("request {} part {} on fiber {}", id, part, current_fiber_id())
            })
        })
        .collect();
    for line in blocking_get(when_all(parts)) {
        println!("  {}", line);
    }

    // Delayed step
    let (tx, rx) = mpsc::channel();
    set_detached_timer(Instant::now() + Duration::from_millis(20), move || {
        let _ = tx.send(REQUEST_ID.with(|id| id.load(Ordering::Relaxed)));
    });
    let fired = rx.recv_timeout(Duration::from_secs(5)).ok();
    println!("  timer saw request {:?}", fired);

    // Ordered side effects
    let queue = WorkQueue::new();
    for step in 0..3 {
        let ctx = ExecutionContext::capture();
        queue.push(move || {
            strand::with_execution_context_if_present(ctx.as_deref(), || {
                let id = REQUEST_ID.with(|id| id.load(Ordering::Relaxed));
                kinfo!("request {} audit step {}", id, step);
            })
        })?;
    }
    queue.stop();
    queue.join();

    let slow = spawn_async(|| {
        strand::sleep_for(Duration::from_secs(1));
    });
    let finished = blocking_try_get_for(slow, Duration::from_millis(50)).is_some();
    println!("  slow step finished in time: {}", finished);

    println!("request {} done in {:?}", request, start.elapsed());
    Ok(())
}
