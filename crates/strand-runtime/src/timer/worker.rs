//! Timer thread
//!
//! One OS thread polls the backend and hands every due timer to a dispatch
//! callback, then sleeps until the next deadline, capped at
//! `max_poll_interval`. Arming a timer earlier than anything queued kicks
//! the thread through its parker so it doesn't oversleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use strand_core::{kdebug, StrandResult};

use crate::parking::{Parker, PlatformParker};
use crate::timer::{ExpiredTimer, TimerBackend};

/// Timer thread settings
#[derive(Debug, Clone)]
pub struct TimerThreadConfig {
    /// Longest sleep between polls, even with nothing due
    pub max_poll_interval: Duration,
    /// Shortest sleep, keeps a near deadline from busy-spinning
    pub min_sleep: Duration,
    pub thread_name: String,
    /// `None` = platform default
    pub stack_size: Option<usize>,
}

impl Default for TimerThreadConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_millis(10),
            min_sleep: Duration::from_micros(50),
            thread_name: "strand-timer".into(),
            stack_size: None,
        }
    }
}

/// State shared between the timer thread and its handle
struct Shared {
    shutdown: AtomicBool,
    parker: PlatformParker,
}

/// Running timer thread
pub struct TimerThreadHandle {
    handle: Option<JoinHandle<TimerStats>>,
    shared: Arc<Shared>,
}

impl TimerThreadHandle {
    /// Make the thread poll now
    pub fn kick(&self) {
        self.shared.parker.unpark();
    }

    pub fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.kick();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it, `None` if it panicked
    pub fn shutdown(mut self) -> Option<TimerStats> {
        self.request_shutdown();
        self.handle.take().and_then(|h| h.join().ok())
    }
}

/// Counters returned by a stopped timer thread
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    pub poll_count: u64,
    pub timers_fired: u64,
    /// Time spent polling and dispatching
    pub busy_time: Duration,
    pub max_batch_size: usize,
}

/// Start the timer thread
///
/// `dispatch` receives every due timer; it runs on the timer thread and
/// must not block.
pub fn spawn_timer_thread<F>(
    backend: Arc<dyn TimerBackend>,
    dispatch: F,
    config: TimerThreadConfig,
) -> StrandResult<TimerThreadHandle>
where
    F: Fn(ExpiredTimer) + Send + 'static,
{
    let shared = Arc::new(Shared {
        shutdown: AtomicBool::new(false),
        parker: PlatformParker::new(),
    });

    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let thread_shared = shared.clone();
    let handle = builder.spawn(move || timer_loop(backend, dispatch, thread_shared, config))?;

    Ok(TimerThreadHandle {
        handle: Some(handle),
        shared,
    })
}

fn timer_loop<F>(
    backend: Arc<dyn TimerBackend>,
    dispatch: F,
    shared: Arc<Shared>,
    config: TimerThreadConfig,
) -> TimerStats
where
    F: Fn(ExpiredTimer),
{
    kdebug!("{} started ({} backend)", config.thread_name, backend.name());
    let mut stats = TimerStats::default();

    while !shared.shutdown.load(Ordering::Acquire) {
        let poll_start = Instant::now();

        let expired = backend.poll_expired(poll_start);
        let batch_size = expired.len();
        stats.poll_count += 1;
        stats.timers_fired += batch_size as u64;
        stats.max_batch_size = stats.max_batch_size.max(batch_size);

        for timer in expired {
            dispatch(timer);
        }
        stats.busy_time += poll_start.elapsed();

        let sleep = calculate_sleep(backend.as_ref(), &config);
        if !sleep.is_zero() {
            shared.parker.park(Some(sleep));
        }
    }

    kdebug!("{} exiting after {} polls", config.thread_name, stats.poll_count);
    stats
}

#[inline]
fn calculate_sleep(backend: &dyn TimerBackend, config: &TimerThreadConfig) -> Duration {
    match backend.next_deadline() {
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                Duration::ZERO
            } else {
                (deadline - now)
                    .min(config.max_poll_interval)
                    .max(config.min_sleep)
            }
        }
        None => config.max_poll_interval,
    }
}
