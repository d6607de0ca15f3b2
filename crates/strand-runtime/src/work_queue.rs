//! Ordered work queue served by a dedicated fiber
//!
//! Items run one at a time in the order they were admitted. An item that
//! blocks (sleeps, waits on a future) only delays the items behind it in
//! the same queue.
//!
//! ```ignore
//! let queue = WorkQueue::new();
//! queue.push(|| flush_log())?;
//! queue.stop();
//! queue.join();
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use strand_core::{kerror, SpinLock, StrandError, StrandResult};

use crate::fiber::FiberWaker;
use crate::scheduler::{current_waker, panic_message, park_current, try_spawn};
use crate::waitable::Event;

type WorkItem = Box<dyn FnOnce() + Send>;

struct QueueState {
    pending: VecDeque<WorkItem>,
    stopped: bool,
    /// Worker waker, present while the worker is parked on an empty queue
    parked_worker: Option<FiberWaker>,
}

struct Shared {
    state: SpinLock<QueueState>,
    /// Set by the worker right before it exits
    done: Event,
}

impl Shared {
    fn next_item(&self, waker: &FiberWaker) -> Option<Option<WorkItem>> {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(item) => Some(Some(item)),
            None if state.stopped => None,
            None => {
                state.parked_worker = Some(waker.clone());
                Some(None)
            }
        }
    }
}

/// Single-consumer FIFO of closures
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Create a queue and start its worker fiber
    ///
    /// # Panics
    ///
    /// If the worker fiber cannot be spawned; see [`WorkQueue::try_new`].
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(queue) => queue,
            Err(e) => panic!("failed to start work queue: {}", e),
        }
    }

    pub fn try_new() -> StrandResult<Self> {
        let shared = Arc::new(Shared {
            state: SpinLock::new(QueueState {
                pending: VecDeque::new(),
                stopped: false,
                parked_worker: None,
            }),
            done: Event::new(),
        });

        let worker = shared.clone();
        try_spawn(move || worker_loop(&worker))?;
        Ok(Self { shared })
    }

    /// Queue `f` behind everything pushed so far
    ///
    /// Never runs `f` inline. Fails with `QueueStopped` after `stop`.
    pub fn push<F>(&self, f: F) -> StrandResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(StrandError::QueueStopped);
            }
            state.pending.push_back(Box::new(f));
            state.parked_worker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Close the queue; the worker drains what was already pushed, then exits
    pub fn stop(&self) {
        let waker = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.parked_worker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wait until the worker has run every accepted item and exited
    ///
    /// Only returns after `stop` has been called, by anyone.
    pub fn join(&self) {
        self.shared.done.wait();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Items waiting to run (the one running now excluded)
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkQueue")
            .field("pending", &state.pending.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    let waker = current_waker();
    while let Some(next) = shared.next_item(&waker) {
        match next {
            Some(item) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item)) {
                    kerror!("work queue item panicked: {}", panic_message(&*payload));
                }
            }
            None => {
                park_current(None);
            }
        }
    }
    shared.done.set();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_task::spawn_async;
    use crate::blocking::blocking_get;
    use crate::scheduler::{sleep_for, spawn};
    use crate::waitable::Latch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::{Duration, Instant};

    #[test]
    fn test_push_is_async_and_items_run_serially() {
        let queue = WorkQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        for _ in 0..10 {
            let counter = counter.clone();
            queue
                .push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep_for(Duration::from_millis(100));
                })
                .unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));

        queue.stop();
        queue.join();
        assert!(start.elapsed() >= Duration::from_millis(950));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_push_after_stop_rejected() {
        let queue = WorkQueue::new();
        queue.stop();
        assert!(queue.is_stopped());
        assert_eq!(queue.push(|| {}), Err(StrandError::QueueStopped));
        queue.join();
    }

    #[test]
    fn test_join_from_fiber() {
        let (tx, rx) = mpsc::channel();
        spawn(move || {
            let queue = WorkQueue::new();
            let ran = Arc::new(AtomicUsize::new(0));
            let r = ran.clone();
            queue.push(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            queue.stop();
            queue.join();
            tx.send(ran.load(Ordering::SeqCst)).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn test_panicking_item_does_not_stop_worker() {
        let queue = WorkQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        queue.push(|| panic!("bad item")).unwrap();
        let r = ran.clone();
        queue.push(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        queue.stop();
        queue.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_per_pusher() {
        const PUSHERS: usize = 4;
        const ITEMS: usize = 200;

        let queue = Arc::new(WorkQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let latch = Arc::new(Latch::new(PUSHERS));

        for pusher in 0..PUSHERS {
            let queue = queue.clone();
            let seen = seen.clone();
            let latch = latch.clone();
            spawn(move || {
                for seq in 0..ITEMS {
                    let seen = seen.clone();
                    queue.push(move || seen.lock().unwrap().push((pusher, seq))).unwrap();
                }
                latch.count_down(1);
            });
        }

        assert!(latch.wait_for(Duration::from_secs(10)));
        queue.stop();
        queue.join();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), PUSHERS * ITEMS);
        let mut next = [0usize; PUSHERS];
        for &(pusher, seq) in seen.iter() {
            assert_eq!(seq, next[pusher], "pusher {} out of order", pusher);
            next[pusher] += 1;
        }
    }

    #[test]
    fn test_stress_nested_blocking() {
        const FIBERS: usize = 32;
        const ITEMS: usize = 20;

        let executed = Arc::new(AtomicUsize::new(0));
        let latch = Arc::new(Latch::new(FIBERS));

        for _ in 0..FIBERS {
            let executed = executed.clone();
            let latch = latch.clone();
            spawn(move || {
                let queue = WorkQueue::new();
                for _ in 0..ITEMS {
                    let executed = executed.clone();
                    queue
                        .push(move || {
                            let v = blocking_get(spawn_async(|| 1usize));
                            executed.fetch_add(v, Ordering::SeqCst);
                        })
                        .unwrap();
                }
                queue.stop();
                queue.join();
                latch.count_down(1);
            });
        }

        assert!(latch.wait_for(Duration::from_secs(60)));
        assert_eq!(executed.load(Ordering::SeqCst), FIBERS * ITEMS);
    }
}
