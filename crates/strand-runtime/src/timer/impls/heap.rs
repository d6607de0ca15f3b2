//! BinaryHeap-based timer backend
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Kill: O(1) (lazy, the entry stays in the heap until it surfaces)
//! - Poll expired: O(k log n) where k = number of due entries
//! - Next deadline: O(1)
//!
//! # Cancellation
//!
//! Live handles are kept in a set. Killing a timer only removes its handle;
//! a heap entry whose handle is no longer live is dropped when popped.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::timer::{ExpiredTimer, TimerBackend, TimerEntry, TimerHandle};

/// Min-heap ordering by deadline, ties broken by arming order
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.handle.cmp(&self.0.handle))
    }
}

#[derive(Default)]
struct HeapInner {
    heap: BinaryHeap<HeapEntry>,
    live: HashSet<TimerHandle>,
    total_inserted: u64,
    total_fired: u64,
    total_killed: u64,
}

/// BinaryHeap-based timer backend
///
/// ```ignore
/// let backend = HeapTimerBackend::new();
/// let handle = backend.insert(TimerEntry::oneshot(deadline, || kinfo!("tick")));
/// backend.cancel(handle);
/// ```
#[derive(Default)]
pub struct HeapTimerBackend {
    inner: Mutex<HeapInner>,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        // Callbacks never run under the lock, poisoning can't leave a
        // half-updated heap behind.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> HeapTimerStats {
        let inner = self.lock();
        HeapTimerStats {
            live: inner.live.len(),
            queued: inner.heap.len(),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_killed: inner.total_killed,
        }
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = self.lock();
        inner.live.insert(handle);
        inner.heap.push(HeapEntry(entry));
        inner.total_inserted += 1;
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.lock();
        let killed = inner.live.remove(&handle);
        if killed {
            inner.total_killed += 1;
        }
        // Nothing live left: every queued entry is a killed one.
        let doomed = if inner.live.is_empty() {
            std::mem::take(&mut inner.heap)
        } else {
            BinaryHeap::new()
        };
        drop(inner);
        drop(doomed);
        killed
    }

    fn poll_expired(&self, now: Instant) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();
        let mut rearmed = Vec::new();
        let mut doomed = Vec::new();

        let mut inner = self.lock();
        while inner.heap.peek().map_or(false, |top| top.0.is_expired(now)) {
            let Some(HeapEntry(entry)) = inner.heap.pop() else {
                break;
            };
            if !inner.live.contains(&entry.handle) {
                doomed.push(entry);
                continue;
            }
            let (due, next) = entry.fire(now);
            match next {
                Some(next) => rearmed.push(HeapEntry(next)),
                None => {
                    inner.live.remove(&due.handle);
                }
            }
            inner.total_fired += 1;
            expired.push(due);
        }
        inner.heap.extend(rearmed);
        drop(inner);

        // Killed callbacks may own arbitrary state, drop it unlocked.
        drop(doomed);
        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        // May report a killed entry, which only costs one early poll.
        self.lock().heap.peek().map(|e| e.0.deadline)
    }

    fn len(&self) -> usize {
        self.lock().live.len()
    }

    fn name(&self) -> &'static str {
        "binary_heap"
    }
}

/// Counters of a `HeapTimerBackend`
#[derive(Debug, Clone)]
pub struct HeapTimerStats {
    /// Armed and not killed
    pub live: usize,
    /// Heap entries, killed ones included
    pub queued: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_killed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn run_all(expired: Vec<ExpiredTimer>) -> usize {
        let n = expired.len();
        for timer in expired {
            (timer.run)();
        }
        n
    }

    #[test]
    fn test_insert_and_poll() {
        let backend = HeapTimerBackend::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        backend.insert(TimerEntry::oneshot(Instant::now(), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(backend.len(), 1);

        let fired = run_all(backend.poll_expired(Instant::now() + Duration::from_millis(1)));
        assert_eq!(fired, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_deadline_order() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (n, ms) in [(3, 30), (1, 10), (2, 20)] {
            let order = order.clone();
            backend.insert(TimerEntry::oneshot(now + Duration::from_millis(ms), move || {
                order.lock().unwrap().push(n);
            }));
        }

        assert_eq!(backend.next_deadline(), Some(now + Duration::from_millis(10)));
        run_all(backend.poll_expired(now + Duration::from_millis(50)));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_not_yet_due() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();
        backend.insert(TimerEntry::oneshot(now + Duration::from_secs(60), || {}));
        assert!(backend.poll_expired(now).is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let backend = HeapTimerBackend::new();
        let keep = backend.insert(TimerEntry::oneshot(Instant::now(), || {}));
        let kill =
            backend.insert(TimerEntry::oneshot(Instant::now(), || panic!("killed timer ran")));

        assert!(backend.cancel(kill));
        assert!(!backend.cancel(kill));
        assert_eq!(backend.len(), 1);

        let expired = backend.poll_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, keep);
        run_all(expired);

        // Already fired
        assert!(!backend.cancel(keep));
    }

    #[test]
    fn test_periodic_until_killed() {
        let backend = HeapTimerBackend::new();
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let handle = backend.insert(TimerEntry::periodic(start, interval, || {}));

        assert_eq!(run_all(backend.poll_expired(start)), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(run_all(backend.poll_expired(start + interval)), 1);
        assert_eq!(backend.len(), 1);

        assert!(backend.cancel(handle));
        assert!(backend.poll_expired(start + interval * 10).is_empty());
        assert_eq!(backend.stats().queued, 0);
    }

    #[test]
    fn test_stats() {
        let backend = HeapTimerBackend::new();
        backend.insert(TimerEntry::oneshot(Instant::now(), || {}));
        let later =
            backend.insert(TimerEntry::oneshot(Instant::now() + Duration::from_secs(10), || {}));

        run_all(backend.poll_expired(Instant::now() + Duration::from_millis(1)));
        backend.cancel(later);

        let stats = backend.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_killed, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.queued, 0);
    }
}
