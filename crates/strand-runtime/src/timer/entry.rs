//! Timer entry and handle types

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-unique timer identifier, used to kill a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    #[inline]
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What happens after a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Fires once and is forgotten
    Oneshot,
    /// Re-armed `interval` after each firing until killed
    Periodic { interval: Duration },
}

impl TimerType {
    #[inline]
    pub fn is_periodic(&self) -> bool {
        matches!(self, TimerType::Periodic { .. })
    }
}

/// User callback of a timer
pub enum TimerCallback {
    Once(Box<dyn FnOnce() + Send>),
    Repeat(Arc<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for TimerCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerCallback::Once(_) => f.write_str("Once(..)"),
            TimerCallback::Repeat(_) => f.write_str("Repeat(..)"),
        }
    }
}

/// Armed timer, owned by a backend until it fires or is killed
#[derive(Debug)]
pub struct TimerEntry {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub timer_type: TimerType,
    pub callback: TimerCallback,
}

impl TimerEntry {
    pub fn oneshot(deadline: Instant, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            handle: TimerHandle::next(),
            deadline,
            timer_type: TimerType::Oneshot,
            callback: TimerCallback::Once(Box::new(f)),
        }
    }

    /// First firing at `deadline`, then every `interval`
    pub fn periodic(
        deadline: Instant,
        interval: Duration,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            handle: TimerHandle::next(),
            deadline,
            timer_type: TimerType::Periodic { interval },
            callback: TimerCallback::Repeat(Arc::new(f)),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Split a due entry into the work to run now and, for periodic
    /// timers, the entry re-armed under the same handle
    pub fn fire(self, now: Instant) -> (ExpiredTimer, Option<TimerEntry>) {
        match (self.callback, self.timer_type) {
            (TimerCallback::Once(f), _) => (
                ExpiredTimer {
                    handle: self.handle,
                    run: f,
                },
                None,
            ),
            (TimerCallback::Repeat(f), TimerType::Periodic { interval }) => {
                let run = f.clone();
                let next = TimerEntry {
                    handle: self.handle,
                    // Never re-arm in the past, a late tick must not burst.
                    deadline: (self.deadline + interval).max(now),
                    timer_type: self.timer_type,
                    callback: TimerCallback::Repeat(f),
                };
                (
                    ExpiredTimer {
                        handle: self.handle,
                        run: Box::new(move || run()),
                    },
                    Some(next),
                )
            }
            (TimerCallback::Repeat(f), TimerType::Oneshot) => (
                ExpiredTimer {
                    handle: self.handle,
                    run: Box::new(move || f()),
                },
                None,
            ),
        }
    }
}

/// Due timer handed to the dispatcher
pub struct ExpiredTimer {
    pub handle: TimerHandle,
    pub run: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for ExpiredTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiredTimer").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handle_uniqueness() {
        let handles: Vec<_> = (0..1000).map(|_| TimerHandle::next()).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(handles.len(), unique.len());
    }

    #[test]
    fn test_oneshot_fires_once() {
        let now = Instant::now();
        let entry = TimerEntry::oneshot(now, || {});
        assert!(entry.is_expired(now));
        let handle = entry.handle;

        let (expired, next) = entry.fire(now);
        assert_eq!(expired.handle, handle);
        assert!(next.is_none());
    }

    #[test]
    fn test_periodic_rearms_with_same_handle() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let entry = TimerEntry::periodic(start, interval, || {
            RUNS.fetch_add(1, Ordering::SeqCst);
        });
        let handle = entry.handle;

        let (expired, next) = entry.fire(start);
        (expired.run)();
        let next = next.unwrap();
        assert_eq!(next.handle, handle);
        assert_eq!(next.deadline, start + interval);

        // Fired long after its deadline, next tick is not in the past
        let late = start + Duration::from_secs(5);
        let (expired, next) = next.fire(late);
        (expired.run)();
        assert_eq!(next.unwrap().deadline, late);
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }
}
