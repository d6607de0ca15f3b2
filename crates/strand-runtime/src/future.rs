//! Continuation-style future and promise
//!
//! A `Future<T>` is consumed by attaching exactly one continuation, which
//! runs once the matching `Promise<T>` is satisfied: inline on the thread
//! that attaches it if the value is already there, otherwise on whoever
//! calls `set_value`. Nothing here blocks; see the `blocking` module for
//! waiting on a result from a fiber.
//!
//! Results travel as `std::thread::Result<T>`, so a panic in a producer
//! reaches the consumer as a payload it can resume.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use strand_core::SpinLock;

type Continuation<T> = Box<dyn FnOnce(thread::Result<T>) + Send>;

enum State<T> {
    /// Nothing yet, maybe a continuation waiting for the value
    Pending(Option<Continuation<T>>),
    /// Value arrived before any continuation
    Ready(thread::Result<T>),
    /// Value handed to the continuation
    Consumed,
}

struct Core<T> {
    state: SpinLock<State<T>>,
}

impl<T> Core<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(State::Pending(None)),
        })
    }

    fn complete(&self, result: thread::Result<T>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Pending(Some(cont)) => {
                drop(state);
                cont(result);
            }
            State::Pending(None) => *state = State::Ready(result),
            State::Ready(_) | State::Consumed => unreachable!("promise satisfied twice"),
        }
    }

    fn attach(&self, cont: Continuation<T>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Ready(result) => {
                drop(state);
                cont(result);
            }
            State::Pending(None) => *state = State::Pending(Some(cont)),
            State::Pending(Some(_)) | State::Consumed => {
                unreachable!("future continued twice")
            }
        }
    }

    fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), State::Ready(_))
    }
}

/// Producer side
pub struct Promise<T: Send + 'static> {
    core: Option<Arc<Core<T>>>,
    future: Option<Future<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        let core = Core::new();
        Self {
            future: Some(Future { core: core.clone() }),
            core: Some(core),
        }
    }

    /// The consumer side; can be taken once
    ///
    /// # Panics
    ///
    /// On a second call.
    pub fn get_future(&mut self) -> Future<T> {
        self.future.take().expect("future already taken from this promise")
    }

    pub fn set_value(self, value: T) {
        self.set_result(Ok(value));
    }

    /// Satisfy the promise with a panic payload
    pub fn set_panic(self, payload: Box<dyn Any + Send>) {
        self.set_result(Err(payload));
    }

    pub(crate) fn set_result(mut self, result: thread::Result<T>) {
        if let Some(core) = self.core.take() {
            core.complete(result);
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.complete(Err(Box::new("promise dropped without a value")));
        }
    }
}

/// Consumer side
#[must_use = "a future does nothing unless continued or waited on"]
pub struct Future<T: Send + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + 'static> Future<T> {
    /// Already satisfied future
    pub fn ready(value: T) -> Self {
        let core = Core::new();
        core.complete(Ok(value));
        Self { core }
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Attach the continuation, receiving the value or a panic payload
    ///
    /// `f` runs exactly once: right here if the future is already
    /// satisfied, otherwise inside `Promise::set_value`.
    pub fn on_complete(self, f: impl FnOnce(thread::Result<T>) + Send + 'static) {
        self.core.attach(Box::new(f));
    }

    /// Transform the value
    ///
    /// A panic in `f` or in the producer propagates to the returned future.
    pub fn map<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mut promise = Promise::new();
        let mapped = promise.get_future();
        self.on_complete(move |result| {
            let result = result.and_then(|v| panic::catch_unwind(AssertUnwindSafe(|| f(v))));
            promise.set_result(result);
        });
        mapped
    }

    /// Chain another asynchronous step
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let mut promise = Promise::new();
        let chained = promise.get_future();
        self.on_complete(move |result| {
            match result.and_then(|v| panic::catch_unwind(AssertUnwindSafe(|| f(v)))) {
                Ok(next) => next.on_complete(move |r| promise.set_result(r)),
                Err(payload) => promise.set_panic(payload),
            }
        });
        chained
    }
}

impl<T: Send + 'static> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").field("ready", &self.is_ready()).finish()
    }
}

/// Future of every value, in input order
///
/// The first panic payload wins; remaining results are dropped.
pub fn when_all<T: Send + 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    if futures.is_empty() {
        return Future::ready(Vec::new());
    }

    struct Gather<T: Send + 'static> {
        slots: SpinLock<Vec<Option<T>>>,
        remaining: AtomicUsize,
        promise: SpinLock<Option<Promise<Vec<T>>>>,
    }

    impl<T: Send + 'static> Gather<T> {
        fn finish(&self, result: thread::Result<Vec<T>>) {
            let promise = self.promise.lock().take();
            if let Some(promise) = promise {
                promise.set_result(result);
            }
        }
    }

    let mut promise = Promise::new();
    let all = promise.get_future();
    let gather = Arc::new(Gather {
        slots: SpinLock::new((0..futures.len()).map(|_| None).collect()),
        remaining: AtomicUsize::new(futures.len()),
        promise: SpinLock::new(Some(promise)),
    });

    for (i, fut) in futures.into_iter().enumerate() {
        let gather = gather.clone();
        fut.on_complete(move |result| match result {
            Ok(value) => {
                gather.slots.lock()[i] = Some(value);
                if gather.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = std::mem::take(&mut *gather.slots.lock())
                        .into_iter()
                        .flatten()
                        .collect();
                    gather.finish(Ok(values));
                }
            }
            Err(payload) => gather.finish(Err(payload)),
        });
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_ready_runs_inline() {
        let (tx, rx) = mpsc::channel();
        Future::ready(7).on_complete(move |r| tx.send(r.ok()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Some(7));
    }

    #[test]
    fn test_continuation_runs_on_set() {
        let mut promise = Promise::new();
        let (tx, rx) = mpsc::channel();
        let fut = promise.get_future();
        assert!(!fut.is_ready());
        fut.map(|v: u32| v * 2).on_complete(move |r| tx.send(r.ok()).unwrap());
        assert!(rx.try_recv().is_err());

        promise.set_value(21);
        assert_eq!(rx.try_recv().unwrap(), Some(42));
    }

    #[test]
    fn test_set_from_other_thread() {
        let mut promise = Promise::new();
        let fut = promise.get_future();
        let (tx, rx) = mpsc::channel();
        fut.on_complete(move |r| tx.send(r.ok()).unwrap());

        std::thread::spawn(move || promise.set_value(String::from("far")));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("far")
        );
    }

    #[test]
    fn test_then_chains() {
        let (tx, rx) = mpsc::channel();
        Future::ready(3)
            .then(|v| Future::ready(v + 1))
            .map(|v| v * 10)
            .on_complete(move |r| tx.send(r.ok()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Some(40));
    }

    #[test]
    fn test_panic_propagates() {
        let (tx, rx) = mpsc::channel();
        Future::ready(1)
            .map(|_: i32| -> i32 { panic!("boom") })
            .map(|v| v + 1)
            .on_complete(move |r| tx.send(r.is_err()).unwrap());
        assert!(rx.try_recv().unwrap());
    }

    #[test]
    fn test_dropped_promise_breaks_future() {
        let mut promise = Promise::<u8>::new();
        let fut = promise.get_future();
        drop(promise);
        assert!(fut.is_ready());
        let (tx, rx) = mpsc::channel();
        fut.on_complete(move |r| tx.send(r.is_err()).unwrap());
        assert!(rx.try_recv().unwrap());
    }

    #[test]
    fn test_when_all_keeps_order() {
        let mut promises: Vec<Promise<usize>> = (0..4).map(|_| Promise::new()).collect();
        let futures = promises.iter_mut().map(Promise::get_future).collect();
        let (tx, rx) = mpsc::channel();
        when_all(futures).on_complete(move |r| tx.send(r.ok()).unwrap());

        for (i, p) in promises.into_iter().enumerate().rev() {
            assert!(rx.try_recv().is_err());
            p.set_value(i);
        }
        assert_eq!(rx.try_recv().unwrap(), Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_when_all_empty() {
        assert!(when_all(Vec::<Future<u8>>::new()).is_ready());
    }
}
