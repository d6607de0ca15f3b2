//! Waiting on futures from fibers
//!
//! These park only the calling fiber. Called from a plain OS thread they
//! block that thread, which is fine for tests and `main`.
//!
//! A producer panic is resumed on the waiting fiber.

use std::panic;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strand_core::SpinLock;

use crate::future::Future;
use crate::waitable::{Event, OneshotTimedEvent};

struct Rendezvous<T> {
    event: Event,
    receiver: SpinLock<Option<thread::Result<T>>>,
}

/// Block the calling fiber until `future` is satisfied
pub fn blocking_get<T: Send + 'static>(future: Future<T>) -> T {
    let shared = Arc::new(Rendezvous {
        event: Event::new(),
        receiver: SpinLock::new(None),
    });

    let producer = shared.clone();
    future.on_complete(move |result| {
        *producer.receiver.lock() = Some(result);
        producer.event.set();
    });

    shared.event.wait();
    // `set` happened after the receiver was filled.
    let result = shared.receiver.lock().take();
    match result {
        Some(Ok(value)) => value,
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => unreachable!("event set without a result"),
    }
}

struct TimedRendezvous<T> {
    event: OneshotTimedEvent,
    receiver: SpinLock<Option<thread::Result<T>>>,
}

/// Like [`blocking_get`], giving up at `deadline`
///
/// On timeout the continuation stays attached; when the future is satisfied
/// later its value is dropped.
pub fn blocking_try_get<T: Send + 'static>(future: Future<T>, deadline: Instant) -> Option<T> {
    let shared = Arc::new(TimedRendezvous {
        event: OneshotTimedEvent::new(deadline),
        receiver: SpinLock::new(None),
    });

    let producer = shared.clone();
    future.on_complete(move |result| {
        let mut receiver = producer.receiver.lock();
        *receiver = Some(result);
        producer.event.set();
    });

    shared.event.wait();
    let result = shared.receiver.lock().take();
    match result {
        Some(Ok(value)) => Some(value),
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => None,
    }
}

pub fn blocking_try_get_for<T: Send + 'static>(future: Future<T>, timeout: Duration) -> Option<T> {
    blocking_try_get(future, Instant::now() + timeout)
}
