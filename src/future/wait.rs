//! Blocking synchronization with asynchronous operations
//!
//! This module provides a way to wait for the result of an asynchronous
//! operation by blocking the calling thread. This synchronization mechanism is
//! easy to use and reason about, but should be used with care as the
//! unpredictable delays that it introduces can be harmful to performance.
//!
//! It must never be used on an event-loop thread: the operation being waited
//! for would most likely need that very thread to make progress.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{AsyncResult, Error, Failure};
use crate::executor::event_loop;
use super::{Future, Repr};


impl<V: Send + 'static> Future<V> {
    /// Block the calling thread until the result of the operation is known
    ///
    /// The result is returned as is, so that a failure propagates to the
    /// caller through `?`. Waiting for a pending operation from an event-loop
    /// thread fails with `Error::WouldDeadlock` instead of blocking.
    pub fn wait(self) -> AsyncResult<V> {
        // Results which are already known need no synchronization
        let cell = match self.repr {
            Repr::Ready(result) => return result,
            Repr::Pending(cell) => cell,
        };
        if event_loop::in_event_loop() && !cell.is_done() {
            return Err(Failure::from(Error::WouldDeadlock));
        }

        // Setup some shared state through which the result will come back...
        let shared = Arc::new(WaitState {
            result: Mutex::new(None),
            ready_cv: Condvar::new(),
        });
        let c_shared = shared.clone();

        // ...have the operation fill it in when done...
        cell.subscribe(Box::new(move |result| {
            *c_shared.result.lock() = Some(result);
            c_shared.ready_cv.notify_all();
        }));

        // ...and wait for that to happen
        let mut result = shared.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            shared.ready_cv.wait(&mut result);
        }
    }
}


/// State shared between a waiting thread and the operation's producer
struct WaitState<V> {
    /// Result of the operation, once known (mutex-protected)
    result: Mutex<Option<AsyncResult<V>>>,

    /// Condition variable used to notify the waiter about completion
    ready_cv: Condvar,
}


/// Unit tests
#[cfg(test)]
mod tests {
    use crate::promise::promise;
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Check that waiting blocks until another thread completes
    #[test]
    fn wait_for_other_thread() {
        let (promise, future) = promise::<&'static str>();
        let start = Instant::now();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.succeed("done");
        });
        assert_eq!(future.wait().unwrap(), "done");
        assert!(start.elapsed() >= Duration::from_millis(20));
        worker.join().unwrap();
    }

    /// Check that failures come back as errors
    #[test]
    fn wait_for_failure() {
        let (promise, future) = promise::<()>();
        promise.fail(Error::Rejected);
        let failure = future.wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
    }

    /// Check that failures propagate through `?`
    #[test]
    fn question_mark() {
        fn caller() -> AsyncResult<u32> {
            let doubled = Future::success(21).map(|x| x * 2).wait()?;
            Future::<()>::failure(Error::Rejected).wait()?;
            Ok(doubled)
        }
        assert!(caller().is_err());
    }
}
