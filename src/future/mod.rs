//! Consumer side of asynchronous operations
//!
//! A `Future` is the read end of an asynchronous operation. It lets a client
//! schedule code to be executed once the operation's result is known, either
//! directly through `on_result`, or by deriving new futures from it with the
//! combinators of this module. Blocking until the result is available is also
//! possible through `wait`, but should be used sparingly.
//!
//! Futures are single-consumer: registering a callback, deriving another
//! future or waiting all consume the future. If several parties need the
//! result, they must agree on who subscribes and fan the result out.
//!
//! Callbacks run on whichever thread completes the operation, or inline on
//! the subscribing thread if the result was already known. This makes
//! chaining cheap, but means that callbacks should be short. Long-running work
//! belongs on a scheduler, see `fork_join`.

mod combinators;
mod wait;

use std::fmt;
use std::sync::Arc;

use crate::cancel::{Cancel, CancelHandle};
use crate::error::{AsyncResult, Failure};
use crate::promise::{perform, SharedCell};
use crate::state::Action;


/// Handle to the eventual result of an asynchronous operation
#[must_use = "dropping a future discards the result of its operation"]
pub struct Future<V> {
    /// Either an already known result, or a link to a completion cell
    repr: Repr<V>,
}


/// Internal representation of futures
enum Repr<V> {
    /// Pre-resolved operation, which never needs a completion cell
    Ready(AsyncResult<V>),

    /// Operation completed through a `Promise`
    Pending(Arc<SharedCell<V>>),
}


impl<V: Send + 'static> Future<V> {
    /// Future of an operation which already succeeded
    pub fn success(value: V) -> Self {
        Future { repr: Repr::Ready(Ok(value)) }
    }

    /// Future of an operation which already failed
    pub fn failure(failure: impl Into<Failure>) -> Self {
        Future { repr: Repr::Ready(Err(failure.into())) }
    }

    /// Future of an operation whose result is already known
    pub fn from_result(result: AsyncResult<V>) -> Self {
        Future { repr: Repr::Ready(result) }
    }

    /// Future backed by a completion cell
    pub(crate) fn pending(cell: Arc<SharedCell<V>>) -> Self {
        Future { repr: Repr::Pending(cell) }
    }

    /// Schedule a callback to be run once the result is known
    ///
    /// If the result is already known, the callback runs right away on the
    /// calling thread. Otherwise it runs on the thread which completes the
    /// operation. A cancelled operation yields an `Error::Cancelled` failure.
    pub fn on_result<F>(self, callback: F)
        where F: FnOnce(AsyncResult<V>) + Send + 'static
    {
        match self.repr {
            Repr::Ready(result) => {
                perform(Action::<V, F, fn(bool)>::Deliver(callback, result))
            },
            Repr::Pending(cell) => cell.subscribe(Box::new(callback)),
        }
    }

    /// Schedule a callback to be run if the operation succeeds
    pub fn on_success<F>(self, callback: F)
        where F: FnOnce(V) + Send + 'static
    {
        self.on_result(move |result| {
            if let Ok(value) = result {
                callback(value);
            }
        });
    }

    /// Schedule a callback to be run if the operation fails
    pub fn on_failure<F>(self, callback: F)
        where F: FnOnce(Failure) + Send + 'static
    {
        self.on_result(move |result| {
            if let Err(failure) = result {
                callback(failure);
            }
        });
    }

    /// Request the cancellation of the operation
    ///
    /// The request travels upstream through the chain of combinators which
    /// produced this future, down to the promise at its origin, whose cancel
    /// hook gets a chance to interrupt the underlying work. Returns whether
    /// the operation was cancelled by this call, which is never the case for
    /// completed or pre-resolved operations.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        match &self.repr {
            Repr::Ready(_) => false,
            Repr::Pending(cell) => cell.cancel(may_interrupt_if_running),
        }
    }

    /// Check whether the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => false,
            Repr::Pending(cell) => cell.is_cancelled(),
        }
    }

    /// Check whether the operation reached a final state
    pub fn is_done(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => true,
            Repr::Pending(cell) => cell.is_done(),
        }
    }

    /// Weak handle which can cancel this operation later on
    ///
    /// The handle stays valid after the future itself has been consumed, and
    /// becomes inert once the operation is completed.
    pub fn cancel_handle(&self) -> CancelHandle {
        match &self.repr {
            Repr::Ready(_) => CancelHandle::inert(),
            Repr::Pending(cell) => cell.cancel_handle(),
        }
    }
}
//
impl Future<()> {
    /// Future of an operation which already succeeded without a value
    pub fn done() -> Self {
        Future::success(())
    }
}
//
impl<V: Send + 'static> From<AsyncResult<V>> for Future<V> {
    fn from(result: AsyncResult<V>) -> Self {
        Future::from_result(result)
    }
}
//
impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.repr {
            Repr::Ready(Ok(_)) => "succeeded",
            Repr::Ready(Err(_)) => "failed",
            Repr::Pending(_) => "pending",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::promise::promise;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Check that pre-resolved futures deliver inline, without scheduling
    #[test]
    fn pre_resolved() {
        let calls = Arc::new(AtomicUsize::new(0));

        let c_calls = calls.clone();
        Future::success(3).on_success(move |value| {
            assert_eq!(value, 3);
            c_calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let c_calls = calls.clone();
        Future::<u8>::failure(Error::Rejected).on_failure(move |failure| {
            assert!(failure.is::<Error>());
            c_calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        let done = Future::done();
        assert!(done.is_done());
        assert!(!done.cancel(true));
        assert!(!done.is_cancelled());
        assert!(!done.cancel_handle().cancel(true));
        assert_eq!(done.wait().unwrap(), ());
    }

    /// Check the status queries of promise-backed futures
    #[test]
    fn status() {
        let (promise, future) = promise::<u8>();
        assert!(!future.is_done());
        assert!(!future.is_cancelled());
        promise.succeed(1);
        assert!(future.is_done());
        assert!(!future.cancel(false));
        assert_eq!(future.wait().unwrap(), 1);
    }

    /// Check that success-only and failure-only callbacks filter results
    #[test]
    fn filtered_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c_calls = calls.clone();
        Future::<u8>::failure(Error::Rejected)
            .on_success(move |_| { c_calls.fetch_add(1, Ordering::Relaxed); });
        let c_calls = calls.clone();
        Future::success(1u8)
            .on_failure(move |_| { c_calls.fetch_add(1, Ordering::Relaxed); });
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    /// Check that a cancel handle outlives the future it was taken from
    #[test]
    fn detached_cancellation() {
        let (promise, future) = promise::<u8>();
        let handle = future.cancel_handle();
        let mapped = future.map(|x| x + 1);
        assert!(handle.cancel(false));
        assert!(promise.is_cancelled());
        assert!(mapped.wait().unwrap_err().is_cancelled());
    }

    /// Check the debug representation
    #[test]
    fn debug() {
        assert_eq!(format!("{:?}", Future::success(1)),
                   "Future { state: \"succeeded\" }");
        let (_promise, future) = promise::<u8>();
        assert_eq!(format!("{:?}", future), "Future { state: \"pending\" }");
    }
}
