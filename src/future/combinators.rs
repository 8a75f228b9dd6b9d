//! Combinators deriving new futures from existing ones
//!
//! Every combinator consumes its input future and returns a new one, which
//! keeps a weak back-reference to its input so that cancellation requests can
//! travel upstream. User functions passed to combinators are run on whichever
//! thread delivers the input's result, and a panic in one of them turns into an
//! `Error::Panicked` failure of the derived future.
//!
//! All combinators are built on top of two primitives: `transform`, which
//! computes the derived result synchronously, and `compose`, which derives
//! another future from the result and adopts it.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{catching, AsyncResult, Failure};
use crate::executor::{Scheduler, SchedulerExt};
use crate::promise::promise;
use super::{Future, Repr};


impl<V: Send + 'static> Future<V> {
    /// Derive a future whose result is computed from this one's result
    pub fn transform<U, F>(self, f: F) -> Future<U>
        where U: Send + 'static,
              F: FnOnce(AsyncResult<V>) -> AsyncResult<U> + Send + 'static
    {
        match self.repr {
            // Known results are transformed right away, on the calling thread
            Repr::Ready(result) => {
                Future::from_result(catching(move || f(result)).and_then(|r| r))
            },

            // Others go through a new completion cell, whose cancellation is
            // forwarded to the current one
            Repr::Pending(cell) => {
                let (promise, future) = promise();
                let upstream = cell.cancel_handle();
                promise.set_cancel_hook(move |may_interrupt| {
                    upstream.cancel(may_interrupt);
                });
                cell.subscribe(Box::new(move |result| {
                    promise.complete(catching(move || f(result)).and_then(|r| r));
                }));
                future
            },
        }
    }

    /// Derive a future from this one's result, and adopt it
    ///
    /// Until this future's result is known, cancelling the derived future
    /// cancels this one. Afterwards, it cancels the adopted future instead.
    pub fn compose<U, F>(self, f: F) -> Future<U>
        where U: Send + 'static,
              F: FnOnce(AsyncResult<V>) -> Future<U> + Send + 'static
    {
        match self.repr {
            Repr::Ready(result) => match catching(move || f(result)) {
                Ok(next) => next,
                Err(failure) => Future::failure(failure),
            },

            Repr::Pending(cell) => {
                let (promise, future) = promise();

                // Cancellation targets whichever future is currently live
                let live = Arc::new(Mutex::new(cell.cancel_handle()));
                let hook_live = live.clone();
                promise.set_cancel_hook(move |may_interrupt| {
                    let target = hook_live.lock().clone();
                    target.cancel(may_interrupt);
                });

                cell.subscribe(Box::new(move |result| {
                    let next = match catching(move || f(result)) {
                        Ok(next) => next,
                        Err(failure) => return promise.fail(failure),
                    };

                    // Switch the cancellation target, then make sure that we
                    // did not miss a cancellation request while switching
                    *live.lock() = next.cancel_handle();
                    if let Some(may_interrupt) = promise.cancellation() {
                        next.cancel(may_interrupt);
                    }

                    next.on_result(move |result| promise.complete(result));
                }));
                future
            },
        }
    }

    /// Apply a function to the value of a successful operation
    ///
    /// If the function panics, the derived future fails. Failures of this
    /// future are propagated unchanged.
    pub fn map<U, F>(self, f: F) -> Future<U>
        where U: Send + 'static,
              F: FnOnce(V) -> U + Send + 'static
    {
        self.transform(move |result| result.map(f))
    }

    /// Apply a fallible function to the value of a successful operation
    pub fn try_map<U, E, F>(self, f: F) -> Future<U>
        where U: Send + 'static,
              E: Into<Failure>,
              F: FnOnce(V) -> Result<U, E> + Send + 'static
    {
        self.transform(move |result| result.and_then(|v| f(v).map_err(Into::into)))
    }

    /// Chain another asynchronous operation after a successful one
    pub fn flat_map<U, F>(self, f: F) -> Future<U>
        where U: Send + 'static,
              F: FnOnce(V) -> Future<U> + Send + 'static
    {
        self.compose(move |result| match result {
            Ok(value) => f(value),
            Err(failure) => Future::failure(failure),
        })
    }

    /// Recover from failures whose cause is of kind `E`
    ///
    /// Other failures, and successes, are passed through untouched.
    pub fn map_catch<E, F>(self, f: F) -> Future<V>
        where E: StdError + 'static,
              F: FnOnce(Failure) -> V + Send + 'static
    {
        self.transform(move |result| match result {
            Err(failure) if failure.is::<E>() => Ok(f(failure)),
            other => other,
        })
    }

    /// Asynchronously recover from failures whose cause is of kind `E`
    pub fn flat_map_catch<E, F>(self, f: F) -> Future<V>
        where E: StdError + 'static,
              F: FnOnce(Failure) -> Future<V> + Send + 'static
    {
        self.compose(move |result| match result {
            Err(failure) if failure.is::<E>() => f(failure),
            other => Future::from_result(other),
        })
    }

    /// Replace failures whose cause is of kind `E` by another failure
    pub fn map_fault<E, G, F>(self, f: F) -> Future<V>
        where E: StdError + 'static,
              G: Into<Failure>,
              F: FnOnce(Failure) -> G + Send + 'static
    {
        self.transform(move |result| match result {
            Err(failure) if failure.is::<E>() => Err(f(failure).into()),
            other => other,
        })
    }

    /// Replace failures whose cause is of kind `E` by a failure which is
    /// itself the result of an asynchronous operation
    ///
    /// If that operation fails, its own failure is used instead.
    pub fn flat_map_fault<E, F>(self, f: F) -> Future<V>
        where E: StdError + 'static,
              F: FnOnce(Failure) -> Future<Failure> + Send + 'static
    {
        self.compose(move |result| match result {
            Err(failure) if failure.is::<E>() => {
                f(failure).transform(|fault| Err(fault.unwrap_or_else(|e| e)))
            },
            other => Future::from_result(other),
        })
    }

    /// Run a side effect once the operation is over, whatever its outcome
    ///
    /// This is typically used for cleanup. If the side effect panics, the
    /// derived future fails: a failure of this future stays the primary cause
    /// and gets the panic attached as a suppressed failure.
    pub fn and<F>(self, f: F) -> Future<V>
        where F: FnOnce() + Send + 'static
    {
        self.transform(move |result| match (result, catching(f)) {
            (result, Ok(())) => result,
            (Ok(_), Err(side_effect)) => Err(side_effect),
            (Err(failure), Err(side_effect)) => Err(failure.with_suppressed(side_effect)),
        })
    }

    /// Delay the delivery of this future's result by some duration
    ///
    /// The delay starts once the result is known. A zero delay delivers the
    /// result right away, without involving the scheduler.
    pub fn and_delay_for<S>(self, scheduler: &Arc<S>, delay: Duration) -> Future<V>
        where S: Scheduler + ?Sized + 'static
    {
        let scheduler = scheduler.clone();
        self.compose(move |result| delay_result(&*scheduler, delay, result))
    }

    /// Delay the delivery of this future's result until some instant
    ///
    /// If that instant is already in the past when the result is known, the
    /// result is delivered right away, without involving the scheduler.
    pub fn and_delay_until<S>(self, scheduler: &Arc<S>, instant: Instant) -> Future<V>
        where S: Scheduler + ?Sized + 'static
    {
        let scheduler = scheduler.clone();
        self.compose(move |result| {
            let delay = instant.saturating_duration_since(Instant::now());
            delay_result(&*scheduler, delay, result)
        })
    }

    /// Make the operation fail with some cause, whatever its outcome
    ///
    /// An original failure is kept as a suppressed failure of the new one.
    pub fn inject_fault(self, fault: impl Into<Failure>) -> Future<V> {
        let fault = fault.into();
        self.transform(move |result| match result {
            Ok(_) => Err(fault),
            Err(original) => Err(fault.with_suppressed(original)),
        })
    }

    /// Replace the value of a successful operation with a fixed value
    pub fn put<U: Send + 'static>(self, value: U) -> Future<U> {
        self.transform(move |result| result.map(|_| value))
    }

    /// Apply a function to the value of a successful operation, on a scheduler
    ///
    /// This moves potentially long-running or untrusted code away from the
    /// thread which completes this future, typically an event-loop thread.
    pub fn fork_join<S, U, F>(self, scheduler: &Arc<S>, f: F) -> Future<U>
        where S: Scheduler + ?Sized + 'static,
              U: Send + 'static,
              F: FnOnce(V) -> U + Send + 'static
    {
        let scheduler = scheduler.clone();
        self.flat_map(move |value| scheduler.submit(move || f(value)))
    }
}


/// Deliver a known result after some delay, using a no-op scheduler wakeup
fn delay_result<S, V>(scheduler: &S, delay: Duration, result: AsyncResult<V>) -> Future<V>
    where S: Scheduler + ?Sized,
          V: Send + 'static
{
    if delay.is_zero() {
        return Future::from_result(result);
    }
    scheduler.schedule_task(delay, Box::new(|| {}))
             .transform(move |wakeup| match wakeup {
                 Ok(()) => result,
                 Err(mut failure) => {
                     if let Err(original) = result {
                         failure.add_suppressed(original);
                     }
                     Err(failure)
                 },
             })
}


/// Unit tests
#[cfg(test)]
mod tests {
    use crate::config::SchedulerConfig;
    use crate::error::Error;
    use crate::executor::pool::ThreadPoolScheduler;
    use crate::promise::promise;
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    /// Failure kind used to check kind matching
    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Refused;

    /// Another failure kind, distinct from the first one
    #[derive(Debug, thiserror::Error)]
    #[error("timed out")]
    struct TimedOut;

    /// Extract the crate-level error of a failure, if any
    fn crate_error(failure: &Failure) -> Option<&Error> {
        failure.downcast_ref::<Error>()
    }

    proptest! {
        /// `success(v).map(f)` is `success(f(v))`
        #[test]
        fn map_of_success(v in any::<i64>()) {
            let f = |x: i64| x.wrapping_mul(3).wrapping_sub(7);
            prop_assert_eq!(Future::success(v).map(f).wait().unwrap(), f(v));
        }

        /// Mapping a failure leaves it untouched
        #[test]
        fn map_of_failure(v in any::<u32>()) {
            let failure = Future::<u32>::failure(Refused)
                .map(move |x| x.wrapping_add(v))
                .wait()
                .unwrap_err();
            prop_assert!(failure.is::<Refused>());
        }
    }

    /// Check that a panicking map function fails the chain
    #[test]
    fn map_panic() {
        let failure = Future::success(1).map(|_: i32| -> i32 { panic!("nope") })
                                        .wait()
                                        .unwrap_err();
        assert!(matches!(crate_error(&failure), Some(Error::Panicked(_))));

        // Same thing when the result comes in asynchronously
        let (promise, future) = promise::<i32>();
        let mapped = future.map(|_| -> i32 { panic!("nope") });
        promise.succeed(1);
        assert!(matches!(crate_error(&mapped.wait().unwrap_err()),
                         Some(Error::Panicked(_))));
    }

    /// Check fallible mapping
    #[test]
    fn try_map() {
        let ok = Future::success("42").try_map(|s| s.parse::<u8>());
        assert_eq!(ok.wait().unwrap(), 42);
        let err = Future::success("x").try_map(|s| s.parse::<u8>());
        assert!(err.wait().unwrap_err().is::<std::num::ParseIntError>());
    }

    /// Check that flat_map chains operations and short-circuits failures
    #[test]
    fn flat_map() {
        let (first, first_future) = promise::<u32>();
        let (second, second_future) = promise::<u32>();
        let chained = first_future.flat_map(move |x| second_future.map(move |y| x + y));
        first.succeed(1);
        assert!(!chained.is_done());
        second.succeed(2);
        assert_eq!(chained.wait().unwrap(), 3);

        let called = Arc::new(AtomicBool::new(false));
        let c_called = called.clone();
        let failed = Future::<u32>::failure(Refused).flat_map(move |x| {
            c_called.store(true, Ordering::Relaxed);
            Future::success(x)
        });
        assert!(failed.wait().unwrap_err().is::<Refused>());
        assert!(!called.load(Ordering::Relaxed));
    }

    /// Cancelling a flat_map before the outer future resolves cancels it
    #[test]
    fn flat_map_cancel_outer() {
        let (outer, outer_future) = promise::<u32>();
        let supplier_called = Arc::new(AtomicBool::new(false));
        let c_called = supplier_called.clone();
        let chained = outer_future.flat_map(move |x| {
            c_called.store(true, Ordering::Relaxed);
            Future::success(x)
        });

        assert!(chained.cancel(true));
        assert!(outer.is_cancelled());
        outer.succeed(1);
        assert!(!supplier_called.load(Ordering::Relaxed));
        assert!(chained.wait().unwrap_err().is_cancelled());
    }

    /// Cancelling a flat_map after the outer future resolved cancels the inner
    #[test]
    fn flat_map_cancel_inner() {
        let (outer, outer_future) = promise::<u32>();
        let (inner, inner_future) = promise::<u32>();
        let interrupted = Arc::new(AtomicBool::new(false));
        let c_interrupted = interrupted.clone();
        inner.set_cancel_hook(move |_| c_interrupted.store(true, Ordering::Relaxed));

        let chained = outer_future.flat_map(move |_| inner_future);
        outer.succeed(1);
        assert!(chained.cancel(true));
        assert!(interrupted.load(Ordering::Relaxed));
        assert!(inner.is_cancelled());
        assert!(chained.wait().unwrap_err().is_cancelled());
    }

    /// Check that cancellation travels up a chain of combinators
    #[test]
    fn chained_cancellation() {
        let (origin, future) = promise::<u32>();
        let chain = future.map(|x| x + 1).put("x").and(|| ()).map(|s| s.len());
        assert!(chain.cancel(false));
        assert!(origin.is_cancelled());
        assert!(chain.wait().unwrap_err().is_cancelled());
    }

    /// Check that map_catch only recovers matching failure kinds
    #[test]
    fn map_catch() {
        let recovered = Future::<&str>::failure(Refused)
            .map_catch::<Refused, _>(|_| "recovered");
        assert_eq!(recovered.wait().unwrap(), "recovered");

        let mismatched = Future::<&str>::failure(TimedOut)
            .map_catch::<Refused, _>(|_| "recovered");
        assert!(mismatched.wait().unwrap_err().is::<TimedOut>());

        let untouched = Future::success("fine")
            .map_catch::<Refused, _>(|_| "recovered");
        assert_eq!(untouched.wait().unwrap(), "fine");
    }

    /// Check asynchronous recovery
    #[test]
    fn flat_map_catch() {
        let (backup, backup_future) = promise::<u8>();
        let (origin, future) = promise::<u8>();
        let recovered = future.flat_map_catch::<TimedOut, _>(move |_| backup_future);
        origin.fail(TimedOut);
        assert!(!recovered.is_done());
        backup.succeed(9);
        assert_eq!(recovered.wait().unwrap(), 9);

        let mismatched = Future::<u8>::failure(Refused)
            .flat_map_catch::<TimedOut, _>(|_| Future::success(0));
        assert!(mismatched.wait().unwrap_err().is::<Refused>());
    }

    /// Check failure translation
    #[test]
    fn map_fault() {
        let translated = Future::<()>::failure(TimedOut)
            .map_fault::<TimedOut, _, _>(|_| Refused);
        assert!(translated.wait().unwrap_err().is::<Refused>());

        let untouched = Future::<()>::failure(Refused)
            .map_fault::<TimedOut, _, _>(|_| Error::Rejected);
        assert!(untouched.wait().unwrap_err().is::<Refused>());

        let success = Future::success(5).map_fault::<TimedOut, _, _>(|_| Refused);
        assert_eq!(success.wait().unwrap(), 5);
    }

    /// Check asynchronous failure translation
    #[test]
    fn flat_map_fault() {
        let translated = Future::<()>::failure(TimedOut)
            .flat_map_fault::<TimedOut, _>(|_| Future::success(Failure::new(Refused)));
        assert!(translated.wait().unwrap_err().is::<Refused>());

        let translator_failed = Future::<()>::failure(TimedOut)
            .flat_map_fault::<TimedOut, _>(|_| Future::failure(Error::Rejected));
        let failure = translator_failed.wait().unwrap_err();
        assert!(matches!(crate_error(&failure), Some(Error::Rejected)));
    }

    /// Check that side effects run for both outcomes
    #[test]
    fn and_always_runs() {
        let runs = Arc::new(AtomicUsize::new(0));

        let c_runs = runs.clone();
        let ok = Future::success(1).and(move || { c_runs.fetch_add(1, Ordering::Relaxed); });
        assert_eq!(ok.wait().unwrap(), 1);

        let c_runs = runs.clone();
        let err = Future::<u8>::failure(Refused)
            .and(move || { c_runs.fetch_add(1, Ordering::Relaxed); });
        assert!(err.wait().unwrap_err().is::<Refused>());

        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    /// Check that a failing side effect does not hide an original failure
    #[test]
    fn and_failure_wins() {
        let failure = Future::<u8>::failure(Refused)
            .and(|| panic!("cleanup failed"))
            .wait()
            .unwrap_err();
        assert!(failure.is::<Refused>());
        assert_eq!(failure.suppressed().len(), 1);
        assert!(matches!(crate_error(&failure.suppressed()[0]),
                         Some(Error::Panicked(_))));

        let failure = Future::success(1u8)
            .and(|| panic!("cleanup failed"))
            .wait()
            .unwrap_err();
        assert!(matches!(crate_error(&failure), Some(Error::Panicked(_))));
    }

    /// Check fault injection
    #[test]
    fn inject_fault() {
        let failure = Future::success(1).inject_fault(Refused).wait().unwrap_err();
        assert!(failure.is::<Refused>());
        assert!(failure.suppressed().is_empty());

        let failure = Future::<u8>::failure(TimedOut)
            .inject_fault(Refused)
            .wait()
            .unwrap_err();
        assert!(failure.is::<Refused>());
        assert!(failure.suppressed()[0].is::<TimedOut>());
    }

    /// Check value substitution
    #[test]
    fn put() {
        assert_eq!(Future::success(1).put("one").wait().unwrap(), "one");
        assert!(Future::<u8>::failure(Refused).put("one").wait().unwrap_err().is::<Refused>());
    }

    /// Small pool used to delay results
    fn delay_pool(prefix: &str) -> Arc<ThreadPoolScheduler> {
        let config = SchedulerConfig::default()
            .with_thread_name_prefix(prefix)
            .with_max_threads(2)
            .with_grace_period(Duration::from_millis(100))
            .with_hard_timeout(Duration::from_secs(1));
        Arc::new(ThreadPoolScheduler::new(config).unwrap())
    }

    /// Check that delayed results arrive no earlier than requested
    #[test]
    fn and_delay_for() {
        let pool = delay_pool("test-delay-for");
        let start = Instant::now();
        let delayed = Future::success(1).and_delay_for(&pool, Duration::from_millis(30));
        assert_eq!(delayed.wait().unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));

        // The delay starts once the result is known, failures included
        let (promise, future) = promise::<u8>();
        let delayed = future.and_delay_for(&pool, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        let completed = Instant::now();
        promise.fail(Refused);
        assert!(delayed.wait().unwrap_err().is::<Refused>());
        assert!(completed.elapsed() >= Duration::from_millis(20));

        let start = Instant::now();
        let until = start + Duration::from_millis(20);
        assert_eq!(Future::success(2).and_delay_until(&pool, until).wait().unwrap(), 2);
        assert!(Instant::now() >= until);
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that past instants and zero delays do not involve the scheduler
    #[test]
    fn and_delay_without_scheduling() {
        let pool = delay_pool("test-delay-past");
        assert!(pool.shutdown().wait().is_ok());

        let past = Instant::now();
        thread::sleep(Duration::from_millis(1));
        assert_eq!(Future::success(2).and_delay_until(&pool, past).wait().unwrap(), 2);
        assert_eq!(Future::success(3).and_delay_for(&pool, Duration::ZERO).wait().unwrap(), 3);

        // Positive delays need the scheduler, which now rejects them
        let failure = Future::success(4)
            .and_delay_for(&pool, Duration::from_millis(10))
            .wait()
            .unwrap_err();
        assert!(matches!(crate_error(&failure), Some(Error::Rejected)));

        let failure = Future::<u8>::failure(Refused)
            .and_delay_until(&pool, Instant::now() + Duration::from_secs(1))
            .wait()
            .unwrap_err();
        assert!(matches!(crate_error(&failure), Some(Error::Rejected)));
        assert!(failure.suppressed()[0].is::<Refused>());
    }

    /// Check that chains of combinators on pending futures complete properly
    #[test]
    fn long_chain() {
        let (promise, future) = promise::<u64>();
        let mut chain = future;
        for _ in 0..100 {
            chain = chain.map(|x| x + 1);
        }
        promise.succeed(0);
        assert_eq!(chain.wait().unwrap(), 100);
    }
}
