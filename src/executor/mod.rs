//! Schedulers, which run tasks on behalf of asynchronous operations
//!
//! Callbacks attached to futures run on whichever thread completes the
//! operation, which is cheap but means that they must stay short. Anything
//! longer, or anything which must happen after some delay or periodically,
//! should be handed over to a scheduler instead.
//!
//! A scheduler is anything which implements the object-safe `Scheduler`
//! trait. Two backends are provided:
//!
//! - `ThreadPoolScheduler`, a dynamically sized thread pool suitable for
//!   general-purpose, possibly blocking work.
//! - `EventLoopScheduler`, a fixed set of single-threaded reactors with
//!   thread affinity, suitable for short non-blocking work and I/O readiness.
//!
//! Schedulers are torn down through an explicit shutdown protocol, which first
//! notifies registered `ShutdownListener`s, then gives already submitted work
//! a grace period to finish, and finally waits for worker threads to exit.
//! `SharedScheduler` adds reference counting on top of that, so that a
//! scheduler shared by several owners is only shut down by the last of them.

pub mod event_loop;
mod lifecycle;
pub mod pool;
pub mod shared;
mod timer;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{catching, AsyncResult, Error, Failure};
use crate::future::Future;
use crate::promise::{promise, Promise};


/// Stand-in for delays which do not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);


/// Instant which comes some delay after `start`
///
/// Delays too large to be represented saturate to a deadline which is, for
/// all practical purposes, never reached.
pub(crate) fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start.checked_add(delay)
         .or_else(|| start.checked_add(FAR_FUTURE))
         .unwrap_or(start)
}


/// Unit of work which a scheduler runs once
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unit of work which a scheduler runs periodically
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;


/// Entry point to task scheduling
///
/// Every method which accepts work returns a future of that work's outcome.
/// If the scheduler does not accept work anymore because it is shutting down,
/// that future fails with `Error::Rejected` right away.
pub trait Scheduler: Send + Sync {
    /// Run a task as soon as possible, without tracking its outcome
    ///
    /// Panics in the task are logged, since there is nobody to report them to.
    fn execute(&self, task: Task);

    /// Run a task as soon as possible
    fn submit_task(&self, task: Task) -> Future<()>;

    /// Run a task once the given delay has elapsed
    fn schedule_task(&self, delay: Duration, task: Task) -> Future<()>;

    /// Run a task periodically, at a fixed rate
    ///
    /// The n-th run is due at `initial_delay + n * period` after this call.
    /// Runs which are late do not overlap, they happen back to back instead.
    /// The future only completes if a run panics, if the periodic task is
    /// cancelled, or if the scheduler shuts down.
    fn schedule_at_fixed_rate(&self,
                              initial_delay: Duration,
                              period: Duration,
                              task: RepeatingTask) -> Future<()>;

    /// Run a task periodically, with a fixed delay between two runs
    ///
    /// The future completes under the same conditions as for
    /// `schedule_at_fixed_rate`.
    fn schedule_with_fixed_delay(&self,
                                 initial_delay: Duration,
                                 delay: Duration,
                                 task: RepeatingTask) -> Future<()>;

    /// Register a listener to be notified when the scheduler shuts down
    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId;

    /// Unregister a shutdown listener, telling whether it was registered
    fn remove_shutdown_listener(&self, id: ListenerId) -> bool;

    /// Shut the scheduler down
    ///
    /// Shutdown listeners are notified synchronously, on the calling thread.
    /// The rest of the teardown happens in the background, and the returned
    /// future tells how it went. Shutting a scheduler down twice is a bug.
    fn shutdown(&self) -> Future<()>;

    /// Check whether shutdown has been requested
    fn is_shutting_down(&self) -> bool;
}


/// Generic conveniences available on every scheduler
pub trait SchedulerExt: Scheduler {
    /// Compute a value on the scheduler
    ///
    /// If the function panics, the resulting future fails.
    fn submit<R, F>(&self, f: F) -> Future<R>
        where R: Send + 'static,
              F: FnOnce() -> R + Send + 'static
    {
        let (task, output) = capture(f);
        self.submit_task(task).transform(move |ran| ran.and_then(|()| output()))
    }

    /// Compute a value on the scheduler, once the given delay has elapsed
    fn schedule<R, F>(&self, delay: Duration, f: F) -> Future<R>
        where R: Send + 'static,
              F: FnOnce() -> R + Send + 'static
    {
        let (task, output) = capture(f);
        self.schedule_task(delay, task)
            .transform(move |ran| ran.and_then(|()| output()))
    }
}
//
impl<S: Scheduler + ?Sized> SchedulerExt for S {}


/// Split a value-returning function into a task and a way to fetch its value
fn capture<R, F>(f: F) -> (Task, impl FnOnce() -> AsyncResult<R> + Send)
    where R: Send + 'static,
          F: FnOnce() -> R + Send + 'static
{
    let slot = Arc::new(Mutex::new(None));
    let c_slot = slot.clone();
    let task: Task = Box::new(move || *c_slot.lock() = Some(f()));
    let output = move || {
        slot.lock().take().ok_or_else(|| Failure::from(Error::ProducerDropped))
    };
    (task, output)
}


/// Party interested in the shutdown of a scheduler
///
/// Listeners get to release resources which depend on the scheduler before its
/// threads go away. A listener which returns an error, or panics, does not
/// prevent other listeners from being notified, but makes the shutdown fail.
pub trait ShutdownListener: Send + Sync {
    /// Called exactly once, when the scheduler starts shutting down
    fn on_shutdown(&self) -> Result<(), Failure>;
}
//
impl<F> ShutdownListener for F
    where F: Fn() -> Result<(), Failure> + Send + Sync
{
    fn on_shutdown(&self) -> Result<(), Failure> {
        self()
    }
}


/// Identifier of a registered shutdown listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);


/// Verdict of a backend about a piece of work
pub(crate) enum Admission {
    /// The work should run now
    Run,

    /// The backend is shutting down and discards the work
    Rejected,
}


/// Work as handled by scheduler backends
///
/// Work is always invoked exactly once, either to run it or to tell it that it
/// was rejected, so that the associated promise is always completed.
pub(crate) type Work = Box<dyn FnOnce(Admission) + Send + 'static>;


/// Low-level interface which scheduler backends implement
///
/// The shared logic of the `Scheduler` trait is implemented on top of it.
pub(crate) trait Dispatch: Send + Sync + 'static {
    /// Queue work to be run as soon as possible, or give it back if rejected
    fn dispatch(&self, work: Work) -> Result<(), Work>;

    /// Queue work to be run at some deadline, or give it back if rejected
    fn dispatch_at(&self, deadline: Instant, work: Work) -> Result<(), Work>;
}


/// Shared implementation of `Scheduler::execute`
pub(crate) fn execute_via<D: Dispatch + ?Sized>(backend: &D, task: Task) {
    let work: Work = Box::new(move |admission| match admission {
        Admission::Run => {
            if let Err(failure) = catching(task) {
                tracing::warn!(%failure, "fire-and-forget task panicked");
            }
        },
        Admission::Rejected => {
            tracing::debug!("fire-and-forget task rejected by shut down scheduler");
        },
    });
    if let Err(work) = backend.dispatch(work) {
        work(Admission::Rejected);
    }
}

/// Shared implementation of `Scheduler::submit_task`
pub(crate) fn submit_via<D: Dispatch + ?Sized>(backend: &D, task: Task) -> Future<()> {
    let (promise, future) = promise();
    if let Err(work) = backend.dispatch(tracked(promise, task)) {
        work(Admission::Rejected);
    }
    future
}

/// Shared implementation of `Scheduler::schedule_task`
pub(crate) fn schedule_via<D: Dispatch + ?Sized>(backend: &D,
                                                 delay: Duration,
                                                 task: Task) -> Future<()> {
    let (promise, future) = promise();
    if let Err(work) = backend.dispatch_at(deadline_after(Instant::now(), delay),
                                           tracked(promise, task)) {
        work(Admission::Rejected);
    }
    future
}

/// Turn a task into work whose outcome completes a promise
///
/// Tasks whose future was cancelled before their turn came are skipped.
fn tracked(promise: Promise<()>, task: Task) -> Work {
    Box::new(move |admission| match admission {
        Admission::Run if promise.is_cancelled() => {},
        Admission::Run => promise.complete(catching(task)),
        Admission::Rejected => promise.fail(Error::Rejected),
    })
}


/// Spacing between two runs of a periodic task
#[derive(Clone, Copy, Debug)]
pub(crate) enum Cadence {
    /// Runs are due at regular intervals, regardless of their duration
    FixedRate(Duration),

    /// Each run is due some time after the previous one finished
    FixedDelay(Duration),
}

/// Shared implementation of the periodic scheduling methods
pub(crate) fn schedule_periodic_via<D: Dispatch>(backend: &Arc<D>,
                                                 initial_delay: Duration,
                                                 cadence: Cadence,
                                                 task: RepeatingTask) -> Future<()> {
    let (promise, future) = promise();
    Periodic {
        backend: Arc::downgrade(backend),
        promise,
        task,
        cadence,
        deadline: deadline_after(Instant::now(), initial_delay),
    }.arm();
    future
}


/// State of a periodic task between two runs
struct Periodic<D> {
    /// Backend which runs the task (weak to avoid keeping it alive)
    backend: Weak<D>,

    /// Promise which is completed once the task stops running
    promise: Promise<()>,

    /// Task to be run
    task: RepeatingTask,

    /// Spacing between runs
    cadence: Cadence,

    /// Time at which the next run is due
    deadline: Instant,
}
//
impl<D: Dispatch> Periodic<D> {
    /// Queue the next run of the task
    fn arm(self) {
        let Some(backend) = self.backend.upgrade() else {
            return self.promise.fail(Error::Rejected);
        };
        let deadline = self.deadline;
        let work: Work = Box::new(move |admission| self.fire(admission));
        if let Err(work) = backend.dispatch_at(deadline, work) {
            work(Admission::Rejected);
        }
    }

    /// Run the task once, then queue the next run
    fn fire(mut self, admission: Admission) {
        match admission {
            Admission::Rejected => return self.promise.fail(Error::Rejected),
            Admission::Run if self.promise.is_cancelled() => return,
            Admission::Run => {},
        }

        let task = &mut self.task;
        if let Err(failure) = catching(|| task()) {
            return self.promise.fail(failure);
        }

        self.deadline = match self.cadence {
            Cadence::FixedRate(period) => deadline_after(self.deadline, period),
            Cadence::FixedDelay(delay) => deadline_after(Instant::now(), delay),
        };
        self.arm();
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend which runs work inline, or rejects it once closed
    struct Inline {
        closed: AtomicBool,
        delayed: Mutex<Vec<Work>>,
        deadlines: Mutex<Vec<Instant>>,
    }
    //
    impl Inline {
        fn new() -> Arc<Self> {
            Arc::new(Inline {
                closed: AtomicBool::new(false),
                delayed: Mutex::new(Vec::new()),
                deadlines: Mutex::new(Vec::new()),
            })
        }

        /// Run every piece of delayed work, as if its deadline had passed
        fn tick(&self) {
            let delayed = std::mem::take(&mut *self.delayed.lock());
            for work in delayed {
                work(Admission::Run);
            }
        }
    }
    //
    impl Dispatch for Inline {
        fn dispatch(&self, work: Work) -> Result<(), Work> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(work);
            }
            work(Admission::Run);
            Ok(())
        }

        fn dispatch_at(&self, deadline: Instant, work: Work) -> Result<(), Work> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(work);
            }
            self.deadlines.lock().push(deadline);
            self.delayed.lock().push(work);
            Ok(())
        }
    }

    /// Check that submitted tasks report their outcome
    #[test]
    fn submit() {
        let backend = Inline::new();
        assert!(submit_via(&*backend, Box::new(|| {})).wait().is_ok());

        let failure = submit_via(&*backend, Box::new(|| panic!("oops")))
            .wait()
            .unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(),
                         Some(Error::Panicked(_))));

        backend.closed.store(true, Ordering::Relaxed);
        let failure = submit_via(&*backend, Box::new(|| {})).wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
    }

    /// Check that fire-and-forget panics do not escape
    #[test]
    fn execute_panic() {
        let backend = Inline::new();
        execute_via(&*backend, Box::new(|| panic!("nobody listens")));
        backend.closed.store(true, Ordering::Relaxed);
        execute_via(&*backend, Box::new(|| {}));
    }

    /// Check that tasks cancelled before their deadline are skipped
    #[test]
    fn cancelled_before_deadline() {
        let backend = Inline::new();
        let ran = Arc::new(AtomicBool::new(false));
        let c_ran = ran.clone();
        let future = schedule_via(&*backend, Duration::from_secs(1), Box::new(move || {
            c_ran.store(true, Ordering::Relaxed);
        }));
        assert!(future.cancel(false));
        backend.tick();
        assert!(!ran.load(Ordering::Relaxed));
        assert!(future.wait().unwrap_err().is_cancelled());
    }

    /// Check that periodic tasks run until they panic
    #[test]
    fn periodic_until_panic() {
        let backend = Inline::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let c_runs = runs.clone();
        let future = schedule_periodic_via(
            &backend,
            Duration::ZERO,
            Cadence::FixedRate(Duration::from_millis(1)),
            Box::new(move || {
                if c_runs.fetch_add(1, Ordering::Relaxed) == 2 {
                    panic!("third run fails");
                }
            })
        );
        for _ in 0..5 {
            backend.tick();
        }
        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert!(matches!(future.wait().unwrap_err().downcast_ref::<Error>(),
                         Some(Error::Panicked(_))));
    }

    /// Check that periodic tasks stop on rejection and on cancellation
    #[test]
    fn periodic_stops() {
        let backend = Inline::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let c_runs = runs.clone();
        let future = schedule_periodic_via(
            &backend,
            Duration::ZERO,
            Cadence::FixedDelay(Duration::from_millis(1)),
            Box::new(move || { c_runs.fetch_add(1, Ordering::Relaxed); })
        );
        backend.tick();
        backend.closed.store(true, Ordering::Relaxed);
        backend.tick();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        let failure = future.wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));

        let backend = Inline::new();
        let future = schedule_periodic_via(
            &backend,
            Duration::ZERO,
            Cadence::FixedRate(Duration::from_millis(1)),
            Box::new(|| {})
        );
        backend.tick();
        assert!(future.cancel(false));
        backend.tick();
        assert!(backend.delayed.lock().is_empty());
        assert!(future.wait().unwrap_err().is_cancelled());
    }

    /// Check that delays too large for the clock saturate instead of panicking
    #[test]
    fn deadline_saturation() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(1)),
                   now + Duration::from_secs(1));
        assert!(deadline_after(now, Duration::MAX) > now + FAR_FUTURE / 2);

        let backend = Inline::new();
        let delayed = schedule_via(&*backend, Duration::MAX, Box::new(|| {}));
        let periodic = schedule_periodic_via(&backend,
                                             Duration::ZERO,
                                             Cadence::FixedRate(Duration::MAX),
                                             Box::new(|| {}));
        assert!(!delayed.is_done());
        backend.tick();
        backend.tick();
        assert!(delayed.wait().is_ok());
        assert!(!periodic.is_done());
        assert_eq!(backend.deadlines.lock().len(), 4);

        backend.closed.store(true, Ordering::Relaxed);
        backend.tick();
        let failure = periodic.wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
    }

    /// Check that late fixed-rate runs keep their schedule and become due
    #[test]
    fn fixed_rate_catch_up() {
        let backend = Inline::new();
        let period = Duration::from_millis(10);
        let future = schedule_periodic_via(
            &backend,
            period,
            Cadence::FixedRate(period),
            Box::new(|| std::thread::sleep(Duration::from_millis(15)))
        );
        for _ in 0..3 {
            backend.tick();
        }

        let deadlines = backend.deadlines.lock().clone();
        assert_eq!(deadlines.len(), 4);
        for pair in deadlines.windows(2) {
            assert_eq!(pair[1] - pair[0], period);
        }
        assert!(deadlines[3] < Instant::now());
        assert!(future.cancel(false));
    }

    /// Check that fixed-delay runs are spaced from the end of the previous run
    #[test]
    fn fixed_delay_spacing() {
        let backend = Inline::new();
        let delay = Duration::from_millis(5);
        let future = schedule_periodic_via(
            &backend,
            Duration::ZERO,
            Cadence::FixedDelay(delay),
            Box::new(|| std::thread::sleep(Duration::from_millis(10)))
        );
        backend.tick();
        let finished = Instant::now();
        let deadlines = backend.deadlines.lock().clone();
        assert_eq!(deadlines.len(), 2);
        assert!(deadlines[1] >= deadlines[0] + Duration::from_millis(10) + delay);
        assert!(deadlines[1] <= finished + delay);
        assert!(future.cancel(false));
    }

    /// Check that closures can act as shutdown listeners
    #[test]
    fn closure_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c_calls = calls.clone();
        let listener: Arc<dyn ShutdownListener> = Arc::new(move || -> Result<(), Failure> {
            c_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert!(listener.on_shutdown().is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
