//! Shutdown protocol shared by all scheduler backends
//!
//! Shutting a scheduler down goes through the following steps:
//!
//! 1. The scheduler is flagged as shutting down, which is immediately visible
//!    through `is_shutting_down()`.
//! 2. Every registered shutdown listener is notified exactly once, on the
//!    thread which requested the shutdown. Failures are collected.
//! 3. A teardown thread waits for the backend to go idle, for at most the
//!    grace period, then makes it stop accepting work.
//! 4. The teardown thread waits for the backend's threads to exit, for at
//!    most the hard timeout, then reports the outcome of the whole process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{catching, AsyncResult, Error, Failure};
use crate::future::Future;
use crate::promise::promise;
use super::{ListenerId, ShutdownListener};


/// Interval at which the teardown thread checks on the backend
const POLL_INTERVAL: Duration = Duration::from_millis(5);


/// Shutdown flag and listener registry of a scheduler
pub(crate) struct Lifecycle {
    /// Truth that shutdown was requested
    shutting_down: AtomicBool,

    /// Identifier of the next registered listener
    next_id: AtomicU64,

    /// Registered listeners
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ShutdownListener>)>>,
}
//
impl Lifecycle {
    /// Set up the lifecycle of a newly created scheduler
    pub fn new() -> Self {
        Lifecycle {
            shutting_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a shutdown listener
    ///
    /// Listeners which are registered after shutdown started are never called.
    pub fn add_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Unregister a shutdown listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let initial_len = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != initial_len
    }

    /// Check whether shutdown was requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Flag the scheduler as shutting down and notify listeners
    ///
    /// Returns the failures of the listeners, in registration order.
    ///
    /// # Panics
    ///
    /// Panics if shutdown was already requested.
    pub fn begin_shutdown(&self) -> Vec<Failure> {
        let first = self.shutting_down
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
        assert!(first, "scheduler was shut down twice");

        // Listeners are user code, which must not run under our lock
        let listeners = std::mem::take(&mut *self.listeners.lock());
        tracing::debug!(listeners = listeners.len(), "notifying shutdown listeners");
        let mut failures = Vec::new();
        for (id, listener) in listeners {
            let outcome = catching(|| listener.on_shutdown()).and_then(|r| r);
            if let Err(failure) = outcome {
                tracing::warn!(?id, %failure, "shutdown listener failed");
                failures.push(failure);
            }
        }
        failures
    }
}


/// Operations through which a backend is torn down
pub(crate) trait Teardown: Send + Sync + 'static {
    /// Check whether the backend has no submitted work left
    fn is_idle(&self) -> bool;

    /// Stop accepting new work and discard pending timers
    fn stop_accepting(&self);

    /// Number of backend threads which have not exited yet
    fn live_threads(&self) -> usize;

    /// Reclaim resources once threads are gone or were given up on
    ///
    /// Work which is still queued at this point must be rejected.
    fn finish(&self, terminated: bool);
}


/// Run the whole shutdown protocol on a backend
pub(crate) fn shut_down<B: Teardown>(backend: Arc<B>,
                                     lifecycle: &Lifecycle,
                                     thread_name: String,
                                     grace_period: Duration,
                                     hard_timeout: Duration) -> Future<()> {
    let listener_failures = lifecycle.begin_shutdown();
    let (promise, future) = promise();
    spawn_or_run(thread_name, move || {
        let result = tear_down(&*backend, grace_period, hard_timeout);
        promise.complete(shutdown_outcome(listener_failures, result));
    });
    future
}


/// Background part of the shutdown protocol
///
/// Returns the hard timeout as an error if threads did not exit in time.
fn tear_down<B: Teardown>(backend: &B,
                          grace_period: Duration,
                          hard_timeout: Duration) -> Result<(), Duration> {
    // Give already submitted work some time to finish...
    let grace_deadline = super::deadline_after(Instant::now(), grace_period);
    while !backend.is_idle() && Instant::now() < grace_deadline {
        thread::sleep(POLL_INTERVAL);
    }
    tracing::debug!(idle = backend.is_idle(), "grace period over, rejecting work");
    backend.stop_accepting();

    // ...then wait for threads to exit
    let hard_deadline = super::deadline_after(Instant::now(), hard_timeout);
    while backend.live_threads() > 0 && Instant::now() < hard_deadline {
        thread::sleep(POLL_INTERVAL);
    }
    let terminated = backend.live_threads() == 0;
    if !terminated {
        tracing::error!(live_threads = backend.live_threads(),
                        ?hard_timeout,
                        "scheduler threads did not terminate in time");
    }
    backend.finish(terminated);
    if terminated { Ok(()) } else { Err(hard_timeout) }
}


/// Combine the outcomes of the shutdown steps into a single result
///
/// Listener failures take precedence, a termination timeout is then reported
/// as a suppressed failure.
fn shutdown_outcome(listener_failures: Vec<Failure>,
                    termination: Result<(), Duration>) -> AsyncResult<()> {
    let timeout = termination.err()
                             .map(|timeout| Failure::from(Error::TerminationTimeout(timeout)));
    let mut failure = match (listener_failures.len(), timeout) {
        (0, None) => return Ok(()),
        (0, Some(timeout)) => return Err(timeout),
        (count, timeout) => {
            let mut failure = Failure::from(Error::ShutdownListeners(count));
            if let Some(timeout) = timeout {
                failure.add_suppressed(timeout);
            }
            failure
        },
    };
    for listener_failure in listener_failures {
        failure.add_suppressed(listener_failure);
    }
    Err(failure)
}


/// Run some work on a new thread, or inline if no thread can be spawned
pub(crate) fn spawn_or_run<F>(name: String, work: F)
    where F: FnOnce() + Send + 'static
{
    let slot = Arc::new(Mutex::new(Some(work)));
    let c_slot = slot.clone();
    let spawned = thread::Builder::new().name(name).spawn(move || {
        if let Some(work) = c_slot.lock().take() {
            work();
        }
    });
    if let Err(error) = spawned {
        tracing::warn!(%error, "failed to spawn thread, running its work inline");
        if let Some(work) = slot.lock().take() {
            work();
        }
    }
}
