//! Thread pool scheduler
//!
//! This scheduler runs tasks on a dynamically sized pool of OS threads, which
//! makes it suitable for general-purpose work, including work which blocks.
//!
//! Threads are spawned lazily, up to `max_threads`, whenever submitted work
//! outnumbers the existing threads. Threads above `min_threads`
//! retire once they have been idle for longer than the idle timeout. Work is
//! fed to threads through a lock-free FIFO queue, and delayed or periodic work
//! waits on a dedicated timer thread until it is due.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::{catching, BuildError};
use crate::future::Future;
use super::lifecycle::{self, Lifecycle, Teardown};
use super::timer::Timer;
use super::{Admission, Cadence, Dispatch, ListenerId, RepeatingTask, Scheduler,
            ShutdownListener, Task, Work};


/// Scheduler backed by a dynamically sized thread pool
///
/// Dropping the last handle to a pool which was not shut down explicitly
/// shuts it down in the background.
pub struct ThreadPoolScheduler {
    /// State shared with the worker and timer threads
    inner: Arc<PoolInner>,
}
//
impl ThreadPoolScheduler {
    /// Create a thread pool, eagerly spawning its minimal set of threads
    pub fn new(config: SchedulerConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let inner = Arc::new_cyclic(|this| PoolInner {
            this: this.clone(),
            queue: SegQueue::new(),
            accepting: AtomicBool::new(true),
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(0),
            gate: Mutex::new(()),
            work_cv: Condvar::new(),
            thread_handles: Mutex::new(Vec::with_capacity(config.min_threads)),
            timer: Timer::new(),
            lifecycle: Lifecycle::new(),
            config,
        });

        // Due timers are handed over to the pool, unless it went away
        let weak_inner = Arc::downgrade(&inner);
        inner.timer.start(format!("{}-timer", inner.config.thread_name_prefix),
                          move |work| fire_timer(&weak_inner, work))?;

        for _ in 0..inner.config.min_threads {
            inner.active_threads.fetch_add(1, Ordering::AcqRel);
            if let Err(error) = spawn_worker(&inner) {
                inner.stop_accepting();
                return Err(error.into());
            }
        }
        tracing::debug!(min_threads = inner.config.min_threads,
                        max_threads = inner.config.max_threads,
                        "thread pool started");
        Ok(ThreadPoolScheduler { inner })
    }

    /// Create a thread pool with the default configuration
    pub fn with_defaults() -> Result<Self, BuildError> {
        Self::new(SchedulerConfig::default())
    }

    /// Configuration of this pool
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Number of live worker threads
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Acquire)
    }

    /// Number of worker threads currently running a task
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Acquire)
    }

    /// Number of submitted tasks which did not finish running yet
    pub fn pending_tasks(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}
//
impl Scheduler for ThreadPoolScheduler {
    fn execute(&self, task: Task) {
        super::execute_via(&*self.inner, task)
    }

    fn submit_task(&self, task: Task) -> Future<()> {
        super::submit_via(&*self.inner, task)
    }

    fn schedule_task(&self, delay: Duration, task: Task) -> Future<()> {
        super::schedule_via(&*self.inner, delay, task)
    }

    fn schedule_at_fixed_rate(&self,
                              initial_delay: Duration,
                              period: Duration,
                              task: RepeatingTask) -> Future<()> {
        super::schedule_periodic_via(&self.inner,
                                     initial_delay,
                                     Cadence::FixedRate(period),
                                     task)
    }

    fn schedule_with_fixed_delay(&self,
                                 initial_delay: Duration,
                                 delay: Duration,
                                 task: RepeatingTask) -> Future<()> {
        super::schedule_periodic_via(&self.inner,
                                     initial_delay,
                                     Cadence::FixedDelay(delay),
                                     task)
    }

    fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) -> ListenerId {
        self.inner.lifecycle.add_listener(listener)
    }

    fn remove_shutdown_listener(&self, id: ListenerId) -> bool {
        self.inner.lifecycle.remove_listener(id)
    }

    fn shutdown(&self) -> Future<()> {
        tracing::debug!(prefix = %self.inner.config.thread_name_prefix,
                        "thread pool shutdown requested");
        lifecycle::shut_down(self.inner.clone(),
                             &self.inner.lifecycle,
                             format!("{}-teardown", self.inner.config.thread_name_prefix),
                             self.inner.config.grace_period,
                             self.inner.config.hard_timeout)
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.lifecycle.is_shutting_down()
    }
}
//
impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        if !self.is_shutting_down() {
            let _ = self.shutdown();
        }
    }
}
//
impl fmt::Debug for ThreadPoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolScheduler")
            .field("min_threads", &self.inner.config.min_threads)
            .field("max_threads", &self.inner.config.max_threads)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending_tasks", &self.pending_tasks())
            .field("pending_timers", &self.inner.timer.pending())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}


/// State shared by the pool's handle, workers and timer
struct PoolInner {
    /// Weak reference to this very state, handed over to new workers
    this: Weak<PoolInner>,

    /// Work queue
    queue: SegQueue<Work>,

    /// Truth that new work is accepted (only changed with `gate` held)
    accepting: AtomicBool,

    /// Number of live worker threads
    active_threads: AtomicUsize,

    /// Number of worker threads currently running work
    busy_threads: AtomicUsize,

    /// Number of accepted pieces of work which did not finish running yet
    outstanding: AtomicUsize,

    /// Identifier of the next spawned worker, used in thread names
    next_thread_id: AtomicUsize,

    /// Mutex associated with `work_cv`, also serializing admission decisions
    gate: Mutex<()>,

    /// Condition variable used to park idle workers
    work_cv: Condvar,

    /// Join handles of every spawned worker
    thread_handles: Mutex<Vec<JoinHandle<()>>>,

    /// Timer thread for delayed and periodic work
    timer: Timer,

    /// Shutdown flag and listeners
    lifecycle: Lifecycle,

    /// Pool configuration
    config: SchedulerConfig,
}
//
impl PoolInner {
    /// Queue work, waking up or spawning a worker to run it
    fn push(&self, work: Work) -> Result<(), Work> {
        {
            let _gate = self.gate.lock();
            if !self.accepting.load(Ordering::Acquire) {
                return Err(work);
            }
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            self.queue.push(work);
            self.work_cv.notify_one();
        }
        self.maybe_spawn_worker();
        Ok(())
    }

    /// Spawn a new worker if there is more unfinished work than workers
    fn maybe_spawn_worker(&self) {
        let max_threads = self.config.max_threads;
        let outstanding = self.outstanding.load(Ordering::Acquire);
        let reserved = self.active_threads
                           .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                               (active < max_threads && outstanding > active)
                                   .then(|| active + 1)
                           });
        let Ok(active) = reserved else { return };
        match self.this.upgrade() {
            Some(inner) => {
                if let Err(error) = spawn_worker(&inner) {
                    tracing::warn!(%error, active, "failed to spawn pool worker");
                }
            },
            None => {
                self.active_threads.fetch_sub(1, Ordering::AcqRel);
            },
        }
    }
}
//
impl Dispatch for PoolInner {
    fn dispatch(&self, work: Work) -> Result<(), Work> {
        self.push(work)
    }

    fn dispatch_at(&self, deadline: Instant, work: Work) -> Result<(), Work> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(work);
        }
        if deadline <= Instant::now() {
            return self.dispatch(work);
        }
        self.timer.schedule(deadline, work)
    }
}
//
impl Teardown for PoolInner {
    fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    fn stop_accepting(&self) {
        {
            let _gate = self.gate.lock();
            self.accepting.store(false, Ordering::Release);
            self.work_cv.notify_all();
        }
        self.timer.stop();
    }

    fn live_threads(&self) -> usize {
        let _gate = self.gate.lock();
        self.work_cv.notify_all();
        self.active_threads.load(Ordering::Acquire)
    }

    fn finish(&self, terminated: bool) {
        let handles = std::mem::take(&mut *self.thread_handles.lock());
        if terminated {
            for handle in handles {
                let _ = handle.join();
            }
        }

        // Workers are gone, whatever is left in the queue will never run
        let mut rejected = 0;
        while let Some(work) = self.queue.pop() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            work(Admission::Rejected);
            rejected += 1;
        }
        tracing::debug!(terminated, rejected, "thread pool terminated");
    }
}


/// Hand due timer work over to the pool
fn fire_timer(inner: &Weak<PoolInner>, work: Work) {
    let pushed = match inner.upgrade() {
        Some(inner) => inner.push(work),
        None => Err(work),
    };
    if let Err(work) = pushed {
        work(Admission::Rejected);
    }
}


/// Spawn a new worker thread, whose slot in the active count is reserved
fn spawn_worker(inner: &Arc<PoolInner>) -> std::io::Result<()> {
    let thread_id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.config.thread_name_prefix, thread_id);

    let c_inner = inner.clone();
    let spawned = thread::Builder::new().name(name).spawn(move || {
        tracing::trace!(thread_id, "pool worker started");
        match worker_loop(&c_inner) {
            WorkerExit::Retired => {
                tracing::trace!(thread_id, "idle pool worker retired");
            },
            WorkerExit::Shutdown => {
                c_inner.active_threads.fetch_sub(1, Ordering::AcqRel);
                tracing::trace!(thread_id, "pool worker stopped");
            },
        }
    });
    match spawned {
        Ok(handle) => {
            // Retired workers are gone for good, only live ones need joining
            let mut handles = inner.thread_handles.lock();
            handles.retain(|handle| !handle.is_finished());
            handles.push(handle);
            Ok(())
        },
        Err(error) => {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            Err(error)
        },
    }
}


/// Reason why a worker stopped
enum WorkerExit {
    /// The worker was idle for too long (it already left the active count)
    Retired,

    /// The pool stopped accepting work and the queue is empty
    Shutdown,
}


/// Main loop of pool workers
fn worker_loop(inner: &PoolInner) -> WorkerExit {
    loop {
        // Run queued work while there is some...
        if let Some(work) = inner.queue.pop() {
            inner.busy_threads.fetch_add(1, Ordering::AcqRel);
            if let Err(failure) = catching(move || work(Admission::Run)) {
                tracing::error!(%failure, "pool work panicked outside of its task");
            }
            inner.busy_threads.fetch_sub(1, Ordering::AcqRel);
            inner.outstanding.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        // ...then check for shutdown or park, without missing a wakeup
        let mut gate = inner.gate.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if !inner.accepting.load(Ordering::Acquire) {
            return WorkerExit::Shutdown;
        }
        if inner.active_threads.load(Ordering::Acquire) > inner.config.min_threads {
            let timed_out = inner.work_cv
                                 .wait_for(&mut gate, inner.config.idle_timeout)
                                 .timed_out();
            if timed_out && inner.queue.is_empty() && try_retire(inner) {
                return WorkerExit::Retired;
            }
        } else {
            inner.work_cv.wait(&mut gate);
        }
    }
}


/// Leave the active thread count, unless that would go below the minimum
fn try_retire(inner: &PoolInner) -> bool {
    let min_threads = inner.config.min_threads;
    inner.active_threads
         .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
             (active > min_threads).then(|| active - 1)
         })
         .is_ok()
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Failure};
    use crate::executor::SchedulerExt;
    use std::sync::mpsc;

    /// Small pool with short timeouts, suitable for tests
    fn test_pool(min_threads: usize, max_threads: usize) -> ThreadPoolScheduler {
        let config = SchedulerConfig::default()
            .with_thread_name_prefix("test-pool")
            .with_min_threads(min_threads)
            .with_max_threads(max_threads)
            .with_idle_timeout(Duration::from_millis(20))
            .with_grace_period(Duration::from_millis(500))
            .with_hard_timeout(Duration::from_secs(2));
        ThreadPoolScheduler::new(config).unwrap()
    }

    /// Check that invalid configurations are refused
    #[test]
    fn invalid_config() {
        let config = SchedulerConfig::default().with_max_threads(0);
        assert!(matches!(ThreadPoolScheduler::new(config),
                         Err(BuildError::Config(_))));
    }

    /// Check that values computed on the pool come back
    #[test]
    fn submit_and_wait() {
        let pool = test_pool(1, 4);
        assert_eq!(pool.submit(|| 6 * 7).wait().unwrap(), 42);
        assert!(pool.submit_task(Box::new(|| {})).wait().is_ok());
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that the pool grows when all threads are busy, and shrinks back
    #[test]
    fn elastic_sizing() {
        let pool = test_pool(1, 4);
        let (tx, rx) = mpsc::channel();
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        let futures: Vec<_> = (0..4).map(|_| {
            let tx = tx.clone();
            let release = release.clone();
            pool.submit(move || {
                tx.send(thread::current().id()).unwrap();
                let mut released = release.0.lock();
                while !*released {
                    release.1.wait(&mut released);
                }
            })
        }).collect();

        // All four tasks must be running concurrently on distinct threads
        let mut threads: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        threads.sort_by_key(|id| format!("{:?}", id));
        threads.dedup();
        assert_eq!(threads.len(), 4);
        assert_eq!(pool.active_threads(), 4);

        *release.0.lock() = true;
        release.1.notify_all();
        for future in futures {
            future.wait().unwrap();
        }

        // Idle threads above the minimum retire
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.active_threads() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.active_threads(), 1);
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that delayed tasks wait for their delay
    #[test]
    fn delayed_task() {
        let pool = test_pool(1, 2);
        let start = Instant::now();
        let value = pool.schedule(Duration::from_millis(20), || "late").wait();
        assert_eq!(value.unwrap(), "late");
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that fixed-delay tasks repeat
    #[test]
    fn fixed_delay() {
        let pool = test_pool(1, 2);
        let (tx, rx) = mpsc::channel();
        let periodic = pool.schedule_with_fixed_delay(
            Duration::ZERO,
            Duration::from_millis(2),
            Box::new(move || { let _ = tx.send(()); })
        );
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert!(periodic.cancel(false));
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that work is rejected once the pool is shut down
    #[test]
    fn rejection_after_shutdown() {
        let pool = test_pool(1, 2);
        let delayed = pool.schedule_task(Duration::from_secs(3600), Box::new(|| {}));
        assert!(pool.shutdown().wait().is_ok());
        assert!(pool.is_shutting_down());
        assert_eq!(pool.active_threads(), 0);

        let failure = delayed.wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
        let failure = pool.submit(|| 1).wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
    }

    /// Check that the grace period lets submitted work finish
    #[test]
    fn grace_period() {
        let pool = test_pool(1, 1);
        let slow = pool.submit(|| {
            thread::sleep(Duration::from_millis(50));
            "finished"
        });
        let outcome = pool.shutdown();
        assert_eq!(slow.wait().unwrap(), "finished");
        assert!(outcome.wait().is_ok());
    }

    /// Check that threads which outlive the hard timeout are reported
    #[test]
    fn termination_timeout() {
        let config = SchedulerConfig::default()
            .with_thread_name_prefix("test-stuck")
            .with_min_threads(1)
            .with_max_threads(1)
            .with_grace_period(Duration::ZERO)
            .with_hard_timeout(Duration::from_millis(20));
        let pool = ThreadPoolScheduler::new(config).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = rx.recv();
        }));
        started_rx.recv().unwrap();

        let failure = pool.shutdown().wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(),
                         Some(Error::TerminationTimeout(_))));
        drop(tx);
    }

    /// Check that delays too large for the clock neither panic nor stall shutdown
    #[test]
    fn huge_delays() {
        let pool = test_pool(1, 2);
        let (tx, rx) = mpsc::channel();
        let delayed = pool.schedule_task(Duration::MAX, Box::new(|| {}));
        let periodic = pool.schedule_with_fixed_delay(
            Duration::ZERO,
            Duration::MAX,
            Box::new(move || { let _ = tx.send(()); })
        );
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while pool.pending_tasks() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.pending_tasks(), 0);
        assert!(pool.shutdown().wait().is_ok());
        for future in [delayed, periodic] {
            let failure = future.wait().unwrap_err();
            assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::Rejected)));
        }
    }

    /// Check that a worker survives work which panics outside of any task
    #[test]
    fn worker_survives_panicking_work() {
        let pool = test_pool(1, 1);
        let work: Work = Box::new(|admission| {
            if let Admission::Run = admission {
                panic!("broken work");
            }
        });
        assert!(pool.inner.push(work).is_ok());
        assert_eq!(pool.submit(|| 5).wait().unwrap(), 5);
        assert_eq!(pool.active_threads(), 1);
        assert_eq!(pool.pending_tasks(), 0);
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that retired workers do not leave their join handles behind
    #[test]
    fn retired_handles_pruned() {
        let pool = test_pool(1, 4);
        let churn = |pool: &ThreadPoolScheduler| {
            let futures: Vec<_> = (0..4).map(|_| {
                pool.submit(|| thread::sleep(Duration::from_millis(10)))
            }).collect();
            for future in futures {
                future.wait().unwrap();
            }
        };
        for _ in 0..10 {
            churn(&pool);
            let deadline = Instant::now() + Duration::from_secs(2);
            while pool.active_threads() > 1 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
        }

        // Spawning prunes the handles of every worker which exited so far
        thread::sleep(Duration::from_millis(20));
        churn(&pool);
        assert!(pool.inner.thread_handles.lock().len() <= 8);
        assert!(pool.shutdown().wait().is_ok());
    }

    /// Check that listener failures make the shutdown fail
    #[test]
    fn listener_failure() {
        let pool = test_pool(1, 1);
        pool.add_shutdown_listener(Arc::new(|| -> Result<(), Failure> {
            Err(Error::Rejected.into())
        }));
        let failure = pool.shutdown().wait().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(),
                         Some(Error::ShutdownListeners(1))));
        assert_eq!(failure.suppressed().len(), 1);
    }
}
