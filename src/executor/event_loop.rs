//! Event-loop scheduler
//!
//! This scheduler runs a fixed set of single-threaded reactors. Each of them
//! owns an OS-level poller (epoll, kqueue, IOCP...), an inbox of submitted
//! work and a local timer heap, and alternates between running due work and
//! waiting for I/O readiness or for the next timer deadline.
//!
//! Work has affinity with the reactor which submits it: anything submitted
//! from a reactor thread of the scheduler stays on that reactor, so that
//! sequences of callbacks and continuations do not hop between threads.
//! Submissions from other threads are spread across reactors in round-robin
//! fashion.
//!
//! Reactor threads must never block. In particular, `Future::wait` refuses to
//! block on them and fails with `Error::WouldDeadlock` instead.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use polling::{AsRawSource, AsSource, Event, Events, Poller};

use crate::config::SchedulerConfig;
use crate::error::{catching, BuildError};
use crate::future::Future;
use super::lifecycle::{self, Lifecycle, Teardown};
use super::timer::DeadlineHeap;
use super::{Admission, Cadence, Dispatch, ListenerId, RepeatingTask, Scheduler,
            ShutdownListener, Task, Work};


/// Identifier of the next event-loop scheduler
static NEXT_GROUP: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Reactor which runs on the current thread, if any
    static CURRENT: Cell<Option<LoopId>> = const { Cell::new(None) };
}

/// Check whether the calling thread runs an event loop
pub(crate) fn in_event_loop() -> bool {
    CURRENT.with(|current| current.get().is_some())
}


/// Location of a reactor: which scheduler it belongs to, and its rank there
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LoopId {
    group: usize,
    index: usize,
}


/// Scheduler backed by a fixed set of single-threaded reactors
///
/// Dropping the last handle to a scheduler which was not shut down explicitly
/// shuts it down in the background.
pub struct EventLoopScheduler {
    /// State shared with the reactor threads
    inner: Arc<GroupInner>,
}
//
impl EventLoopScheduler {
    /// Start `config.event_loop_threads` reactors
    pub fn new(config: SchedulerConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        let loops = (0..config.event_loop_threads)
            .map(|index| {
                let shared = LoopShared::new(LoopId { group, index })?;
                Ok(EventLoop { shared: Arc::new(shared) })
            })
            .collect::<io::Result<Vec<_>>>()?;
        let inner = Arc::new(GroupInner {
            id: group,
            loops,
            next: AtomicUsize::new(0),
            live_threads: Arc::new(AtomicUsize::new(0)),
            thread_handles: Mutex::new(Vec::new()),
            lifecycle: Lifecycle::new(),
            config,
        });

        for event_loop in &inner.loops {
            if let Err(error) = inner.spawn_reactor(event_loop) {
                inner.stop_accepting();
                return Err(error.into());
            }
        }
        tracing::debug!(group, loops = inner.loops.len(), "event loops started");
        Ok(EventLoopScheduler { inner })
    }

    /// Start one reactor per available CPU, with default settings
    pub fn with_defaults() -> Result<Self, BuildError> {
        Self::new(SchedulerConfig::default())
    }

    /// Reactor of this scheduler which runs the calling thread, if any
    pub fn current(&self) -> Option<EventLoop> {
        let id = CURRENT.with(|current| current.get())?;
        (id.group == self.inner.id).then(|| self.inner.loops[id.index].clone())
    }

    /// Pick a reactor, following the same policy as task submission
    ///
    /// The returned handle is pinned: work submitted through it always runs
    /// on that reactor.
    pub fn next_loop(&self) -> EventLoop {
        self.inner.pick().clone()
    }

    /// Number of reactors
    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    /// Truth that this scheduler has no reactor (never the case in practice)
    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }
}
//
impl Scheduler for EventLoopScheduler {
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
        tracing::debug!(group = self.inner.id, "event loop shutdown requested");
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
impl Drop for EventLoopScheduler {
    fn drop(&mut self) {
        if !self.is_shutting_down() {
            let _ = self.shutdown();
        }
    }
}
//
impl fmt::Debug for EventLoopScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopScheduler")
            .field("group", &self.inner.id)
            .field("loops", &self.inner.loops)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}


/// State shared by an event-loop scheduler and its reactor threads
struct GroupInner {
    /// Identifier of this scheduler, used to recognize its own threads
    id: usize,

    /// Reactors of this scheduler
    loops: Vec<EventLoop>,

    /// Round-robin counter used to distribute foreign submissions
    next: AtomicUsize,

    /// Number of reactor threads which have not exited yet
    live_threads: Arc<AtomicUsize>,

    /// Join handles of the reactor threads
    thread_handles: Mutex<Vec<JoinHandle<()>>>,

    /// Shutdown flag and listeners
    lifecycle: Lifecycle,

    /// Scheduler configuration
    config: SchedulerConfig,
}
//
impl GroupInner {
    /// Start the thread of a reactor
    fn spawn_reactor(&self, event_loop: &EventLoop) -> io::Result<()> {
        let shared = event_loop.shared.clone();
        let live_threads = self.live_threads.clone();
        let name = format!("{}-event-loop-{}",
                           self.config.thread_name_prefix,
                           shared.id.index);
        live_threads.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            run_loop(&shared);
            live_threads.fetch_sub(1, Ordering::AcqRel);
        });
        match spawned {
            Ok(handle) => {
                self.thread_handles.lock().push(handle);
                Ok(())
            },
            Err(error) => {
                self.live_threads.fetch_sub(1, Ordering::AcqRel);
                Err(error)
            },
        }
    }

    /// Pick the reactor which should run newly submitted work
    fn pick(&self) -> &EventLoop {
        if let Some(id) = CURRENT.with(|current| current.get()) {
            if id.group == self.id {
                return &self.loops[id.index];
            }
        }
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        &self.loops[next % self.loops.len()]
    }
}
//
impl Dispatch for GroupInner {
    fn dispatch(&self, work: Work) -> Result<(), Work> {
        self.pick().shared.dispatch(work)
    }

    fn dispatch_at(&self, deadline: Instant, work: Work) -> Result<(), Work> {
        self.pick().shared.dispatch_at(deadline, work)
    }
}
//
impl Teardown for GroupInner {
    fn is_idle(&self) -> bool {
        self.loops.iter()
                  .all(|event_loop| event_loop.shared.outstanding.load(Ordering::Acquire) == 0)
    }

    fn stop_accepting(&self) {
        for event_loop in &self.loops {
            event_loop.shared.stop();
        }
    }

    fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    fn finish(&self, terminated: bool) {
        let handles = std::mem::take(&mut *self.thread_handles.lock());
        if terminated {
            for handle in handles {
                let _ = handle.join();
            }
        }

        // Stopped reactors accept nothing anymore, and stuck ones may never
        // get to their inbox again
        for event_loop in &self.loops {
            event_loop.shared.reject_leftovers();
        }
        tracing::debug!(group = self.id, terminated, "event loops terminated");
    }
}


/// Handle to a single reactor
///
/// Work submitted through this handle always runs on the reactor's thread.
/// I/O sources can also be registered, so that a handler runs on the reactor
/// whenever they become ready.
#[derive(Clone)]
pub struct EventLoop {
    /// State shared with the reactor thread
    shared: Arc<LoopShared>,
}
//
impl EventLoop {
    /// Check whether the calling thread is this reactor's thread
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.get() == Some(self.shared.id))
    }

    /// Run a task on this reactor, without tracking its outcome
    pub fn execute(&self, task: Task) {
        super::execute_via(&*self.shared, task)
    }

    /// Run a task on this reactor
    pub fn submit_task(&self, task: Task) -> Future<()> {
        super::submit_via(&*self.shared, task)
    }

    /// Run a task on this reactor once the given delay has elapsed
    pub fn schedule_task(&self, delay: Duration, task: Task) -> Future<()> {
        super::schedule_via(&*self.shared, delay, task)
    }

    /// Compute a value on this reactor
    pub fn submit<R, F>(&self, f: F) -> Future<R>
        where R: Send + 'static,
              F: FnOnce() -> R + Send + 'static
    {
        let (task, output) = super::capture(f);
        self.submit_task(task).transform(move |ran| ran.and_then(|()| output()))
    }

    /// Have a handler run on this reactor when an I/O source becomes ready
    ///
    /// Readiness is reported once: after the handler ran, the source must be
    /// re-armed with `rearm` for the handler to run again.
    ///
    /// # Safety
    ///
    /// The source must stay open until it is deregistered with `deregister`,
    /// or until the scheduler is shut down.
    pub unsafe fn register<F>(&self,
                              source: impl AsRawSource,
                              interest: Interest,
                              handler: F) -> io::Result<IoToken>
        where F: FnMut(Readiness) + Send + 'static
    {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let handler: IoHandler = Box::new(handler);
        self.shared.io_handlers.lock().insert(key, Arc::new(Mutex::new(handler)));

        // SAFETY: The caller guarantees that the source outlives its registration
        let added = unsafe { self.shared.poller.add(source, interest.event(key)) };
        if let Err(error) = added {
            self.shared.io_handlers.lock().remove(&key);
            return Err(error);
        }
        Ok(IoToken(key))
    }

    /// Ask for the next readiness notification of a registered source
    pub fn rearm(&self,
                 source: impl AsSource,
                 token: IoToken,
                 interest: Interest) -> io::Result<()> {
        self.shared.poller.modify(source, interest.event(token.0))
    }

    /// Stop watching a registered source, dropping its handler
    pub fn deregister(&self, source: impl AsSource, token: IoToken) -> io::Result<()> {
        self.shared.io_handlers.lock().remove(&token.0);
        self.shared.poller.delete(source)
    }
}
//
impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.shared.id.index)
            .field("pending_tasks", &self.shared.outstanding.load(Ordering::Relaxed))
            .field("io_sources", &self.shared.io_handlers.lock().len())
            .finish()
    }
}


/// Kind of readiness which an I/O handler is interested in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    /// The source has data to be read
    Readable,

    /// The source can accept more data
    Writable,

    /// Either of the above
    Both,
}
//
impl Interest {
    /// Translate into a poller event
    fn event(self, key: usize) -> Event {
        match self {
            Interest::Readable => Event::readable(key),
            Interest::Writable => Event::writable(key),
            Interest::Both => Event::all(key),
        }
    }
}


/// Readiness of an I/O source, as reported to its handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// The source has data to be read
    pub readable: bool,

    /// The source can accept more data
    pub writable: bool,
}


/// Registration of an I/O source with a reactor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoToken(usize);


/// Handler of I/O readiness notifications
type IoHandler = Box<dyn FnMut(Readiness) + Send + 'static>;


/// Message sent to a reactor
enum Message {
    /// Run some work as soon as possible
    Run(Work),

    /// Run some work at some deadline
    At(Instant, Work),
}
//
impl Message {
    /// Extract the work carried by this message
    fn into_work(self) -> Work {
        match self {
            Message::Run(work) | Message::At(_, work) => work,
        }
    }
}


/// State shared by a reactor thread and its handles
struct LoopShared {
    /// Location of this reactor
    id: LoopId,

    /// OS-level poller, also used to wake the reactor up
    poller: Poller,

    /// Work submitted to this reactor
    inbox: SegQueue<Message>,

    /// Truth that the reactor accepts new work (mutex-protected)
    accepting: Mutex<bool>,

    /// Number of submitted tasks which did not finish running yet
    outstanding: AtomicUsize,

    /// Handlers of registered I/O sources, by poller key
    io_handlers: Mutex<HashMap<usize, Arc<Mutex<IoHandler>>>>,

    /// Poller key of the next registered I/O source
    next_key: AtomicUsize,
}
//
impl LoopShared {
    /// Set up a reactor, without starting its thread
    fn new(id: LoopId) -> io::Result<Self> {
        Ok(LoopShared {
            id,
            poller: Poller::new()?,
            inbox: SegQueue::new(),
            accepting: Mutex::new(true),
            outstanding: AtomicUsize::new(0),
            io_handlers: Mutex::new(HashMap::new()),
            next_key: AtomicUsize::new(0),
        })
    }

    /// Send a message to the reactor, or give it back if it stopped
    fn post(&self, message: Message) -> Result<(), Message> {
        {
            let accepting = self.accepting.lock();
            if !*accepting {
                return Err(message);
            }
            if let Message::Run(_) = message {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
            }
            self.inbox.push(message);
        }

        // The reactor checks its inbox before polling, no need to wake itself
        if !CURRENT.with(|current| current.get() == Some(self.id)) {
            self.wake();
        }
        Ok(())
    }

    /// Interrupt the reactor's wait for I/O
    fn wake(&self) {
        if let Err(error) = self.poller.notify() {
            tracing::warn!(%error, index = self.id.index, "failed to wake event loop up");
        }
    }

    /// Stop accepting work, and have the reactor exit once drained
    fn stop(&self) {
        *self.accepting.lock() = false;
        self.wake();
    }

    /// Reject whatever was queued but never got a chance to run
    fn reject_leftovers(&self) {
        while let Some(message) = self.inbox.pop() {
            if let Message::Run(_) = message {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            message.into_work()(Admission::Rejected);
        }
    }

    /// Run the handler of an I/O source which became ready
    fn handle_io(&self, event: Event) {
        let handler = self.io_handlers.lock().get(&event.key).cloned();
        let Some(handler) = handler else { return };
        let readiness = Readiness {
            readable: event.readable,
            writable: event.writable,
        };
        let mut handler = handler.lock();
        let handler = &mut *handler;
        if let Err(failure) = catching(|| handler(readiness)) {
            tracing::warn!(%failure, key = event.key, "I/O handler panicked");
        }
    }
}
//
impl Dispatch for LoopShared {
    fn dispatch(&self, work: Work) -> Result<(), Work> {
        self.post(Message::Run(work)).map_err(Message::into_work)
    }

    fn dispatch_at(&self, deadline: Instant, work: Work) -> Result<(), Work> {
        self.post(Message::At(deadline, work)).map_err(Message::into_work)
    }
}


/// Longest time a reactor waits for I/O before looking at its timers again
const MAX_POLL_WAIT: Duration = Duration::from_secs(60);


/// Run work on a reactor, so that a panic cannot take the reactor down
fn run_guarded(shared: &LoopShared, work: Work) {
    if let Err(failure) = catching(move || work(Admission::Run)) {
        tracing::error!(%failure,
                        index = shared.id.index,
                        "event loop work panicked outside of its task");
    }
}


/// Main loop of reactor threads
fn run_loop(shared: &LoopShared) {
    CURRENT.with(|current| current.set(Some(shared.id)));
    tracing::trace!(index = shared.id.index, "event loop started");
    let mut timers = DeadlineHeap::new();
    let mut events = Events::new();
    loop {
        // Handle what was submitted so far, but not what this submits in turn
        for _ in 0..shared.inbox.len() {
            let Some(message) = shared.inbox.pop() else { break };
            match message {
                Message::Run(work) => {
                    run_guarded(shared, work);
                    shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                },
                Message::At(deadline, work) => timers.push(deadline, work),
            }
        }
        for work in timers.pop_due(Instant::now()) {
            run_guarded(shared, work);
        }

        // Once stopped, exit as soon as the inbox is drained
        if !*shared.accepting.lock() && shared.inbox.is_empty() {
            break;
        }

        // Wait for I/O, new work or the next timer, whichever comes first
        let timeout = if shared.inbox.is_empty() {
            timers.next_deadline()
                  .map(|deadline| deadline.saturating_duration_since(Instant::now())
                                          .min(MAX_POLL_WAIT))
        } else {
            Some(Duration::ZERO)
        };
        events.clear();
        if let Err(error) = shared.poller.wait(&mut events, timeout) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(%error, index = shared.id.index, "event loop poller failed");
            *shared.accepting.lock() = false;
            shared.reject_leftovers();
            break;
        }
        for event in events.iter() {
            shared.handle_io(event);
        }
    }

    // Timers which did not fire yet never will
    for work in timers.drain() {
        work(Admission::Rejected);
    }
    shared.io_handlers.lock().clear();
    CURRENT.with(|current| current.set(None));
    tracing::trace!(index = shared.id.index, "event loop stopped");
}
