//! Serialization of asynchronous operations
//!
//! A `FutureSynchronizer` makes sure that the asynchronous operations which
//! are started through it run one at a time, in submission order. This is
//! the asynchronous counterpart of a mutex: instead of blocking a thread
//! while another operation is in flight, the start of the next operation is
//! deferred until the previous one completed.
//!
//! Operations are described by suppliers, closures which start the operation
//! and return its future. The synchronizer returns a proxy future right away,
//! which resolves to the result of the supplied future once the operation had
//! its turn and completed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::catching;
use crate::future::Future;
use crate::promise::promise;


/// Queued operation, which starts when called and returns a future of the
/// end of its turn
type Entry = Box<dyn FnOnce() -> Future<()> + Send + 'static>;


/// The end of the current turn was not observed yet
const STARTING: u8 = 0;

/// The turn ended while it was being started
const COMPLETED_INLINE: u8 = 1;

/// The turn was started and will end later, on another call stack
const WAITING: u8 = 2;


/// Runs asynchronous operations one at a time, in FIFO order
///
/// Cloning a synchronizer yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct FutureSynchronizer {
    /// Queue of pending operations (mutex-protected)
    state: Arc<Mutex<SyncState>>,
}
//
impl FutureSynchronizer {
    /// Create an idle synchronizer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an asynchronous operation once all previous ones completed
    ///
    /// If no operation is in flight, the supplier runs right away on the
    /// calling thread. Otherwise, it runs on the thread which completes the
    /// operation before it. A panicking supplier fails its own future, and
    /// the next operation starts normally.
    ///
    /// Cancelling the returned future before the operation started means that
    /// the supplier is never called. Cancelling it afterwards cancels the
    /// supplied future.
    pub fn execute<V, F>(&self, supplier: F) -> Future<V>
        where V: Send + 'static,
              F: FnOnce() -> Future<V> + Send + 'static
    {
        let (promise, future) = promise();
        let entry: Entry = Box::new(move || {
            if promise.is_cancelled() {
                return Future::done();
            }
            let operation = match catching(supplier) {
                Ok(operation) => operation,
                Err(failure) => {
                    promise.fail(failure);
                    return Future::done();
                },
            };

            let upstream = operation.cancel_handle();
            promise.set_cancel_hook(move |may_interrupt| {
                upstream.cancel(may_interrupt);
            });
            operation.transform(move |result| {
                promise.complete(result);
                Ok(())
            })
        });

        // Queue the operation if another one is in flight...
        {
            let mut state = self.state.lock();
            if state.running {
                state.queue.push_back(entry);
                return future;
            }
            state.running = true;
        }

        // ...otherwise start it right away
        run_from(&self.state, entry);
        future
    }

    /// Number of operations waiting for their turn
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Check whether an operation is in flight
    pub fn is_busy(&self) -> bool {
        self.state.lock().running
    }
}
//
impl fmt::Debug for FutureSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FutureSynchronizer")
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}


/// Mutable synchronizer state
#[derive(Default)]
struct SyncState {
    /// Truth that an operation is in flight
    running: bool,

    /// Operations waiting for their turn
    queue: VecDeque<Entry>,
}


/// Start an operation, then every queued operation after it
///
/// Operations whose turn ends synchronously are handled by iterating, so that
/// the call stack does not grow with the length of the queue.
fn run_from(state: &Arc<Mutex<SyncState>>, first: Entry) {
    let mut entry = first;
    loop {
        let turn = entry();

        // Let the end of the turn either be observed here, or resume the
        // queue from wherever it happens
        let progress = Arc::new(AtomicU8::new(STARTING));
        let c_progress = progress.clone();
        let c_state = state.clone();
        turn.on_result(move |_| {
            let inline = c_progress.compare_exchange(STARTING,
                                                     COMPLETED_INLINE,
                                                     Ordering::AcqRel,
                                                     Ordering::Acquire);
            if inline.is_err() {
                if let Some(next) = next_entry(&c_state) {
                    run_from(&c_state, next);
                }
            }
        });
        let deferred = progress.compare_exchange(STARTING,
                                                 WAITING,
                                                 Ordering::AcqRel,
                                                 Ordering::Acquire);
        if deferred.is_ok() {
            return;
        }

        match next_entry(state) {
            Some(next) => entry = next,
            None => return,
        }
    }
}


/// Take the next queued operation, or mark the synchronizer idle
fn next_entry(state: &Mutex<SyncState>) -> Option<Entry> {
    let mut state = state.lock();
    let next = state.queue.pop_front();
    if next.is_none() {
        state.running = false;
    }
    next
}
