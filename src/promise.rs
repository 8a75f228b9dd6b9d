//! Producer side of asynchronous operations
//!
//! A `Promise` is the write end of an asynchronous operation: whoever performs
//! the work holds it, and eventually completes it with the operation's result.
//! The matching `Future` is handed to the consumer.
//!
//! Both ends share a completion cell, which buffers whichever of the result
//! and the consumer callback shows up first. The cell in this module is
//! thread-safe, so that producer and consumer may live on different threads.
//! See the `local` module for a cheaper variant confined to a single thread.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{Cancel, CancelHandle};
use crate::error::{catching, AsyncResult, Error, Failure};
use crate::future::Future;
use crate::state::{Action, CompletionState};


/// Consumer callback of thread-safe completion cells
pub(crate) type Callback<V> = Box<dyn FnOnce(AsyncResult<V>) + Send + 'static>;

/// Cancel hook of thread-safe completion cells
pub(crate) type CancelHook = Box<dyn FnOnce(bool) + Send + 'static>;


/// Create a new asynchronous operation, as a (producer, consumer) pair
pub fn promise<V: Send + 'static>() -> (Promise<V>, Future<V>) {
    let cell = Arc::new(SharedCell::new());
    (Promise { cell: Some(cell.clone()) }, Future::pending(cell))
}


/// Producer interface, used to complete an asynchronous operation
///
/// Completing a promise consumes it, so an operation cannot be completed
/// twice. If a promise is dropped without having been completed, its consumer
/// receives an `Error::ProducerDropped` failure instead of hanging forever.
pub struct Promise<V: Send + 'static> {
    /// Completion cell shared with the consumer (None once completed)
    cell: Option<Arc<SharedCell<V>>>,
}
//
impl<V: Send + 'static> Promise<V> {
    /// Complete the asynchronous operation with some result
    ///
    /// If the operation was cancelled in the meantime, the result is dropped.
    /// Otherwise, the consumer callback runs on the calling thread if it was
    /// already registered, or later on the thread which registers it.
    pub fn complete(mut self, result: AsyncResult<V>) {
        if let Some(cell) = self.cell.take() {
            cell.complete(result);
        }
    }

    /// Complete the operation successfully
    pub fn succeed(self, value: V) {
        self.complete(Ok(value));
    }

    /// Complete the operation with a failure
    pub fn fail(self, failure: impl Into<Failure>) {
        self.complete(Err(failure.into()));
    }

    /// Install a hook which interrupts the underlying work on cancellation
    ///
    /// The hook receives the `may_interrupt_if_running` flag of the request.
    /// It runs at most once, and right away if the operation was already
    /// cancelled. It is discarded when the operation completes.
    pub fn set_cancel_hook(&self, hook: impl FnOnce(bool) + Send + 'static) {
        if let Some(cell) = &self.cell {
            cell.set_cancel_hook(Box::new(hook));
        }
    }

    /// Check whether the consumer cancelled the operation
    ///
    /// Long-running producers are encouraged to check this periodically and
    /// stop working early when it becomes true.
    pub fn is_cancelled(&self) -> bool {
        self.cell.as_ref().map_or(false, |cell| cell.is_cancelled())
    }

    /// If the operation was cancelled, tell whether interruption was allowed
    pub(crate) fn cancellation(&self) -> Option<bool> {
        self.cell.as_ref().and_then(|cell| cell.cancellation())
    }
}
//
impl<V: Send + 'static> Drop for Promise<V> {
    /// If the producer goes away before the operation reached a final status,
    /// notify the consumer in order to prevent it from hanging
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.complete(Err(Failure::from(Error::ProducerDropped)));
        }
    }
}
//
impl<V: Send + 'static> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}


/// Thread-safe completion cell
pub(crate) struct SharedCell<V> {
    /// Current state of the operation (mutex-protected)
    state: Mutex<CompletionState<V, Callback<V>, CancelHook>>,
}
//
impl<V: Send + 'static> SharedCell<V> {
    /// Create a cell in the pending state
    pub fn new() -> Self {
        SharedCell { state: Mutex::new(CompletionState::new()) }
    }

    /// Deliver the result of the operation
    pub fn complete(&self, result: AsyncResult<V>) {
        let action = self.state.lock().complete(result);
        perform(action);
    }

    /// Register the consumer callback
    pub fn subscribe(&self, callback: Callback<V>) {
        let action = self.state.lock().subscribe(callback);
        perform(action);
    }

    /// Install the cancel hook
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        let action = self.state.lock().set_cancel_hook(hook);
        perform(action);
    }

    /// Check whether the operation reached a final state
    pub fn is_done(&self) -> bool {
        self.state.lock().is_final()
    }

    /// If the operation was cancelled, tell whether interruption was allowed
    pub fn cancellation(&self) -> Option<bool> {
        self.state.lock().cancellation()
    }

    /// Handle used by derived futures to forward cancellation requests here
    pub fn cancel_handle(self: &Arc<Self>) -> CancelHandle {
        CancelHandle::to(self)
    }
}
//
impl<V: Send + 'static> Cancel for SharedCell<V> {
    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        let action = self.state.lock().cancel(may_interrupt_if_running);
        match action {
            Some(action) => {
                perform(action);
                true
            },
            None => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().is_cancelled()
    }
}


/// Carry out the side effects of a state transition, outside of the lock
///
/// Callbacks and hooks are user code. Should they panic, there is nobody left
/// to report the failure to, so the panic is logged and swallowed rather than
/// allowed to tear down the producer's thread.
pub(crate) fn perform<V, C, H>(action: Action<V, C, H>)
    where C: FnOnce(AsyncResult<V>),
          H: FnOnce(bool)
{
    match action {
        Action::Nothing => {},
        Action::Deliver(callback, result) => {
            if let Err(failure) = catching(move || callback(result)) {
                tracing::warn!(%failure, "result callback panicked");
            }
        },
        Action::Cancel { hook, callback, may_interrupt } => {
            if let Some(hook) = hook {
                if let Err(failure) = catching(move || hook(may_interrupt)) {
                    tracing::warn!(%failure, "cancel hook panicked");
                }
            }
            if let Some(callback) = callback {
                let cancelled = Err(Failure::from(Error::Cancelled));
                if let Err(failure) = catching(move || callback(cancelled)) {
                    tracing::warn!(%failure, "result callback panicked");
                }
            }
        },
        Action::Interrupt(hook, may_interrupt) => {
            if let Err(failure) = catching(move || hook(may_interrupt)) {
                tracing::warn!(%failure, "cancel hook panicked");
            }
        },
    }
}
