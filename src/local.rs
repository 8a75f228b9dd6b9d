//! Asynchronous operations confined to a single thread
//!
//! The promises and futures of this module work like the thread-safe ones,
//! but their completion cell is a reference-counted `RefCell` rather than an
//! `Arc`'d mutex. They are neither `Send` nor `Sync`, so the compiler makes
//! sure that they never leave the thread which created them. In exchange,
//! values and callbacks do not need to be `Send` either, and no atomic
//! operation or lock is involved.
//!
//! This flavor is meant for code which already runs on a single thread, such
//! as the tasks of an event loop.

use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{catching, AsyncResult, Error, Failure};
use crate::promise::perform;
use crate::state::{Action, CompletionState};


/// Consumer callback of thread-local completion cells
type LocalCallback<V> = Box<dyn FnOnce(AsyncResult<V>) + 'static>;

/// Cancel hook of thread-local completion cells
type LocalHook = Box<dyn FnOnce(bool) + 'static>;


/// Create a new thread-local asynchronous operation
pub fn local_promise<V: 'static>() -> (LocalPromise<V>, LocalFuture<V>) {
    let cell = Rc::new(LocalCell {
        state: RefCell::new(CompletionState::new()),
    });
    (LocalPromise { cell: Some(cell.clone()) },
     LocalFuture { repr: LocalRepr::Pending(cell) })
}


/// Producer side of a thread-local asynchronous operation
///
/// Like `Promise`, a local promise which is dropped without having been
/// completed fails its future with `Error::ProducerDropped`.
pub struct LocalPromise<V: 'static> {
    /// Completion cell shared with the consumer (None once completed)
    cell: Option<Rc<LocalCell<V>>>,
}
//
impl<V: 'static> LocalPromise<V> {
    /// Complete the operation with some result
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
    pub fn set_cancel_hook(&self, hook: impl FnOnce(bool) + 'static) {
        if let Some(cell) = &self.cell {
            let action = cell.state.borrow_mut().set_cancel_hook(Box::new(hook));
            perform(action);
        }
    }

    /// Check whether the consumer cancelled the operation
    pub fn is_cancelled(&self) -> bool {
        self.cell.as_ref().map_or(false, |cell| cell.state.borrow().is_cancelled())
    }

    /// If the operation was cancelled, tell whether interruption was allowed
    fn cancellation(&self) -> Option<bool> {
        self.cell.as_ref().and_then(|cell| cell.state.borrow().cancellation())
    }
}
//
impl<V: 'static> Drop for LocalPromise<V> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.complete(Err(Failure::from(Error::ProducerDropped)));
        }
    }
}
//
impl<V: 'static> fmt::Debug for LocalPromise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPromise")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}


/// Thread-local completion cell
struct LocalCell<V> {
    /// Current state of the operation
    state: RefCell<CompletionState<V, LocalCallback<V>, LocalHook>>,
}
//
impl<V: 'static> LocalCell<V> {
    /// Deliver the result of the operation
    fn complete(&self, result: AsyncResult<V>) {
        let action = self.state.borrow_mut().complete(result);
        perform(action);
    }

    /// Register the consumer callback
    fn subscribe(&self, callback: LocalCallback<V>) {
        let action = self.state.borrow_mut().subscribe(callback);
        perform(action);
    }

    /// Handle used by derived futures to cancel this operation
    fn cancel_handle(self: &Rc<Self>) -> LocalCancelHandle {
        let target: Rc<dyn LocalCancel> = self.clone();
        LocalCancelHandle { target: Some(Rc::downgrade(&target)) }
    }
}


/// Cancellation interface of thread-local cells, erasing their value type
trait LocalCancel {
    /// Request cancellation, telling whether it was effective
    fn cancel(&self, may_interrupt_if_running: bool) -> bool;
}
//
impl<V: 'static> LocalCancel for LocalCell<V> {
    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        let action = self.state.borrow_mut().cancel(may_interrupt_if_running);
        match action {
            Some(action) => {
                perform(action);
                true
            },
            None => false,
        }
    }
}


/// Weak back-reference from a derived local future to its source
#[derive(Clone, Default)]
struct LocalCancelHandle {
    target: Option<Weak<dyn LocalCancel>>,
}
//
impl LocalCancelHandle {
    /// Forward a cancellation request, if the source is still around
    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        self.target
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |target| target.cancel(may_interrupt_if_running))
    }
}


/// Consumer side of a thread-local asynchronous operation
#[must_use = "dropping a future discards the result of its operation"]
pub struct LocalFuture<V: 'static> {
    /// Either an already known result, or a link to a completion cell
    repr: LocalRepr<V>,
}


/// Internal representation of local futures
enum LocalRepr<V> {
    /// Pre-resolved operation
    Ready(AsyncResult<V>),

    /// Operation completed through a `LocalPromise`
    Pending(Rc<LocalCell<V>>),
}


impl<V: 'static> LocalFuture<V> {
    /// Local future of an operation which already succeeded
    pub fn success(value: V) -> Self {
        LocalFuture { repr: LocalRepr::Ready(Ok(value)) }
    }

    /// Local future of an operation which already failed
    pub fn failure(failure: impl Into<Failure>) -> Self {
        LocalFuture { repr: LocalRepr::Ready(Err(failure.into())) }
    }

    /// Schedule a callback to be run once the result is known
    pub fn on_result<F>(self, callback: F)
        where F: FnOnce(AsyncResult<V>) + 'static
    {
        match self.repr {
            LocalRepr::Ready(result) => {
                perform(Action::<V, F, fn(bool)>::Deliver(callback, result))
            },
            LocalRepr::Pending(cell) => cell.subscribe(Box::new(callback)),
        }
    }

    /// Request the cancellation of the operation
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        match &self.repr {
            LocalRepr::Ready(_) => false,
            LocalRepr::Pending(cell) => cell.cancel(may_interrupt_if_running),
        }
    }

    /// Check whether the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        match &self.repr {
            LocalRepr::Ready(_) => false,
            LocalRepr::Pending(cell) => cell.state.borrow().is_cancelled(),
        }
    }

    /// Check whether the operation reached a final state
    pub fn is_done(&self) -> bool {
        match &self.repr {
            LocalRepr::Ready(_) => true,
            LocalRepr::Pending(cell) => cell.state.borrow().is_final(),
        }
    }

    /// Weak handle to this operation, for cancellation purposes
    fn cancel_handle(&self) -> LocalCancelHandle {
        match &self.repr {
            LocalRepr::Ready(_) => LocalCancelHandle::default(),
            LocalRepr::Pending(cell) => cell.cancel_handle(),
        }
    }

    /// Derive a local future whose result is computed from this one's
    pub fn transform<U, F>(self, f: F) -> LocalFuture<U>
        where U: 'static,
              F: FnOnce(AsyncResult<V>) -> AsyncResult<U> + 'static
    {
        match self.repr {
            LocalRepr::Ready(result) => LocalFuture {
                repr: LocalRepr::Ready(catching(move || f(result)).and_then(|r| r)),
            },
            LocalRepr::Pending(cell) => {
                let (promise, future) = local_promise();
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

    /// Derive a local future from this one's result, and adopt it
    pub fn compose<U, F>(self, f: F) -> LocalFuture<U>
        where U: 'static,
              F: FnOnce(AsyncResult<V>) -> LocalFuture<U> + 'static
    {
        let cell = match self.repr {
            LocalRepr::Ready(result) => {
                return catching(move || f(result)).unwrap_or_else(LocalFuture::failure);
            },
            LocalRepr::Pending(cell) => cell,
        };

        let (promise, future) = local_promise();
        let live = Rc::new(RefCell::new(cell.cancel_handle()));
        let hook_live = live.clone();
        promise.set_cancel_hook(move |may_interrupt| {
            let target = hook_live.borrow().clone();
            target.cancel(may_interrupt);
        });
        cell.subscribe(Box::new(move |result| {
            let next = match catching(move || f(result)) {
                Ok(next) => next,
                Err(failure) => return promise.fail(failure),
            };
            *live.borrow_mut() = next.cancel_handle();
            if let Some(may_interrupt) = promise.cancellation() {
                next.cancel(may_interrupt);
            }
            next.on_result(move |result| promise.complete(result));
        }));
        future
    }

    /// Apply a function to the value of a successful operation
    pub fn map<U, F>(self, f: F) -> LocalFuture<U>
        where U: 'static,
              F: FnOnce(V) -> U + 'static
    {
        self.transform(move |result| result.map(f))
    }

    /// Chain another local operation after a successful one
    pub fn flat_map<U, F>(self, f: F) -> LocalFuture<U>
        where U: 'static,
              F: FnOnce(V) -> LocalFuture<U> + 'static
    {
        self.compose(move |result| match result {
            Ok(value) => f(value),
            Err(failure) => LocalFuture::failure(failure),
        })
    }

    /// Recover from failures whose cause is of kind `E`
    pub fn map_catch<E, F>(self, f: F) -> LocalFuture<V>
        where E: StdError + 'static,
              F: FnOnce(Failure) -> V + 'static
    {
        self.transform(move |result| match result {
            Err(failure) if failure.is::<E>() => Ok(f(failure)),
            other => other,
        })
    }

    /// Run a side effect once the operation is over, whatever its outcome
    pub fn and<F>(self, f: F) -> LocalFuture<V>
        where F: FnOnce() + 'static
    {
        self.transform(move |result| match (result, catching(f)) {
            (result, Ok(())) => result,
            (Ok(_), Err(side_effect)) => Err(side_effect),
            (Err(failure), Err(side_effect)) => Err(failure.with_suppressed(side_effect)),
        })
    }
}
//
impl<V: 'static> fmt::Debug for LocalFuture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.repr {
            LocalRepr::Ready(Ok(_)) => "succeeded",
            LocalRepr::Ready(Err(_)) => "failed",
            LocalRepr::Pending(_) => "pending",
        };
        f.debug_struct("LocalFuture").field("state", &state).finish()
    }
}
