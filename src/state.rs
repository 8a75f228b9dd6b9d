//! State machine shared by every completion cell
//!
//! Any completion cell, be it thread-safe or confined to a single thread, goes
//! through the same small state machine. It starts in a pending state where
//! the consumer callback and the producer result race each other, and ends up
//! in a terminal state once either the result was handed over or the operation
//! was cancelled.
//!
//! Here are the possible state transitions:
//!
//! - Pending -> Pending' (callback or cancel hook registered)
//! - Pending -> Buffered (completed before anyone subscribed)
//! - Pending / Buffered -> Delivered (result handed over to the consumer)
//! - Pending -> Cancelled
//!
//! The state machine itself never runs user code. Each transition returns an
//! `Action` describing what must be invoked, which the owning cell performs
//! once it has released whatever lock or borrow protects the state.

use crate::error::{AsyncResult, Error, Failure};


/// Current state of a completion cell
///
/// `C` is the type of the consumer callback and `H` the type of the cancel
/// hook, so that thread-safe and thread-local cells can pick `Send` and
/// non-`Send` boxed closures respectively.
pub(crate) enum CompletionState<V, C, H> {
    /// Neither completed nor cancelled yet
    Pending {
        /// Consumer callback, if one subscribed before completion
        callback: Option<C>,

        /// Hook used to interrupt the underlying operation on cancellation
        hook: Option<H>,
    },

    /// Completed, but nobody subscribed yet
    Buffered(AsyncResult<V>),

    /// Completed, and the result was handed over to the consumer
    Delivered,

    /// Cancelled before completion
    Cancelled {
        /// Whether interruption of a running operation was allowed
        may_interrupt: bool,

        /// Whether the cancellation failure was already handed over
        delivered: bool,
    },
}


/// Side effect which a cell must perform after a state transition
pub(crate) enum Action<V, C, H> {
    /// Nothing to do
    Nothing,

    /// Invoke the consumer callback with this result
    Deliver(C, AsyncResult<V>),

    /// Invoke the cancel hook (if any), then notify the consumer (if any)
    Cancel {
        hook: Option<H>,
        callback: Option<C>,
        may_interrupt: bool,
    },

    /// Invoke a cancel hook which was installed after cancellation
    Interrupt(H, bool),
}


impl<V, C, H> CompletionState<V, C, H> {
    /// Initial state of every completion cell
    pub fn new() -> Self {
        CompletionState::Pending { callback: None, hook: None }
    }

    /// Check if the state is final (i.e. won't change anymore)
    pub fn is_final(&self) -> bool {
        !matches!(*self, CompletionState::Pending { .. })
    }

    /// Check if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(*self, CompletionState::Cancelled { .. })
    }

    /// If the operation was cancelled, tell whether interruption was allowed
    pub fn cancellation(&self) -> Option<bool> {
        match *self {
            CompletionState::Cancelled { may_interrupt, .. } => Some(may_interrupt),
            _ => None,
        }
    }

    /// Producer side: the operation has produced its result
    ///
    /// Completing an operation twice is a bug in the producer and is treated
    /// as such. Completing a cancelled operation is expected, since producers
    /// race with cancellation, and the result is silently dropped.
    pub fn complete(&mut self, result: AsyncResult<V>) -> Action<V, C, H> {
        match std::mem::replace(self, CompletionState::Delivered) {
            CompletionState::Pending { callback: Some(callback), .. } => {
                Action::Deliver(callback, result)
            },
            CompletionState::Pending { callback: None, .. } => {
                *self = CompletionState::Buffered(result);
                Action::Nothing
            },
            cancelled @ CompletionState::Cancelled { .. } => {
                *self = cancelled;
                Action::Nothing
            },
            CompletionState::Buffered(_) | CompletionState::Delivered => {
                panic!("asynchronous operation completed twice")
            },
        }
    }

    /// Consumer side: register the callback which will receive the result
    ///
    /// Only one consumer is supported. Registering a second callback while the
    /// operation is pending replaces the first one.
    pub fn subscribe(&mut self, new_callback: C) -> Action<V, C, H> {
        // Callback registered first: keep it until the result shows up
        if let CompletionState::Pending { callback, .. } = self {
            *callback = Some(new_callback);
            return Action::Nothing;
        }

        // Cancelled operations still owe their consumer one notification
        if let CompletionState::Cancelled { delivered, .. } = self {
            assert!(!*delivered, "asynchronous operation result consumed twice");
            *delivered = true;
            return Action::Deliver(new_callback,
                                   Err(Failure::from(Error::Cancelled)));
        }

        // Result produced first: hand it over right away
        match std::mem::replace(self, CompletionState::Delivered) {
            CompletionState::Buffered(result) => {
                Action::Deliver(new_callback, result)
            },
            _ => panic!("asynchronous operation result consumed twice"),
        }
    }

    /// Consumer side: request cancellation of the operation
    pub fn cancel(&mut self, may_interrupt: bool) -> Option<Action<V, C, H>> {
        if self.is_final() {
            return None;
        }
        let previous = std::mem::replace(
            self,
            CompletionState::Cancelled { may_interrupt, delivered: false }
        );
        let CompletionState::Pending { callback, hook } = previous else {
            unreachable!()
        };
        if callback.is_some() {
            *self = CompletionState::Cancelled { may_interrupt, delivered: true };
        }
        Some(Action::Cancel { hook, callback, may_interrupt })
    }

    /// Producer side: install the hook which interrupts the operation
    ///
    /// A hook installed after cancellation must run right away, whereas a hook
    /// installed after completion is useless and simply dropped.
    pub fn set_cancel_hook(&mut self, new_hook: H) -> Action<V, C, H> {
        match self {
            CompletionState::Pending { hook, .. } => {
                *hook = Some(new_hook);
                Action::Nothing
            },
            CompletionState::Cancelled { may_interrupt, .. } => {
                Action::Interrupt(new_hook, *may_interrupt)
            },
            CompletionState::Buffered(_) | CompletionState::Delivered => {
                Action::Nothing
            },
        }
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    type TestState = CompletionState<u32, &'static str, &'static str>;

    /// Check the initial state
    #[test]
    fn initial_state() {
        let state = TestState::new();
        assert!(!state.is_final());
        assert!(!state.is_cancelled());
        assert_eq!(state.cancellation(), None);
    }

    /// Check that a result completed before subscription is buffered
    #[test]
    fn complete_then_subscribe() {
        let mut state = TestState::new();
        assert!(matches!(state.complete(Ok(42)), Action::Nothing));
        assert!(state.is_final());
        match state.subscribe("cb") {
            Action::Deliver("cb", Ok(42)) => {},
            _ => panic!("buffered result was not delivered"),
        }
    }

    /// Check that a callback registered before completion is buffered
    #[test]
    fn subscribe_then_complete() {
        let mut state = TestState::new();
        assert!(matches!(state.subscribe("cb"), Action::Nothing));
        assert!(!state.is_final());
        match state.complete(Ok(24)) {
            Action::Deliver("cb", Ok(24)) => {},
            _ => panic!("buffered callback was not invoked"),
        }
    }

    /// Check that completing twice is fatal
    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion() {
        let mut state = TestState::new();
        let _ = state.complete(Ok(1));
        let _ = state.complete(Ok(2));
    }

    /// Check that cancellation hands the hook and callback over, only once
    #[test]
    fn cancellation() {
        let mut state = TestState::new();
        let _ = state.subscribe("cb");
        let _ = state.set_cancel_hook("hook");
        match state.cancel(true) {
            Some(Action::Cancel { hook: Some("hook"),
                                  callback: Some("cb"),
                                  may_interrupt: true }) => {},
            _ => panic!("cancellation did not release hook and callback"),
        }
        assert!(state.is_cancelled());
        assert_eq!(state.cancellation(), Some(true));
        assert!(state.cancel(true).is_none());

        // Completion after cancellation is silently ignored
        assert!(matches!(state.complete(Ok(3)), Action::Nothing));
        assert!(state.is_cancelled());
    }

    /// Check that a late subscriber to a cancelled operation is notified
    #[test]
    fn subscribe_after_cancel() {
        let mut state = TestState::new();
        assert!(state.cancel(false).is_some());
        match state.subscribe("cb") {
            Action::Deliver("cb", Err(failure)) => assert!(failure.is_cancelled()),
            _ => panic!("late subscriber was not told about cancellation"),
        }
    }

    /// Check that a hook installed after cancellation runs immediately
    #[test]
    fn late_hook() {
        let mut state = TestState::new();
        let _ = state.cancel(true);
        assert!(matches!(state.set_cancel_hook("hook"),
                         Action::Interrupt("hook", true)));

        let mut state = TestState::new();
        let _ = state.complete(Ok(0));
        assert!(matches!(state.set_cancel_hook("hook"), Action::Nothing));
    }

    /// Check that completed operations cannot be cancelled
    #[test]
    fn cancel_after_completion() {
        let mut state = TestState::new();
        let _ = state.complete(Ok(5));
        assert!(state.cancel(true).is_none());
        assert!(!state.is_cancelled());
    }
}
