//! Cancellation of asynchronous operations
//!
//! Whatever the way a client has chosen to synchronize with an asynchronous
//! operation, one service which is common to all of them is the ability to
//! request its cancellation.
//!
//! Note that cancellation is a request, not an order. Some operations cannot
//! be interrupted once they started running, and the producer of a result may
//! be racing with the cancellation request. What we guarantee is that once an
//! operation is successfully cancelled, its consumer is told about it through
//! an `Error::Cancelled` failure and will never see another result.
//!
//! Futures derived from other futures by a combinator do not own their
//! upstream. They only keep a `CancelHandle` to it, which is a weak reference
//! that becomes inert once the upstream operation has completed.

use std::fmt;
use std::sync::{Arc, Weak};


/// Features which all cancellable asynchronous operations share
pub trait Cancel: Send + Sync {
    /// Request the cancellation of the operation
    ///
    /// `may_interrupt_if_running` tells whether an operation which is already
    /// running may be interrupted, as opposed to only preventing it from
    /// starting. Returns whether this call cancelled the operation, which is
    /// false if it was already completed or cancelled.
    fn cancel(&self, may_interrupt_if_running: bool) -> bool;

    /// Check whether the operation was cancelled
    fn is_cancelled(&self) -> bool;
}


/// Weak back-reference used to forward cancellation requests
#[derive(Clone, Default)]
pub struct CancelHandle {
    /// Operation to be cancelled, if any and if still alive
    target: Option<Weak<dyn Cancel>>,
}
//
impl CancelHandle {
    /// Handle which cannot cancel anything, used for pre-resolved results
    pub fn inert() -> Self {
        CancelHandle { target: None }
    }

    /// Build a handle pointing to some cancellable operation
    pub(crate) fn to<C: Cancel + 'static>(target: &Arc<C>) -> Self {
        let target: Weak<C> = Arc::downgrade(target);
        CancelHandle { target: Some(target as Weak<dyn Cancel>) }
    }

    /// Forward a cancellation request to the target, if it is still alive
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        self.target
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |target| target.cancel(may_interrupt_if_running))
    }

    /// Check whether the target was cancelled
    ///
    /// A target which has already been dropped completed long ago, and can
    /// thus no longer be cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.target
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |target| target.is_cancelled())
    }
}
//
impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alive = self.target
                        .as_ref()
                        .map_or(false, |target| target.strong_count() > 0);
        f.debug_struct("CancelHandle").field("alive", &alive).finish()
    }
}
