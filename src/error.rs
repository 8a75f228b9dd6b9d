//! Facilities to represent why an asynchronous operation did not succeed
//!
//! The outcome of every asynchronous operation is an `AsyncResult`, which is
//! nothing more than a standard `Result` whose error side is a `Failure`. A
//! failure wraps an arbitrary error value (its "cause"), along with any number
//! of secondary failures which occurred while the first one was being handled
//! (cleanup code which failed too, shutdown listeners which misbehaved...).
//!
//! Failures are matched by kind through a downcast of their cause, which is
//! how the recovery combinators of `Future` decide whether they apply.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;


/// Outcome of an asynchronous operation
pub type AsyncResult<V> = Result<V, Failure>;


/// Causes of failure which originate from this crate's own machinery
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation was cancelled before it produced a result
    #[error("operation was cancelled")]
    Cancelled,

    /// The producer side went away without ever completing the operation
    #[error("producer dropped without completing the operation")]
    ProducerDropped,

    /// User code invoked by the machinery panicked
    #[error("user code panicked: {0}")]
    Panicked(String),

    /// The scheduler no longer accepts work
    #[error("scheduler is shut down, task rejected")]
    Rejected,

    /// Some shutdown listeners failed, their failures are suppressed causes
    #[error("{0} shutdown listener(s) failed")]
    ShutdownListeners(usize),

    /// Worker threads were still running when the hard timeout elapsed
    #[error("scheduler threads did not terminate within {0:?}")]
    TerminationTimeout(Duration),

    /// A blocking wait was attempted on a thread which runs an event loop
    #[error("blocking wait on an event-loop thread would deadlock the reactor")]
    WouldDeadlock,
}


/// Failure of an asynchronous operation
///
/// A failure is cheap to clone, since its cause is reference-counted. Like
/// `anyhow::Error`, it deliberately does not implement `std::error::Error`
/// itself, so that any error type can be converted into it with `?` or
/// `.into()`.
#[derive(Clone)]
pub struct Failure {
    /// Primary reason why the operation failed
    cause: Arc<dyn StdError + Send + Sync + 'static>,

    /// Failures which occurred while this one was being propagated
    suppressed: Vec<Failure>,
}
//
impl Failure {
    /// Build a failure from an error value
    pub fn new<E>(cause: E) -> Self
        where E: StdError + Send + Sync + 'static
    {
        Failure {
            cause: Arc::new(cause),
            suppressed: Vec::new(),
        }
    }

    /// Build a failure from an already type-erased error
    pub fn from_boxed(cause: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        Failure {
            cause: Arc::from(cause),
            suppressed: Vec::new(),
        }
    }

    /// Build a failure from a panic payload, as caught by `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Failure::new(Error::Panicked(message))
    }

    /// Primary cause of this failure
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }

    /// Check whether the cause of this failure is of kind `E`
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.cause.is::<E>()
    }

    /// Access the cause of this failure as an `E`, if it is one
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }

    /// Check whether this failure denotes a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.downcast_ref::<Error>(), Some(Error::Cancelled))
    }

    /// Failures which were suppressed while propagating this one
    pub fn suppressed(&self) -> &[Failure] {
        &self.suppressed
    }

    /// Record another failure as suppressed by this one
    pub fn add_suppressed(&mut self, other: Failure) {
        self.suppressed.push(other);
    }

    /// Builder-style variant of `add_suppressed`
    pub fn with_suppressed(mut self, other: Failure) -> Self {
        self.add_suppressed(other);
        self
    }
}
//
impl<E> From<E> for Failure
    where E: StdError + Send + Sync + 'static
{
    fn from(cause: E) -> Self {
        Failure::new(cause)
    }
}
//
impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("cause", &self.cause)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}
//
impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}


/// Failure to build a scheduler
#[derive(Debug, Error)]
pub enum BuildError {
    /// The requested configuration is not usable
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The operating system refused a thread or a poller
    #[error("failed to set up scheduler resources: {0}")]
    Io(#[from] io::Error),
}


/// Run user code, turning a panic into a failure
pub(crate) fn catching<R>(f: impl FnOnce() -> R) -> AsyncResult<R> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .map_err(Failure::from_panic)
}
