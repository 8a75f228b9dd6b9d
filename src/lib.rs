//! Asynchronous operation monitoring
//!
//! Picture yourself in a situation where you want to delegate work to another
//! software entity, such as a thread pool, an event loop, or an IO device. You
//! know that the work is going to take some time, and you have other things
//! to do meanwhile, so you would rather not wait for its completion. But you
//! would like a way to know when it is done, and to manage its errors.
//!
//! This crate represents such asynchronous operations as a pair of objects:
//!
//! - A `Promise`, held by whoever carries out the operation, which is used to
//!   publish its result exactly once.
//! - A `Future`, held by whoever is interested in the result, which can be
//!   monitored through callbacks, chained with other operations through
//!   combinators, cancelled, or (sparingly) waited for.
//!
//! Work which should not run inside of a callback is handed over to a
//! `Scheduler`. The crate provides an elastic thread pool and a group of
//! single-threaded event loops, both of which follow the same shutdown
//! protocol, along with a process-wide default scheduler that is shared by
//! reference counting.
//!
//! Finally, a `FutureSynchronizer` runs asynchronous operations one at a time,
//! and the `local` module provides a promise/future flavor for code which
//! never leaves a single thread.

pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod local;
pub mod promise;
mod state;
pub mod synchronizer;

pub use crate::cancel::{Cancel, CancelHandle};
pub use crate::config::{ConfigError, SchedulerConfig};
pub use crate::error::{AsyncResult, BuildError, Error, Failure};
pub use crate::executor::event_loop::{EventLoop, EventLoopScheduler};
pub use crate::executor::pool::ThreadPoolScheduler;
pub use crate::executor::shared::{default_scheduler, SharedScheduler};
pub use crate::executor::{ListenerId, Scheduler, SchedulerExt, ShutdownListener};
pub use crate::future::Future;
pub use crate::local::{local_promise, LocalFuture, LocalPromise};
pub use crate::promise::{promise, Promise};
pub use crate::synchronizer::FutureSynchronizer;
