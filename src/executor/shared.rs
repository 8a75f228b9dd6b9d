//! Reference-counted scheduler ownership
//!
//! A scheduler which is used by several independent components raises the
//! question of who gets to shut it down. `SharedScheduler` answers it with
//! reference counting: every component holds a lease, and the scheduler is
//! shut down when the last lease is released.
//!
//! This is also how the process-wide default scheduler is handed out. It is
//! built lazily on first use, and built again if it is needed after all of
//! its previous owners released it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::error::BuildError;
use crate::future::Future;
use super::pool::ThreadPoolScheduler;
use super::Scheduler;


/// Lease on a scheduler shared by several owners
///
/// Dropping a lease releases it. Shutting the underlying scheduler down
/// directly, rather than through `release`, is a bug since other owners may
/// still be using it.
pub struct SharedScheduler<S: Scheduler + 'static> {
    /// Shared scheduler
    scheduler: Arc<S>,

    /// Number of outstanding leases
    owners: Arc<AtomicUsize>,

    /// Truth that this lease was released already
    released: bool,
}
//
impl<S: Scheduler + 'static> SharedScheduler<S> {
    /// Start sharing a scheduler, returning the first lease
    pub fn new(scheduler: S) -> Self {
        Self::from_arc(Arc::new(scheduler))
    }

    /// Start sharing a scheduler which is already reference-counted
    pub fn from_arc(scheduler: Arc<S>) -> Self {
        SharedScheduler {
            scheduler,
            owners: Arc::new(AtomicUsize::new(1)),
            released: false,
        }
    }

    /// Get another lease on the same scheduler
    pub fn acquire(&self) -> Self {
        self.owners.fetch_add(1, Ordering::AcqRel);
        SharedScheduler {
            scheduler: self.scheduler.clone(),
            owners: self.owners.clone(),
            released: false,
        }
    }

    /// Give this lease back
    ///
    /// Releasing the last lease shuts the scheduler down, and the returned
    /// future tells how the shutdown went. Otherwise, it is already complete.
    pub fn release(mut self) -> Future<()> {
        self.release_lease()
    }

    /// Number of outstanding leases
    pub fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }

    /// Underlying scheduler, as needed by scheduler-based combinators
    pub fn scheduler(&self) -> &Arc<S> {
        &self.scheduler
    }

    /// Give this lease back, shutting down if it was the last one
    fn release_lease(&mut self) -> Future<()> {
        if std::mem::replace(&mut self.released, true) {
            return Future::done();
        }
        if self.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("last scheduler lease released, shutting down");
            self.scheduler.shutdown()
        } else {
            Future::done()
        }
    }
}
//
impl<S: Scheduler + 'static> Deref for SharedScheduler<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.scheduler
    }
}
//
impl<S: Scheduler + 'static> Drop for SharedScheduler<S> {
    fn drop(&mut self) {
        let _ = self.release_lease();
    }
}
//
impl<S: Scheduler + fmt::Debug + 'static> fmt::Debug for SharedScheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("scheduler", &self.scheduler)
            .field("owners", &self.owners())
            .finish()
    }
}


/// Process-wide default scheduler, if one was built and is still leased
static DEFAULT: Mutex<Option<DefaultSlot>> = Mutex::new(None);


/// Tracking state of the default scheduler
///
/// The slot itself does not own a lease, so that the scheduler is shut down as
/// soon as the last user releases it.
struct DefaultSlot {
    /// Default scheduler, unless it already went away
    scheduler: Weak<ThreadPoolScheduler>,

    /// Lease count of the default scheduler
    owners: Arc<AtomicUsize>,
}
//
impl DefaultSlot {
    /// Get a new lease, unless the scheduler is released or shutting down
    fn try_acquire(&self) -> Option<SharedScheduler<ThreadPoolScheduler>> {
        let scheduler = self.scheduler.upgrade()?;
        self.owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owners| {
                (owners > 0).then(|| owners + 1)
            })
            .ok()?;
        Some(SharedScheduler {
            scheduler,
            owners: self.owners.clone(),
            released: false,
        })
    }
}


/// Get a lease on the process-wide default scheduler
///
/// The default scheduler is a thread pool, configured from the environment
/// (see `SchedulerConfig::from_env`). It is built on first use, and built
/// again if all of its previous leases were released.
pub fn default_scheduler() -> Result<SharedScheduler<ThreadPoolScheduler>, BuildError> {
    let mut slot = DEFAULT.lock();
    if let Some(lease) = slot.as_ref().and_then(DefaultSlot::try_acquire) {
        return Ok(lease);
    }

    tracing::debug!("building the default scheduler");
    let config = SchedulerConfig::from_env()?;
    let lease = SharedScheduler::new(ThreadPoolScheduler::new(config)?);
    *slot = Some(DefaultSlot {
        scheduler: Arc::downgrade(&lease.scheduler),
        owners: lease.owners.clone(),
    });
    Ok(lease)
}
