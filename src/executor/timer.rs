//! Deadline tracking for delayed and periodic work
//!
//! `DeadlineHeap` orders work by deadline, and is used directly by event
//! loops, which fold timer management into their polling loop. The thread
//! pool has no such loop, so it uses a `Timer`, which runs a `DeadlineHeap`
//! on a dedicated thread and hands due work over to the pool.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{Admission, Work};


/// Work waiting for its deadline
struct Entry {
    /// Time at which the work is due
    deadline: Instant,

    /// Insertion order, which breaks ties between equal deadlines
    seq: u64,

    /// Work to be done
    work: Work,
}
//
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
//
impl Eq for Entry {}
//
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
//
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}


/// Collection of work, ordered by deadline (FIFO among equal deadlines)
pub(crate) struct DeadlineHeap {
    /// Pending entries, earliest deadline on top
    entries: BinaryHeap<Reverse<Entry>>,

    /// Sequence number of the next entry
    next_seq: u64,
}
//
impl DeadlineHeap {
    /// Create an empty heap
    pub fn new() -> Self {
        DeadlineHeap {
            entries: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Add work which is due at some deadline
    pub fn push(&mut self, deadline: Instant, work: Work) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Reverse(Entry { deadline, seq, work }));
    }

    /// Earliest deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Extract all work which is due at the given time, in deadline order
    pub fn pop_due(&mut self, now: Instant) -> Vec<Work> {
        let mut due = Vec::new();
        while self.next_deadline().map_or(false, |deadline| deadline <= now) {
            if let Some(Reverse(entry)) = self.entries.pop() {
                due.push(entry.work);
            }
        }
        due
    }

    /// Extract all remaining work, whatever its deadline
    pub fn drain(&mut self) -> Vec<Work> {
        self.entries.drain().map(|Reverse(entry)| entry.work).collect()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}


/// Timer thread, which hands work over to a callback once it is due
pub(crate) struct Timer {
    /// State shared with the timer thread
    shared: Arc<TimerShared>,

    /// Timer thread, once started
    thread: Mutex<Option<JoinHandle<()>>>,
}


/// State shared between a timer and its thread
struct TimerShared {
    /// Pending work and stop flag (mutex-protected)
    state: Mutex<TimerState>,

    /// Condition variable used to wake the timer thread up
    wakeup_cv: Condvar,
}


/// Mutable timer state
struct TimerState {
    /// Pending work
    heap: DeadlineHeap,

    /// Truth that the timer was stopped and rejects new work
    stopped: bool,
}


impl Timer {
    /// Create a timer, whose thread is not started yet
    pub fn new() -> Self {
        Timer {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    heap: DeadlineHeap::new(),
                    stopped: false,
                }),
                wakeup_cv: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the timer thread, which passes due work to `fire`
    pub fn start<F>(&self, name: String, fire: F) -> io::Result<()>
        where F: Fn(Work) + Send + 'static
    {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || timer_loop(&shared, fire))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Schedule work at some deadline, or give it back if the timer stopped
    pub fn schedule(&self, deadline: Instant, work: Work) -> Result<(), Work> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(work);
        }

        // Only wake the timer thread up if its next deadline changed
        let earliest = state.heap.next_deadline().map_or(true, |next| deadline < next);
        state.heap.push(deadline, work);
        if earliest {
            self.shared.wakeup_cv.notify_one();
        }
        Ok(())
    }

    /// Number of pending entries
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the timer, rejecting all pending work, and join its thread
    pub fn stop(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.wakeup_cv.notify_all();
            state.heap.drain()
        };
        tracing::trace!(discarded = discarded.len(), "timer stopped");
        for work in discarded {
            work(Admission::Rejected);
        }

        // The timer thread may stop itself through `fire`, it cannot join
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}


/// Main loop of the timer thread
fn timer_loop(shared: &TimerShared, fire: impl Fn(Work)) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }

        // Fire due work without holding the lock...
        let due = state.heap.pop_due(Instant::now());
        if !due.is_empty() {
            drop(state);
            for work in due {
                fire(work);
            }
            state = shared.state.lock();
            continue;
        }

        // ...then sleep until the next deadline or until new work arrives
        match state.heap.next_deadline() {
            Some(deadline) => {
                shared.wakeup_cv.wait_until(&mut state, deadline);
            },
            None => shared.wakeup_cv.wait(&mut state),
        }
    }
}
