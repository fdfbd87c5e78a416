//! A worker's private double-ended queue.
//!
//! One queue per worker rather than a shared injector, each serialized
//! through its own mutex rather than a lock-free deque — concurrent
//! access to a worker's queue is expected to be rare (a steal, or an
//! external submission) and not worth a lock-free structure.

use std::collections::VecDeque;
use std::sync::Mutex;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Owner-local operations (push, pop) use the near end, LIFO. Steal
/// operations use the far end, FIFO from the stealer's perspective.
pub(crate) struct WorkerQueue {
    inner: Mutex<VecDeque<Job>>,
}

impl WorkerQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Push onto the near end. Used both by the owning worker and by an
    /// external submitter routing work to this queue.
    pub(crate) fn push_near(&self, job: Job) {
        self.inner.lock().unwrap().push_back(job);
    }

    /// Pop from the near end (LIFO for the owner).
    pub(crate) fn pop_near(&self) -> Option<Job> {
        self.inner.lock().unwrap().pop_back()
    }

    /// Pop from the far end (FIFO from a stealer's perspective).
    pub(crate) fn steal_far(&self) -> Option<Job> {
        self.inner.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
