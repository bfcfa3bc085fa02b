use std::time::Duration;

use crate::error::Result;
use crate::job::Job;

/// A blocking job source consumed by the worker pool.
///
/// The listener hands one value to every forked worker, so implementations
/// must connect lazily on first use: a broker connection opened before
/// `fork` would be shared by every child.
pub trait Queue {
    /// Pop one job, waiting up to `timeout` for one to arrive.
    ///
    /// `Duration::ZERO` blocks until a job is available. A successful pop
    /// also becomes [`Queue::current`].
    fn dequeue(&mut self, timeout: Duration) -> Result<Option<Job>>;

    /// Push a job onto the list named `key`.
    fn enqueue(&mut self, key: &str, payload: &[u8]) -> Result<()>;

    /// The job most recently returned by [`Queue::dequeue`].
    fn current(&self) -> Option<&Job>;
}

/// Receives every job a worker dequeues.
///
/// Observers run inline in the worker loop, in registration order, and must
/// not block unboundedly. They read the job through `queue.current()` and may
/// enqueue follow-up work (including retries, which the supervisor never does
/// on its own).
pub trait Observer {
    fn update(&mut self, queue: &mut dyn Queue, slot: usize) -> Result<()>;
}
