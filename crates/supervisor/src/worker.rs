use std::time::Duration;

use jobqueue::{Observer, Queue, QueueError};
use nix::sys::signal::Signal;
use nix::unistd::{Pid, getppid};
use tracing::{debug, error, info, warn};

use crate::control::ProcessControl;
use crate::error::SupervisorResult;
use crate::signals::WORKER_SIGNALS;

/// How long one dequeue waits before the loop checks for signals again.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Who a worker is: its slot in the pool and the listener that forked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub slot: usize,
    pub parent_pid: Pid,
}

#[derive(Debug, thiserror::Error)]
enum JobFailure {
    #[error("dequeue failed: {0}")]
    Dequeue(#[source] QueueError),

    #[error("observer #{index} failed on job from {key:?}: {source}")]
    Observer {
        index: usize,
        key: String,
        #[source]
        source: QueueError,
    },
}

/// The consuming side of the pool, run inside a forked child.
///
/// Pops jobs one at a time and hands each to every attached observer. Stops
/// on any cared signal, once `request_num` jobs have been handled (so the
/// listener replaces it with a fresh process), or when its listener dies.
pub struct Worker<'a> {
    identity: WorkerIdentity,
    queue: &'a mut dyn Queue,
    observers: Vec<&'a mut dyn Observer>,
    request_num: usize,
    processed: usize,
    running: bool,
}

impl<'a> Worker<'a> {
    pub fn new(identity: WorkerIdentity, queue: &'a mut dyn Queue, request_num: usize) -> Self {
        Self {
            identity,
            queue,
            observers: Vec::new(),
            request_num,
            processed: 0,
            running: false,
        }
    }

    /// Observers are notified in the order they were attached.
    pub fn attach(&mut self, observer: &'a mut dyn Observer) {
        self.observers.push(observer);
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Consume jobs until stopped. Returns the number of jobs handled.
    pub fn run(&mut self) -> SupervisorResult<usize> {
        self.running = true;
        self.install_signals()?;
        debug!(slot = self.identity.slot, parent = %self.identity.parent_pid, "worker running");

        while self.running {
            if let Err(e) = self.consume_one() {
                error!(slot = self.identity.slot, error = %e, "job failed");
            }
            if self.running {
                self.dispatch_signals()?;
            }
        }
        Ok(self.processed)
    }

    /// Leave the loop after the current iteration. Signals revert to their
    /// default action, so a second TERM kills the worker outright.
    pub fn stop(&mut self) {
        self.running = false;
        if let Err(e) = self.restore_signals() {
            warn!(slot = self.identity.slot, error = %e, "failed to restore signal handlers");
        }
    }

    fn consume_one(&mut self) -> Result<(), JobFailure> {
        let Some(job) = self
            .queue
            .dequeue(DEQUEUE_TIMEOUT)
            .map_err(JobFailure::Dequeue)?
        else {
            return Ok(());
        };
        debug!(slot = self.identity.slot, key = %job.key, bytes = job.payload.len(), "dequeued job");

        // A failed job still counts towards the quota.
        let outcome = self.notify(&job.key);
        self.processed += 1;
        if self.processed >= self.request_num {
            info!(
                slot = self.identity.slot,
                processed = self.processed,
                "request quota reached, recycling"
            );
            self.stop();
        }
        outcome
    }

    fn notify(&mut self, key: &str) -> Result<(), JobFailure> {
        let slot = self.identity.slot;
        for (index, observer) in self.observers.iter_mut().enumerate() {
            observer
                .update(&mut *self.queue, slot)
                .map_err(|source| JobFailure::Observer {
                    index,
                    key: key.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl ProcessControl for Worker<'_> {
    fn cared_signals(&self) -> &'static [Signal] {
        WORKER_SIGNALS
    }

    /// Any cared signal stops the worker.
    fn with_signals(&mut self) -> SupervisorResult<()> {
        if let Some(signal) = self.next_signal() {
            info!(slot = self.identity.slot, signal = signal.as_str(), "stopping on signal");
            self.stop();
        }
        Ok(())
    }

    /// The dequeue timeout already paces the loop.
    fn blank_signal(&mut self) {}

    /// A worker whose listener is gone has been re-parented; stop instead of
    /// consuming jobs nobody supervises.
    fn dispatch_signals(&mut self) -> SupervisorResult<()> {
        let parent = getppid();
        if parent != self.identity.parent_pid {
            warn!(
                slot = self.identity.slot,
                expected = %self.identity.parent_pid,
                actual = %parent,
                "listener is gone, stopping"
            );
            self.stop();
            return Ok(());
        }
        self.dispatch_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{TEST_LOCK, pending};
    use jobqueue::{Job, MemoryQueue};
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, raise, sigaction};
    use std::sync::MutexGuard;

    /// Sole use of the process-wide handlers, starting from an empty queue.
    fn exclusive() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        pending().clear();
        guard
    }

    fn identity(slot: usize) -> WorkerIdentity {
        WorkerIdentity {
            slot,
            parent_pid: getppid(),
        }
    }

    fn filled(jobs: &[&str]) -> MemoryQueue {
        let mut queue = MemoryQueue::new(["q1"]);
        for job in jobs {
            queue.enqueue("q1", job.as_bytes()).unwrap();
        }
        queue
    }

    /// Records every job it sees along with the slot it was told.
    #[derive(Default)]
    struct Collect {
        seen: Vec<(Job, usize)>,
    }

    impl Observer for Collect {
        fn update(&mut self, queue: &mut dyn Queue, slot: usize) -> jobqueue::Result<()> {
            let job = queue
                .current()
                .cloned()
                .ok_or_else(|| QueueError::Observer("no current job".into()))?;
            self.seen.push((job, slot));
            Ok(())
        }
    }

    struct Fail;

    impl Observer for Fail {
        fn update(&mut self, _queue: &mut dyn Queue, _slot: usize) -> jobqueue::Result<()> {
            Err(QueueError::Observer("boom".into()))
        }
    }

    /// Raises a signal at the worker while handling the first job.
    struct RaiseOnce(Option<Signal>);

    impl Observer for RaiseOnce {
        fn update(&mut self, _queue: &mut dyn Queue, _slot: usize) -> jobqueue::Result<()> {
            if let Some(signal) = self.0.take() {
                raise(signal).map_err(|e| QueueError::Observer(e.to_string()))?;
            }
            Ok(())
        }
    }

    #[test]
    fn recycles_after_request_quota() {
        let _guard = exclusive();
        let mut queue = filled(&["a", "b", "c"]);
        let mut collect = Collect::default();

        let mut worker = Worker::new(identity(2), &mut queue, 3);
        worker.attach(&mut collect);
        let processed = worker.run().unwrap();

        assert_eq!(processed, 3);
        assert!(!worker.is_running());
        let payloads: Vec<String> = collect
            .seen
            .iter()
            .map(|(job, _)| job.payload_lossy().into_owned())
            .collect();
        assert_eq!(payloads, ["a", "b", "c"]);
        assert!(collect.seen.iter().all(|(_, slot)| *slot == 2));
    }

    #[test]
    fn quota_leaves_remaining_jobs_queued() {
        let _guard = exclusive();
        let mut queue = filled(&["a", "b", "c", "d", "e"]);
        let mut collect = Collect::default();

        let mut worker = Worker::new(identity(0), &mut queue, 2);
        worker.attach(&mut collect);
        assert_eq!(worker.run().unwrap(), 2);
        drop(worker);

        assert_eq!(collect.seen.len(), 2);
        assert_eq!(queue.len("q1"), 3);
    }

    #[test]
    fn orphaned_worker_stops_after_current_job() {
        let _guard = exclusive();
        let mut queue = filled(&["a", "b", "c"]);
        let mut collect = Collect::default();

        let orphan = WorkerIdentity {
            slot: 1,
            parent_pid: Pid::from_raw(i32::MAX),
        };
        let mut worker = Worker::new(orphan, &mut queue, 100);
        worker.attach(&mut collect);
        assert_eq!(worker.run().unwrap(), 1);
        drop(worker);

        assert_eq!(collect.seen.len(), 1);
        assert_eq!(queue.len("q1"), 2);
    }

    #[test]
    fn failing_observer_is_logged_and_loop_continues() {
        let _guard = exclusive();
        let mut queue = filled(&["a", "b"]);
        let mut fail = Fail;
        let mut collect = Collect::default();

        let mut worker = Worker::new(identity(0), &mut queue, 2);
        worker.attach(&mut fail);
        worker.attach(&mut collect);
        assert_eq!(worker.run().unwrap(), 2);

        // The chain stops at the failing observer, so later ones see nothing.
        assert!(collect.seen.is_empty());
    }

    #[test]
    fn cared_signal_stops_worker() {
        let _guard = exclusive();
        let mut queue = filled(&["a", "b", "c"]);
        let mut raise_once = RaiseOnce(Some(Signal::SIGUSR1));
        let mut collect = Collect::default();

        let mut worker = Worker::new(identity(0), &mut queue, 100);
        worker.attach(&mut raise_once);
        worker.attach(&mut collect);
        assert_eq!(worker.run().unwrap(), 1);
        drop(worker);

        assert_eq!(collect.seen.len(), 1);
        assert_eq!(queue.len("q1"), 2);
        assert!(pending().is_empty());
    }

    #[test]
    fn signal_queued_before_run_is_honoured() {
        let _guard = exclusive();
        crate::signals::install(&[Signal::SIGTERM]).unwrap();
        raise(Signal::SIGTERM).unwrap();

        let mut queue = filled(&["a", "b", "c"]);
        let mut worker = Worker::new(identity(0), &mut queue, 3);
        assert_eq!(worker.run().unwrap(), 1);
        drop(worker);

        assert_eq!(queue.len("q1"), 2);
        assert!(pending().is_empty());
    }

    #[test]
    fn stop_restores_default_handlers() {
        let _guard = exclusive();
        let mut queue = filled(&["a"]);
        let mut worker = Worker::new(identity(0), &mut queue, 1);
        worker.run().unwrap();

        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installing SIG_DFL runs no user code; the previous action is
        // only inspected.
        let previous = unsafe { sigaction(Signal::SIGUSR1, &default) }.unwrap();
        assert!(matches!(previous.handler(), SigHandler::SigDfl));
    }
}
