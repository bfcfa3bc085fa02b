//! Observers shipped with the `jobvisor` binary.

use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

use jobqueue::{Job, Observer, Queue, QueueError};
use tracing::debug;

fn current_job(queue: &dyn Queue) -> jobqueue::Result<&Job> {
    queue
        .current()
        .ok_or_else(|| QueueError::Observer("no current job".into()))
}

/// Prints every job to stdout as `key: ..; content: ..; from: <slot>`.
#[derive(Debug, Default)]
pub struct EchoObserver;

impl Observer for EchoObserver {
    fn update(&mut self, queue: &mut dyn Queue, slot: usize) -> jobqueue::Result<()> {
        let job = current_job(queue)?;
        let mut out = std::io::stdout().lock();
        writeln!(
            out,
            "key: {}; content: {}; from: {slot}",
            job.key,
            job.payload_lossy()
        )?;
        out.flush()?;
        Ok(())
    }
}

/// Runs a shell command per job.
///
/// The command gets `JOB_KEY` and `JOB_SLOT` in its environment and the
/// payload on stdin. A nonzero exit fails the job.
#[derive(Debug, Clone)]
pub struct ExecObserver {
    command: String,
}

impl ExecObserver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Observer for ExecObserver {
    fn update(&mut self, queue: &mut dyn Queue, slot: usize) -> jobqueue::Result<()> {
        let job = current_job(queue)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("JOB_KEY", &job.key)
            .env("JOB_SLOT", slot.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| QueueError::Observer(format!("spawn {:?}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&job.payload)
                && e.kind() != ErrorKind::BrokenPipe
            {
                return Err(QueueError::Observer(format!("write payload: {e}")));
            }
        }

        let status = child
            .wait()
            .map_err(|e| QueueError::Observer(format!("wait {:?}: {e}", self.command)))?;
        debug!(slot, key = %job.key, %status, "command finished");
        if !status.success() {
            return Err(QueueError::Observer(format!(
                "{:?} {status}",
                self.command
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue::MemoryQueue;
    use std::time::Duration;

    fn queue_with(key: &str, payload: &str) -> MemoryQueue {
        let mut queue = MemoryQueue::new([key]);
        queue.enqueue(key, payload.as_bytes()).unwrap();
        queue.dequeue(Duration::ZERO).unwrap().unwrap();
        queue
    }

    #[test]
    fn exec_passes_key_slot_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut queue = queue_with("mail", "hello");

        let mut observer = ExecObserver::new(format!(
            "printf '%s %s %s' \"$JOB_KEY\" \"$JOB_SLOT\" \"$(cat)\" > {}",
            out.display()
        ));
        observer.update(&mut queue, 7).unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "mail 7 hello");
    }

    #[test]
    fn exec_nonzero_exit_is_an_error() {
        let mut queue = queue_with("q1", "x");
        let mut observer = ExecObserver::new("exit 3");

        let err = observer.update(&mut queue, 0).unwrap_err();
        assert!(matches!(err, QueueError::Observer(_)));
        assert!(err.to_string().contains('3'), "{err}");
    }

    #[test]
    fn exec_ignoring_stdin_succeeds() {
        let mut queue = queue_with("q1", &"x".repeat(1 << 20));
        let mut observer = ExecObserver::new("true");
        observer.update(&mut queue, 0).unwrap();
    }

    #[test]
    fn observers_need_a_current_job() {
        let mut queue = MemoryQueue::new(["q1"]);
        assert!(EchoObserver.update(&mut queue, 0).is_err());
        assert!(ExecObserver::new("true").update(&mut queue, 0).is_err());
    }

    #[test]
    fn echo_accepts_current_job() {
        let mut queue = queue_with("q1", "payload");
        EchoObserver.update(&mut queue, 1).unwrap();
    }
}
