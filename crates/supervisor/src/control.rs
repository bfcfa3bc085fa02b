use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::warn;

use crate::error::{SupervisorError, SupervisorResult};
use crate::signals::{self, SignalQueue};

/// How long a main loop idles when no signal is pending.
pub const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Deferred signal handling shared by the listener and its workers.
///
/// Handlers only queue signal numbers; the owning main loop calls
/// [`ProcessControl::dispatch_signals`] every iteration, which idles when
/// nothing is pending and otherwise hands control to
/// [`ProcessControl::with_signals`] to react.
pub trait ProcessControl {
    /// Signals this process arms a handler for.
    fn cared_signals(&self) -> &'static [Signal];

    /// React to pending signals. Only called when the queue is non-empty;
    /// implementations drain it with [`ProcessControl::next_signal`].
    fn with_signals(&mut self) -> SupervisorResult<()>;

    fn signal_queue(&self) -> &'static SignalQueue {
        signals::pending()
    }

    /// Arm handlers for the cared signals. Anything already queued stays
    /// queued for the next dispatch.
    fn install_signals(&self) -> SupervisorResult<()> {
        signals::install(self.cared_signals())
            .map_err(|e| SupervisorError::Signal(format!("install handlers: {e}")))
    }

    /// Return the cared signals to their default disposition, so a repeated
    /// signal during shutdown acts immediately instead of being queued.
    fn restore_signals(&self) -> SupervisorResult<()> {
        signals::restore(self.cared_signals())
            .map_err(|e| SupervisorError::Signal(format!("restore handlers: {e}")))
    }

    /// Idle step when no signal is pending.
    fn blank_signal(&mut self) {
        std::thread::sleep(IDLE_WAIT);
    }

    /// Pop the next pending signal, skipping numbers nix does not know.
    fn next_signal(&self) -> Option<Signal> {
        let queue = self.signal_queue();
        loop {
            let raw = queue.dequeue()?;
            match Signal::try_from(raw) {
                Ok(signal) => return Some(signal),
                Err(e) => warn!(signal = raw, error = %e, "ignoring unknown signal"),
            }
        }
    }

    /// One dispatch cycle: idle if nothing is pending, otherwise react.
    fn dispatch_pending(&mut self) -> SupervisorResult<()> {
        if self.signal_queue().is_empty() {
            self.blank_signal();
            return Ok(());
        }
        self.with_signals()
    }

    /// Called once per main-loop iteration. Override to add checks that must
    /// run before dispatch, then delegate to [`ProcessControl::dispatch_pending`].
    fn dispatch_signals(&mut self) -> SupervisorResult<()> {
        self.dispatch_pending()
    }
}
