//! Why a reaped worker went away.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Still running, stopped or continued: nothing to reap.
    NotTerminated,
}

impl TerminationReason {
    /// Whether the process is gone and its slot can be reused.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotTerminated)
    }

    /// Clean exit: recycled after its quota or stopped by a signal it handled.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            _ => Self::NotTerminated,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by {}", signal.as_str()),
            Self::NotTerminated => write!(f, "not terminated"),
        }
    }
}
