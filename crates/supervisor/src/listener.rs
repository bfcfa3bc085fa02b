use jobqueue::{Observer, Queue};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::control::ProcessControl;
use crate::error::{SupervisorError, SupervisorResult};
use crate::exit::TerminationReason;
use crate::logging::Logger;
use crate::signals::{self, LISTENER_SIGNALS, WORKER_SIGNALS};
use crate::status::{ListenerMode, StatusFile};
use crate::system::{self, Privileges};
use crate::table::WorkerTable;
use crate::worker::{Worker, WorkerIdentity};

const BANNER_LINE: &str = "<<<<<<<< Stopping... waiting for workers to finish their jobs >>>>>>>>";
const BANNER_REPEAT: usize = 16;

/// What the listener does with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reaction {
    /// Stop everything and leave `listen`.
    Terminate,
    /// Relay to the workers; they exit and are respawned one by one.
    Reload,
    /// Reap exited workers and respawn their slots.
    Reap,
    Ignore,
}

impl Reaction {
    fn of(signal: Signal) -> Self {
        match signal {
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGABRT => Self::Terminate,
            Signal::SIGHUP | Signal::SIGUSR1 | Signal::SIGUSR2 => Self::Reload,
            Signal::SIGCHLD => Self::Reap,
            _ => Self::Ignore,
        }
    }
}

/// The supervising process.
///
/// Forks `worker_num` workers, keeps one alive per slot and turns signals into
/// pool operations: terminate-class signals stop everything, reload-class
/// signals are relayed so every worker gets replaced, `SIGCHLD` respawns
/// whatever exited into the slot it held.
pub struct Listener {
    config: ListenerConfig,
    logger: Logger,
    privileges: Privileges,
    pid: Pid,
    running: bool,
    queue: Option<Box<dyn Queue>>,
    observers: Vec<Box<dyn Observer>>,
    workers: WorkerTable,
    status: Option<StatusFile>,
}

impl Listener {
    /// Validate `config` and resolve the worker account. Nothing is forked
    /// and no handler is installed until [`Listener::listen`].
    pub fn new(config: ListenerConfig, logger: Logger) -> SupervisorResult<Self> {
        config.validate()?;
        let privileges =
            Privileges::resolve(config.user.as_deref(), config.group.as_deref())?;
        // Daemonizing changes directory, so pin the status path first.
        let status = match &config.status {
            Some(path) => Some(StatusFile::new(
                config.name.clone(),
                std::path::absolute(path).map_err(|e| {
                    SupervisorError::Config(format!("status path {}: {e}", path.display()))
                })?,
            )),
            None => None,
        };
        Ok(Self {
            config,
            logger,
            privileges,
            pid: getpid(),
            running: false,
            queue: None,
            observers: Vec::new(),
            workers: WorkerTable::new(),
            status,
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn worker_num(&self) -> usize {
        self.config.worker_num
    }

    pub fn set_worker_num(&mut self, worker_num: usize) {
        self.config.worker_num = worker_num;
    }

    pub fn set_worker_request_num(&mut self, worker_request_num: usize) {
        self.config.worker_request_num = worker_request_num;
    }

    /// Register an observer. Every worker gets its own copy at fork time.
    pub fn attach(&mut self, observer: impl Observer + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Run the pool until a terminate-class signal arrives. Blocks.
    ///
    /// Returns an error for invalid settings, or when a worker cannot be
    /// forked; in the latter case the workers already running are stopped
    /// and reaped first.
    pub fn listen(&mut self, queue: Box<dyn Queue>) -> SupervisorResult<()> {
        let logger = self.logger.clone();
        logger.in_scope(|| self.supervise(queue))
    }

    fn supervise(&mut self, queue: Box<dyn Queue>) -> SupervisorResult<()> {
        self.config.validate()?;
        self.running = true;
        self.queue = Some(queue);

        if self.config.daemonize {
            system::daemonize(&self.config.log)?;
        }
        system::set_process_title(&format!("{}: listener process", self.config.name));
        self.pid = getpid();
        info!(
            pid = %self.pid,
            workers = self.config.worker_num,
            requests = self.config.worker_request_num,
            "listener started"
        );
        self.install_signals()?;

        for slot in 0..self.config.worker_num {
            if let Err(e) = self.start_worker(slot) {
                return Err(self.abort(e));
            }
        }
        self.write_status(ListenerMode::Running);

        while self.running {
            if let Err(e) = self.dispatch_signals() {
                return Err(self.abort(e));
            }
        }

        self.write_status(ListenerMode::Stopped);
        info!(pid = %self.pid, "listener stopped");
        Ok(())
    }

    /// Fatal path: take the pool down before reporting `e`.
    fn abort(&mut self, e: SupervisorError) -> SupervisorError {
        error!(fatal = true, error = %e, "listener cannot continue");
        self.stop(Signal::SIGTERM);
        self.write_status(ListenerMode::Stopped);
        e
    }

    /// Fork a worker for `slot`. Only the parent returns.
    ///
    /// Cared signals stay blocked across the fork until the child has armed
    /// its own handlers, so a signal relayed to the new pid right away is
    /// held pending instead of landing in the listener's inherited queue.
    fn start_worker(&mut self, slot: usize) -> SupervisorResult<()> {
        signals::block(LISTENER_SIGNALS)
            .map_err(|e| SupervisorError::Signal(format!("block handlers: {e}")))?;

        // SAFETY: the listener never spawns threads, so the child starts from
        // a consistent copy of the whole process.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = self.run_worker(slot);
                std::process::exit(code)
            }
            Ok(ForkResult::Parent { child }) => {
                debug!(slot, pid = %child, "worker started");
                self.workers.insert(child, slot);
                unblock_listener_signals()
            }
            Err(e) => {
                if let Err(unblock) = unblock_listener_signals() {
                    warn!(error = %unblock, "failed to unblock signals after fork failure");
                }
                Err(SupervisorError::Spawn(format!("fork worker {slot}: {e}")))
            }
        }
    }

    /// Body of a freshly forked child. Returns its exit code.
    fn run_worker(&mut self, slot: usize) -> i32 {
        // Whatever is queued was meant for the listener. Signals sent to this
        // pid since the fork are still pending and reach the worker handlers.
        if let Err(e) = self.restore_signals() {
            warn!(slot, error = %e, "failed to restore signal handlers");
        }
        self.signal_queue().clear();
        if let Err(e) = signals::install(WORKER_SIGNALS)
            .and_then(|()| signals::unblock(LISTENER_SIGNALS))
        {
            error!(slot, error = %e, "failed to arm worker signal handlers");
            return 1;
        }
        // Siblings belong to the listener.
        self.workers = WorkerTable::new();
        self.status = None;

        system::set_process_title(&format!("{}: worker process", self.config.name));
        if let Err(e) = self.privileges.drop_privileges() {
            error!(slot, error = %e, "failed to drop privileges");
            return 1;
        }

        let Some(queue) = self.queue.as_deref_mut() else {
            error!(slot, "no queue to consume");
            return 1;
        };
        let identity = WorkerIdentity {
            slot,
            parent_pid: self.pid,
        };
        let mut worker = Worker::new(identity, queue, self.config.worker_request_num);
        for observer in &mut self.observers {
            worker.attach(observer.as_mut());
        }

        match worker.run() {
            Ok(processed) => {
                info!(slot, processed, "worker exiting");
                0
            }
            Err(e) => {
                error!(slot, error = %e, "worker failed");
                1
            }
        }
    }

    /// Relay `signal` to every tracked worker without waiting.
    fn stop_workers(&self, signal: Signal) {
        for pid in self.workers.pids() {
            if let Err(e) = kill(pid, signal) {
                warn!(pid = %pid, signal = signal.as_str(), error = %e, "failed to signal worker");
            }
        }
    }

    /// Reap every worker that has already exited and respawn its slot.
    fn restart_workers(&mut self) -> SupervisorResult<()> {
        let mut slots = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(slot) = self.forget(status) {
                        slots.push(slot);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }

        if slots.is_empty() {
            return Ok(());
        }
        for slot in slots {
            self.start_worker(slot)?;
        }
        self.write_status(ListenerMode::Running);
        Ok(())
    }

    /// Stop accepting signals, relay `signal` to all workers and wait for
    /// every child to exit.
    fn stop(&mut self, signal: Signal) {
        self.running = false;
        if let Err(e) = self.restore_signals() {
            warn!(error = %e, "failed to restore signal handlers");
        }
        self.write_status(ListenerMode::Stopping);
        self.stop_workers(signal);

        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => {
                    self.forget(status);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        if !self.workers.is_empty() {
            warn!(remaining = self.workers.len(), "workers left untracked after shutdown");
        }
    }

    /// Drop the record of a reaped child, returning the slot it held.
    fn forget(&mut self, status: WaitStatus) -> Option<usize> {
        let pid = status.pid()?;
        let reason = TerminationReason::from(status);
        if !reason.is_terminal() {
            return None;
        }
        let Some(slot) = self.workers.remove(pid) else {
            debug!(pid = %pid, %reason, "reaped untracked child");
            return None;
        };
        if reason.is_clean() {
            debug!(slot, pid = %pid, %reason, "worker stopped");
        } else {
            warn!(slot, pid = %pid, %reason, "worker died");
        }
        Some(slot)
    }

    fn write_status(&self, mode: ListenerMode) {
        if let Some(status) = &self.status {
            status.write(mode, self.pid.as_raw(), &self.workers.records());
        }
    }
}

fn unblock_listener_signals() -> SupervisorResult<()> {
    signals::unblock(LISTENER_SIGNALS)
        .map_err(|e| SupervisorError::Signal(format!("unblock handlers: {e}")))
}

impl ProcessControl for Listener {
    fn cared_signals(&self) -> &'static [Signal] {
        LISTENER_SIGNALS
    }

    fn with_signals(&mut self) -> SupervisorResult<()> {
        while let Some(signal) = self.next_signal() {
            match Reaction::of(signal) {
                Reaction::Terminate => {
                    warn!("{}", stopping_banner());
                    info!(signal = signal.as_str(), "stopping workers");
                    self.stop(signal);
                    return Ok(());
                }
                Reaction::Reload => {
                    info!(signal = signal.as_str(), "relaying to workers");
                    self.stop_workers(signal);
                }
                Reaction::Reap => self.restart_workers()?,
                Reaction::Ignore => debug!(signal = signal.as_str(), "ignoring signal"),
            }
        }
        Ok(())
    }
}

fn stopping_banner() -> String {
    std::iter::repeat_n(BANNER_LINE, BANNER_REPEAT)
        .map(|line| format!("\n{line}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observers::EchoObserver;

    fn listener(config: ListenerConfig) -> SupervisorResult<Listener> {
        let logger = Logger::new(&config);
        Listener::new(config, logger)
    }

    #[test]
    fn classifies_signals() {
        for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGABRT] {
            assert_eq!(Reaction::of(signal), Reaction::Terminate, "{signal}");
        }
        for signal in [Signal::SIGHUP, Signal::SIGUSR1, Signal::SIGUSR2] {
            assert_eq!(Reaction::of(signal), Reaction::Reload, "{signal}");
        }
        assert_eq!(Reaction::of(Signal::SIGCHLD), Reaction::Reap);
        assert_eq!(Reaction::of(Signal::SIGALRM), Reaction::Ignore);
    }

    #[test]
    fn every_cared_signal_has_a_reaction() {
        // ALRM is the only one deliberately ignored.
        let ignored: Vec<Signal> = LISTENER_SIGNALS
            .iter()
            .copied()
            .filter(|s| Reaction::of(*s) == Reaction::Ignore)
            .collect();
        assert_eq!(ignored, [Signal::SIGALRM]);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ListenerConfig {
            worker_num: 0,
            ..ListenerConfig::default()
        };
        assert!(matches!(listener(config), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn rejects_unknown_worker_user() {
        let config = ListenerConfig {
            user: Some("no-such-user-jobvisor".into()),
            ..ListenerConfig::default()
        };
        assert!(matches!(listener(config), Err(SupervisorError::Privilege(_))));
    }

    #[test]
    fn accessors_and_attach() {
        let mut listener = listener(ListenerConfig::default()).unwrap();
        listener.set_worker_num(3);
        listener.set_worker_request_num(7);
        listener.attach(EchoObserver);

        assert_eq!(listener.worker_num(), 3);
        assert_eq!(listener.config().worker_request_num, 7);
        assert_eq!(listener.observer_count(), 1);
        assert_eq!(listener.pid, getpid());
    }

    #[test]
    fn status_path_is_made_absolute() {
        let config = ListenerConfig {
            status: Some("run/status.json".into()),
            ..ListenerConfig::default()
        };
        let listener = listener(config).unwrap();
        let path = listener.status.as_ref().unwrap().path();
        assert!(path.is_absolute());
        assert!(path.ends_with("run/status.json"));
    }

    #[test]
    fn listen_rejects_settings_changed_after_construction() {
        let mut listener = listener(ListenerConfig::default()).unwrap();
        listener.set_worker_request_num(0);
        let err = listener
            .listen(Box::new(jobqueue::MemoryQueue::new(["q1"])))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)));
        assert!(listener.workers.is_empty());
    }

    #[test]
    fn banner_is_repeated() {
        let banner = stopping_banner();
        assert_eq!(banner.matches(BANNER_LINE).count(), BANNER_REPEAT);
        assert_eq!(banner.lines().filter(|l| l.is_empty()).count(), 1);
    }
}
