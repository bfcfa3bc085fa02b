//! Master/worker supervisor that feeds queued jobs to observers.
//!
//! A [`Listener`] forks a fixed pool of [`Worker`] processes, each blocking on
//! a shared [`jobqueue::Queue`] and handing every job to the attached
//! [`jobqueue::Observer`]s. Signals drive the pool: handlers only record them
//! in a [`signals::SignalQueue`], and each process reacts on its own main loop
//! through [`ProcessControl`].

pub mod config;
pub mod control;
pub mod error;
pub mod exit;
pub mod listener;
pub mod logging;
pub mod observers;
pub mod signals;
pub mod status;
pub mod system;
pub mod table;
pub mod worker;

pub use config::ListenerConfig;
pub use control::ProcessControl;
pub use error::{SupervisorError, SupervisorResult};
pub use listener::Listener;
pub use logging::Logger;
pub use observers::{EchoObserver, ExecObserver};
pub use worker::{Worker, WorkerIdentity};
