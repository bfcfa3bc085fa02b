use std::fmt;

use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::ListenerConfig;

/// Wall-clock time followed by the pid of the process that wrote the line.
/// The pid is read per event so forked workers report their own.
struct Timestamp;

impl FormatTime for Timestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{} [{}]", now.format("%Y-%m-%d %H:%M:%S"), std::process::id())
    }
}

/// Explicitly constructed logging handle.
///
/// Nothing is installed globally: the listener and every worker run inside
/// [`Logger::in_scope`]. Cloning is cheap and a fork carries the handle into
/// the child.
#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// Debug level when `config.debug`, warnings and errors otherwise.
    ///
    /// Lines go to stdout, which daemonizing redirects into the log file.
    pub fn new(config: &ListenerConfig) -> Self {
        let level = if config.debug { Level::DEBUG } else { Level::WARN };
        Self::with_writer(level, std::io::stdout)
    }

    pub fn with_writer<W>(level: Level, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_timer(Timestamp)
            .with_max_level(level)
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Run `f` with this logger receiving every event it emits.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}
