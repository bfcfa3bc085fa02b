use std::path::PathBuf;

use clap::Args;
use supervisor::{
    EchoObserver, ExecObserver, Listener, ListenerConfig, Logger, SupervisorError,
    SupervisorResult, config,
};

use super::QueueSource;

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Path to a YAML config file
    #[arg(long, short, env = "JOBVISOR_CONFIG")]
    config: Option<PathBuf>,
    /// Process name prefix (overrides config)
    #[arg(long)]
    name: Option<String>,
    /// Number of worker processes (overrides config)
    #[arg(long, short)]
    workers: Option<usize>,
    /// Jobs a worker handles before it is replaced (overrides config)
    #[arg(long, short)]
    requests: Option<usize>,
    /// Detach from the terminal and write output to --log
    #[arg(long, short)]
    daemonize: bool,
    /// Only log warnings and errors
    #[arg(long, short)]
    quiet: bool,
    /// Log file used when daemonized (overrides config)
    #[arg(long)]
    log: Option<PathBuf>,
    /// User the workers run as (overrides config)
    #[arg(long)]
    user: Option<String>,
    /// Group the workers run as (overrides config)
    #[arg(long)]
    group: Option<String>,
    /// Write listener status as JSON to this file (overrides config)
    #[arg(long)]
    status: Option<PathBuf>,
    /// Queue key to consume; repeat to poll several in priority order
    #[arg(long = "key", short, required = true)]
    keys: Vec<String>,
    #[command(flatten)]
    source: QueueSource,
    /// Print every job to stdout
    #[arg(long)]
    echo: bool,
    /// Run a shell command per job (JOB_KEY, JOB_SLOT in env, payload on stdin)
    #[arg(long)]
    exec: Vec<String>,
}

impl ListenArgs {
    /// File values first, then flags on top.
    fn config(&self) -> SupervisorResult<ListenerConfig> {
        let mut config = match &self.config {
            Some(path) => config::load(path)?,
            None => ListenerConfig::default(),
        };
        if let Some(name) = &self.name {
            config.name.clone_from(name);
        }
        if let Some(workers) = self.workers {
            config.worker_num = workers;
        }
        if let Some(requests) = self.requests {
            config.worker_request_num = requests;
        }
        if self.daemonize {
            config.daemonize = true;
        }
        if self.quiet {
            config.debug = false;
        }
        if let Some(log) = &self.log {
            config.log.clone_from(log);
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        if let Some(group) = &self.group {
            config.group = Some(group.clone());
        }
        if let Some(status) = &self.status {
            config.status = Some(status.clone());
        }
        Ok(config)
    }
}

/// Build the listener from config and flags, then supervise until stopped.
pub fn run_listen(args: ListenArgs) -> SupervisorResult<()> {
    if !args.echo && args.exec.is_empty() {
        return Err(SupervisorError::Config(
            "no observer: pass --echo and/or --exec <command>".into(),
        ));
    }
    let config = args.config()?;
    let queue = args.source.open(&args.keys)?;

    let logger = Logger::new(&config);
    let mut listener = Listener::new(config, logger)?;
    if args.echo {
        listener.attach(EchoObserver);
    }
    for command in args.exec {
        listener.attach(ExecObserver::new(command));
    }
    listener.listen(queue)
}
