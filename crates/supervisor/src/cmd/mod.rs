mod listen;
mod push;

use std::path::PathBuf;

use clap::Args;
use jobqueue::{Queue, SpoolQueue};
use jobqueue_redis::{RedisOptions, RedisQueue};
use supervisor::{SupervisorError, SupervisorResult};

pub use listen::{ListenArgs, run_listen};
pub use push::{PushArgs, run_push};

/// Where jobs live. Exactly one backend must be chosen.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct QueueSource {
    /// Redis server, as redis://[:password@]host[:port][/db]
    #[arg(long, env = "JOBVISOR_REDIS")]
    redis: Option<String>,
    /// Spool directory shared by producers and workers (no broker needed)
    #[arg(long, env = "JOBVISOR_SPOOL")]
    spool: Option<PathBuf>,
}

impl QueueSource {
    /// Build the queue. Nothing connects until the first dequeue or enqueue.
    pub fn open(&self, keys: &[String]) -> SupervisorResult<Box<dyn Queue>> {
        if let Some(url) = &self.redis {
            let options = RedisOptions::from_url(url)
                .map_err(|e| SupervisorError::Config(format!("--redis {url}: {e}")))?;
            return Ok(Box::new(RedisQueue::new(options, keys.iter().cloned())?));
        }
        if let Some(root) = &self.spool {
            return Ok(Box::new(SpoolQueue::new(root, keys.iter().cloned())?));
        }
        Err(SupervisorError::Config(
            "no queue: pass --redis or --spool".into(),
        ))
    }
}
