use std::time::Duration;

use jobqueue::{Job, Queue, QueueError, Result};

use crate::adapter::RedisAdapter;
use crate::options::RedisOptions;

/// `BRPOP`/`LPUSH` queue over a fixed list of keys.
pub struct RedisQueue {
    options: RedisOptions,
    keys: Vec<String>,
    adapter: Option<RedisAdapter>,
    current: Option<Job>,
}

impl RedisQueue {
    /// Create a queue popping from `keys` in priority order. No connection is
    /// made until the first command.
    pub fn new<I, S>(options: RedisOptions, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if let Some(key) = keys.iter().find(|k| k.is_empty()) {
            return Err(QueueError::InvalidKey(key.clone()));
        }
        Ok(Self {
            options,
            keys,
            adapter: None,
            current: None,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn adapter(&mut self) -> Result<&mut RedisAdapter> {
        if self.adapter.is_none() {
            let mut adapter = RedisAdapter::new();
            adapter.connect(
                &self.options.host,
                self.options.port,
                self.options.connect_timeout,
            )?;
            if let Some(password) = &self.options.password {
                adapter.auth(password)?;
            }
            if self.options.db != 0 {
                adapter.select(self.options.db)?;
            }
            self.adapter = Some(adapter);
        }
        self.adapter
            .as_mut()
            .ok_or_else(|| QueueError::Connection("not connected".into()))
    }
}

impl Queue for RedisQueue {
    fn dequeue(&mut self, timeout: Duration) -> Result<Option<Job>> {
        if self.keys.is_empty() {
            return Err(QueueError::InvalidKey(String::new()));
        }
        let mut cmd = redis::cmd("BRPOP");
        cmd.arg(&self.keys).arg(brpop_timeout(timeout));

        let reply: Option<(String, Vec<u8>)> = self.adapter()?.query(&cmd)?;
        Ok(reply.map(|(key, payload)| {
            let job = Job::new(key, payload);
            self.current = Some(job.clone());
            job
        }))
    }

    fn enqueue(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(QueueError::InvalidKey(key.to_string()));
        }
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(payload);
        self.adapter()?.query::<i64>(&cmd)?;
        Ok(())
    }

    fn current(&self) -> Option<&Job> {
        self.current.as_ref()
    }
}

/// BRPOP takes whole seconds where 0 means forever; round partial seconds up
/// so a short timeout never turns into an infinite wait.
fn brpop_timeout(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brpop_timeout_rounds_up() {
        assert_eq!(brpop_timeout(Duration::ZERO), 0);
        assert_eq!(brpop_timeout(Duration::from_millis(1)), 1);
        assert_eq!(brpop_timeout(Duration::from_secs(1)), 1);
        assert_eq!(brpop_timeout(Duration::from_millis(1500)), 2);
    }

    #[test]
    fn construction_does_not_connect() {
        let options = RedisOptions {
            port: 1,
            ..RedisOptions::default()
        };
        let queue = RedisQueue::new(options, ["q1", "q2"]).unwrap();
        assert_eq!(queue.keys(), ["q1", "q2"]);
        assert!(queue.adapter.is_none());
        assert!(queue.current().is_none());
    }

    #[test]
    fn rejects_empty_keys() {
        assert!(RedisQueue::new(RedisOptions::default(), [""]).is_err());
    }
}
