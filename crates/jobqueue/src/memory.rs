use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::Result;
use crate::job::Job;
use crate::queue::Queue;

/// Single-process queue with BRPOP/LPUSH ordering.
///
/// Nothing can fill it while its only consumer waits, so `dequeue` never
/// sleeps: an empty queue returns `None` regardless of the timeout.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    keys: Vec<String>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    current: Option<Job>,
}

impl MemoryQueue {
    /// Create a queue that pops from `keys`, checked in order.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Number of jobs waiting under `key`.
    pub fn len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.values().all(VecDeque::is_empty)
    }
}

impl Queue for MemoryQueue {
    fn dequeue(&mut self, _timeout: Duration) -> Result<Option<Job>> {
        for key in &self.keys {
            if let Some(payload) = self.lists.get_mut(key).and_then(VecDeque::pop_back) {
                let job = Job::new(key.clone(), payload);
                self.current = Some(job.clone());
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn enqueue(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(payload.to_vec());
        Ok(())
    }

    fn current(&self) -> Option<&Job> {
        self.current.as_ref()
    }
}
