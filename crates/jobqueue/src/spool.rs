use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::error::{QueueError, Result};
use crate::job::Job;
use crate::queue::Queue;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How often an idle `dequeue` rescans the key directories.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Directory claimed jobs are moved into while they are read.
const INFLIGHT_DIR: &str = ".inflight";

/// File extension for published jobs.
const JOB_EXT: &str = ".job";

/// Per-process sequence number, so names published within the same
/// nanosecond still sort in push order.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// SpoolQueue
// ---------------------------------------------------------------------------

/// Broker-less queue backed by a spool directory.
///
/// Every key is a subdirectory of the root, every job a file in it. Publishing
/// writes a temp file and renames it into place; consuming renames the oldest
/// file into `.inflight/`, so when several workers race for the same job
/// exactly one rename succeeds. Safe to share across forked processes: no
/// handle is held between calls.
#[derive(Debug)]
pub struct SpoolQueue {
    root: PathBuf,
    keys: Vec<String>,
    current: Option<Job>,
}

impl SpoolQueue {
    /// Create a queue over `root` that pops from `keys`, checked in order.
    pub fn new<I, S>(root: impl Into<PathBuf>, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        for key in &keys {
            validate_key(key)?;
        }
        Ok(Self {
            root: root.into(),
            keys,
            current: None,
        })
    }

    /// Claim the oldest job across all keys, if any.
    fn try_claim(&self) -> Result<Option<Job>> {
        for key in &self.keys {
            let dir = self.root.join(key);
            for name in pending_jobs(&dir)? {
                let inflight_dir = self.root.join(INFLIGHT_DIR);
                std::fs::create_dir_all(&inflight_dir)?;
                let claimed = inflight_dir.join(&name);

                match std::fs::rename(dir.join(&name), &claimed) {
                    Ok(()) => {}
                    // Another consumer won the race for this file.
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }

                let payload = std::fs::read(&claimed)?;
                std::fs::remove_file(&claimed)?;
                trace!(key = %key, file = %name, "claimed spooled job");
                return Ok(Some(Job::new(key.clone(), payload)));
            }
        }
        Ok(None)
    }
}

impl Queue for SpoolQueue {
    fn dequeue(&mut self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if let Some(job) = self.try_claim()? {
                self.current = Some(job.clone());
                return Ok(Some(job));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            std::thread::sleep(pause);
        }
    }

    fn enqueue(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        validate_key(key)?;
        let dir = self.root.join(key);
        std::fs::create_dir_all(&dir)?;

        let name = job_file_name()?;
        let tmp = dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, dir.join(&name))?;
        trace!(key = %key, file = %name, "spooled job");
        Ok(())
    }

    fn current(&self) -> Option<&Job> {
        self.current.as_ref()
    }
}

/// Keys become directory names, so they must be a single plain component.
fn validate_key(key: &str) -> Result<()> {
    let reserved = key == "." || key == ".." || key == INFLIGHT_DIR;
    if key.is_empty() || reserved || key.contains(['/', '\0']) {
        return Err(QueueError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// `<nanos>-<pid>-<seq>.job`, zero-padded so lexical order is push order.
fn job_file_name() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| QueueError::Io(std::io::Error::other(format!("clock: {e}"))))?
        .as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(format!(
        "{nanos:024}-{:010}-{seq:08}{JOB_EXT}",
        std::process::id()
    ))
}

/// Published job names under `dir`, oldest first. A missing directory has
/// simply never been pushed to.
fn pending_jobs(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(JOB_EXT) && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
