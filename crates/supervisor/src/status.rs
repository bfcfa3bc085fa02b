use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::table::WorkerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Serialize)]
struct ListenerStatus<'a> {
    name: &'a str,
    mode: ListenerMode,
    pid: i32,
    workers: &'a [WorkerRecord],
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Persists the listener's state to a JSON file for external inspection.
///
/// Owned by the listener; workers never write it.
pub struct StatusFile {
    name: String,
    path: PathBuf,
    started_at: DateTime<Utc>,
}

impl StatusFile {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
            started_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    /// Failures are logged and otherwise ignored.
    pub fn write(&self, mode: ListenerMode, pid: i32, workers: &[WorkerRecord]) {
        let status = ListenerStatus {
            name: &self.name,
            mode,
            pid,
            workers,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, json.as_bytes()) {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to rename status file");
        }
    }
}
