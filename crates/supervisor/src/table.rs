use std::collections::BTreeMap;

use nix::unistd::Pid;
use serde::Serialize;
use tracing::warn;

/// One live worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerRecord {
    pub slot: usize,
    #[serde(serialize_with = "serialize_pid")]
    pub pid: Pid,
}

fn serialize_pid<S: serde::Serializer>(pid: &Pid, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i32(pid.as_raw())
}

/// The listener's pid → slot tracking table. Owned by the listener alone.
#[derive(Debug, Default)]
pub struct WorkerTable {
    by_pid: BTreeMap<i32, usize>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly forked worker.
    pub fn insert(&mut self, pid: Pid, slot: usize) {
        if let Some(holder) = self.pid_of(slot) {
            warn!(slot, holder = %holder, pid = %pid, "slot already held by a live worker");
        }
        self.by_pid.insert(pid.as_raw(), slot);
    }

    /// Forget a reaped worker, returning its slot. Removing a pid that is not
    /// tracked (already reaped, or never ours) is a no-op.
    pub fn remove(&mut self, pid: Pid) -> Option<usize> {
        self.by_pid.remove(&pid.as_raw())
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.by_pid.get(&pid.as_raw()).copied()
    }

    pub fn pid_of(&self, slot: usize) -> Option<Pid> {
        self.by_pid
            .iter()
            .find(|&(_, &s)| s == slot)
            .map(|(&pid, _)| Pid::from_raw(pid))
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.by_pid.keys().copied().map(Pid::from_raw).collect()
    }

    /// All records, ordered by slot.
    pub fn records(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self
            .by_pid
            .iter()
            .map(|(&pid, &slot)| WorkerRecord {
                slot,
                pid: Pid::from_raw(pid),
            })
            .collect();
        records.sort_by_key(|r| r.slot);
        records
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn respawn_keeps_slot_with_new_pid() {
        let mut table = WorkerTable::new();
        table.insert(pid(100), 0);
        table.insert(pid(101), 1);

        let slot = table.remove(pid(100)).unwrap();
        table.insert(pid(200), slot);

        assert_eq!(table.len(), 2);
        assert_eq!(table.pid_of(0), Some(pid(200)));
        assert_eq!(table.slot_of(pid(100)), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = WorkerTable::new();
        table.insert(pid(100), 0);

        assert_eq!(table.remove(pid(100)), Some(0));
        assert_eq!(table.remove(pid(100)), None);
        assert_eq!(table.remove(pid(999)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn records_are_ordered_by_slot() {
        let mut table = WorkerTable::new();
        table.insert(pid(300), 2);
        table.insert(pid(500), 0);
        table.insert(pid(400), 1);

        let slots: Vec<usize> = table.records().iter().map(|r| r.slot).collect();
        assert_eq!(slots, [0, 1, 2]);
        assert_eq!(table.pids(), [pid(300), pid(400), pid(500)]);
    }

    #[test]
    fn record_serializes_raw_pid() {
        let record = WorkerRecord {
            slot: 1,
            pid: pid(4242),
        };
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json, serde_json::json!({"slot": 1, "pid": 4242}));
    }
}
