//! Per-process records, keyed by pid
//!
//! Parent links are stored as pids and resolved through the registry on
//! each walk, so records never own (or keep alive) each other.
//!
//! Records of processes whose exit was applied are retired rather than
//! dropped: a `/proc` reading taken before the exit may still arrive, and it
//! must be charged against the last reading, not as a new process. Retired
//! records live for at least one full sweep period.

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// One process the engine has seen (through an event or an ancestor walk)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: i32,
    /// `0`/`1` mean no further ancestor
    pub parent_pid: i32,
    /// Empty when the metadata could not be resolved (vanished)
    pub command: String,
    /// Last cumulative CPU reading from the kernel (microseconds)
    pub cumulative_cpu_us: u64,
}

impl ProcessRecord {
    pub fn new(pid: i32, parent_pid: i32, command: impl Into<String>, cumulative_cpu_us: u64) -> Self {
        Self {
            pid,
            parent_pid,
            command: command.into(),
            cumulative_cpu_us,
        }
    }

    /// Record for a process whose metadata could not be read
    pub fn vanished(pid: i32) -> Self {
        Self::new(pid, 0, String::new(), 0)
    }

    pub fn is_vanished(&self) -> bool {
        self.command.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: HashMap<i32, ProcessRecord>,
    /// Exited processes, with the sweep generation they were retired in
    retired: HashMap<i32, (ProcessRecord, u64)>,
    generation: u64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut ProcessRecord> {
        self.records.get_mut(&pid)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.records.contains_key(&pid)
    }

    /// Insert a record under its own pid, replacing any previous one
    pub fn insert(&mut self, record: ProcessRecord) -> &mut ProcessRecord {
        match self.records.entry(record.pid) {
            Entry::Occupied(mut slot) => {
                slot.insert(record);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(record),
        }
    }

    /// Return the record for `pid`, creating it with `resolve` if absent
    pub fn get_or_insert_with<F>(&mut self, pid: i32, resolve: F) -> &mut ProcessRecord
    where
        F: FnOnce() -> ProcessRecord,
    {
        self.records.entry(pid).or_insert_with(resolve)
    }

    pub fn remove(&mut self, pid: i32) -> Option<ProcessRecord> {
        self.records.remove(&pid)
    }

    pub fn pids(&self) -> Vec<i32> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every live record; retired ones are kept
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Keep `record` for late readings of its (exited) process
    pub fn retire(&mut self, record: ProcessRecord) {
        self.retired.insert(record.pid, (record, self.generation));
    }

    pub fn retired_mut(&mut self, pid: i32) -> Option<&mut ProcessRecord> {
        self.retired.get_mut(&pid).map(|(record, _)| record)
    }

    pub fn forget_retired(&mut self, pid: i32) -> Option<ProcessRecord> {
        self.retired.remove(&pid).map(|(record, _)| record)
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Drop records retired before the previous call, then start a new generation
    pub fn prune_retired(&mut self) -> usize {
        let before = self.retired.len();
        let current = self.generation;
        self.retired.retain(|_, (_, retired_in)| *retired_in >= current);
        self.generation += 1;
        before - self.retired.len()
    }
}
