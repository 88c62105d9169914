//! In-memory process table implementing the host collaborators
//!
//! Lets the engine run without `/proc` or root: tests and benches describe a
//! process tree by hand and feed `Update`/`Exit` events against it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{LivenessProbe, MetadataLookup, ProcessMetadata, ProcessSample, ProcessScanner};

/// A hand-crafted process table
///
/// # Example
///
/// ```
/// use topfast::host::{FakeHost, MetadataLookup};
///
/// let host = FakeHost::new();
/// host.spawn(100, 1, "sshd", 0);
/// host.spawn(200, 100, "bash", 1_500);
///
/// assert_eq!(host.lookup(200).unwrap().parent_pid, 100);
/// host.reap(200);
/// assert!(host.lookup(200).is_none());
/// ```
#[derive(Debug, Default)]
pub struct FakeHost {
    processes: Mutex<BTreeMap<i32, ProcessSample>>,
    lookups: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<i32, ProcessSample>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a running process
    pub fn spawn(&self, pid: i32, parent_pid: i32, command: &str, cumulative_cpu_us: u64) {
        self.table().insert(
            pid,
            ProcessSample::new(pid, parent_pid, cumulative_cpu_us, command),
        );
    }

    /// Set the cumulative CPU counter of a running process
    pub fn set_cpu(&self, pid: i32, cumulative_cpu_us: u64) {
        if let Some(process) = self.table().get_mut(&pid) {
            process.cumulative_cpu_us = cumulative_cpu_us;
        }
    }

    /// Remove a process, returning its last state
    pub fn reap(&self, pid: i32) -> Option<ProcessSample> {
        self.table().remove(&pid)
    }

    /// Number of `lookup` calls served so far
    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl MetadataLookup for FakeHost {
    fn lookup(&self, pid: i32) -> Option<ProcessMetadata> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.table().get(&pid).map(|p| ProcessMetadata {
            command: p.command.clone(),
            parent_pid: p.parent_pid,
        })
    }
}

impl LivenessProbe for FakeHost {
    fn is_alive(&self, pid: i32) -> bool {
        self.table().contains_key(&pid)
    }
}

impl ProcessScanner for FakeHost {
    fn scan(&self) -> anyhow::Result<Vec<ProcessSample>> {
        Ok(self.table().values().cloned().collect())
    }
}
