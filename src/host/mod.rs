//! Host collaborators consulted by the accounting engine
//!
//! The engine never touches the operating system directly. Everything it
//! needs to know about processes it has not seen an event for comes through
//! the three traits below:
//!
//! - [`MetadataLookup`]: command name and parent pid of a live process
//! - [`LivenessProbe`]: does this pid still exist?
//! - [`ProcessScanner`]: every running process with its cumulative CPU time
//!
//! [`procfs::ProcFs`] implements all three on Linux; [`fake::FakeHost`] is an
//! in-memory process table for tests and benchmarks.

pub mod fake;
pub mod procfs;

pub use fake::FakeHost;
pub use procfs::ProcFs;

/// Command name and parent of a process, as resolved from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMetadata {
    /// Command name (kernel `comm`, at most 15 bytes on Linux)
    pub command: String,
    /// Parent process id
    pub parent_pid: i32,
}

/// Point-in-time reading for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSample {
    pub pid: i32,
    pub parent_pid: i32,
    /// User + system CPU time since the process started (microseconds)
    pub cumulative_cpu_us: u64,
    pub command: String,
}

impl ProcessSample {
    pub fn new(pid: i32, parent_pid: i32, cumulative_cpu_us: u64, command: impl Into<String>) -> Self {
        Self {
            pid,
            parent_pid,
            cumulative_cpu_us,
            command: command.into(),
        }
    }
}

/// Resolves command name and parent pid of a process the engine has not seen yet
pub trait MetadataLookup {
    /// Returns `None` when the process has already vanished
    fn lookup(&self, pid: i32) -> Option<ProcessMetadata>;
}

/// Detects processes that disappeared without the engine seeing their exit
pub trait LivenessProbe {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Enumerates currently running processes
pub trait ProcessScanner {
    fn scan(&self) -> anyhow::Result<Vec<ProcessSample>>;
}

/// Everything the engine needs from the host, shareable across threads
pub trait Host: MetadataLookup + LivenessProbe + ProcessScanner + Send + Sync {}

impl<T> Host for T where T: MetadataLookup + LivenessProbe + ProcessScanner + Send + Sync {}
