//! Linux `/proc` implementation of the host collaborators

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::{LivenessProbe, MetadataLookup, ProcessMetadata, ProcessSample, ProcessScanner};

/// Fallback when `sysconf(_SC_CLK_TCK)` is unavailable
const DEFAULT_CLOCK_TICKS: u64 = 100;

/// Number of configured CPUs, at least 1
pub fn configured_cpus() -> usize {
    // SAFETY: sysconf only reads system configuration
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if cpus > 0 {
        cpus as usize
    } else {
        1
    }
}

/// Fields of interest from `/proc/<pid>/stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatLine {
    pub command: String,
    pub parent_pid: i32,
    /// utime + stime, in clock ticks
    pub cpu_ticks: u64,
}

/// Parse the contents of a `/proc/<pid>/stat` file
///
/// The command is everything between the first `(` and the *last* `)`:
/// `comm` may itself contain spaces and parentheses.
pub fn parse_stat(line: &str) -> Option<StatLine> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close <= open {
        return None;
    }
    let command = line[open + 1..close].to_string();

    // Fields after the command: state(3) ppid(4) ... utime(14) stime(15)
    let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();
    if rest.len() < 13 {
        return None;
    }
    let parent_pid = rest[1].parse().ok()?;
    let utime: u64 = rest[11].parse().ok()?;
    let stime: u64 = rest[12].parse().ok()?;

    Some(StatLine {
        command,
        parent_pid,
        cpu_ticks: utime.saturating_add(stime),
    })
}

/// Host collaborators backed by procfs and `kill(pid, 0)`
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    clock_ticks: u64,
}

impl ProcFs {
    /// Use the system `/proc`
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternative procfs mount (containers, tests)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => DEFAULT_CLOCK_TICKS,
        };
        Self {
            root: root.into(),
            clock_ticks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert clock ticks to microseconds
    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1_000_000) / self.clock_ticks
    }

    fn read_stat(&self, pid: i32) -> Option<StatLine> {
        read_stat_file(&self.root.join(pid.to_string()).join("stat"))
    }

    /// Stat of the main thread only
    ///
    /// `/proc/<pid>/stat` sums the CPU of the whole thread group, including
    /// threads that already exited; those were charged by their own exit
    /// event. Falls back to the group file where no task directory exists.
    fn read_leader_stat(&self, pid: i32) -> Option<StatLine> {
        let pid_dir = self.root.join(pid.to_string());
        let leader = pid_dir.join("task").join(pid.to_string()).join("stat");
        read_stat_file(&leader).or_else(|| read_stat_file(&pid_dir.join("stat")))
    }
}

fn read_stat_file(path: &Path) -> Option<StatLine> {
    let content = fs::read_to_string(path).ok()?;
    parse_stat(&content)
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataLookup for ProcFs {
    fn lookup(&self, pid: i32) -> Option<ProcessMetadata> {
        let stat = self.read_stat(pid);
        if stat.is_none() {
            trace!(pid, "no stat entry, process vanished");
        }
        stat.map(|s| ProcessMetadata {
            command: s.command,
            parent_pid: s.parent_pid,
        })
    }
}

impl LivenessProbe for ProcFs {
    fn is_alive(&self, pid: i32) -> bool {
        // kill(0) and kill(-1) address process groups, never probe them
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: exists but owned by someone else
            Err(_) => true,
        }
    }
}

impl ProcessScanner for ProcFs {
    fn scan(&self) -> Result<Vec<ProcessSample>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?;

        let mut samples = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = name.parse::<i32>() else {
                continue;
            };
            // Exited between readdir and read: the exit event accounts for it
            let Some(stat) = self.read_leader_stat(pid) else {
                continue;
            };
            samples.push(ProcessSample {
                pid,
                parent_pid: stat.parent_pid,
                cumulative_cpu_us: self.ticks_to_us(stat.cpu_ticks),
                command: stat.command,
            });
        }

        debug!(processes = samples.len(), "scanned running processes");
        Ok(samples)
    }
}
