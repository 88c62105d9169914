//! Update and exit event handlers

use tracing::{debug, trace};

use super::registry::ProcessRecord;
use super::EngineState;
use crate::config::EngineConfig;
use crate::host::{MetadataLookup, ProcessSample};

/// CPU time consumed between two cumulative readings
///
/// A decrease means the kernel counter wrapped or was reset. The size of the
/// lost part cannot be known without the counter width, so the whole new
/// reading is credited: an approximation, never negative.
pub fn cpu_delta(previous_us: u64, current_us: u64) -> u64 {
    if current_us >= previous_us {
        current_us - previous_us
    } else {
        current_us
    }
}

impl EngineState {
    /// Apply a liveness refresh; `reset` re-seeds without charging any CPU
    ///
    /// Returns the CPU delta credited.
    pub(super) fn apply_update<L: MetadataLookup + ?Sized>(
        &mut self,
        lookup: &L,
        config: &EngineConfig,
        sample: &ProcessSample,
        reset: bool,
    ) -> u64 {
        let event = self.next_event();

        let late = self.late_reading(sample, reset);
        let (delta, command, parent_pid) = match late {
            Some(late) => late,
            None => self.live_reading(sample, reset),
        };

        self.ledger.entry(&command).credit_own(delta, 0);
        if delta > 0 {
            self.propagate(lookup, config.max_walk_depth, event, parent_pid, delta, 0);
        }
        trace!(pid = sample.pid, command = %command, delta, reset, "update");
        delta
    }

    /// Reading for a process whose exit was already applied
    ///
    /// Charged against the last reading of the retired record, so an update
    /// and an exit for one pid give the same totals in either order. A
    /// reading below the retired one means the pid was reused: the retired
    /// record is dropped and the process is treated as new.
    fn late_reading(&mut self, sample: &ProcessSample, reset: bool) -> Option<(u64, String, i32)> {
        if self.registry.contains(sample.pid) {
            return None;
        }
        let retired = self.registry.retired_mut(sample.pid)?;
        if sample.cumulative_cpu_us < retired.cumulative_cpu_us {
            self.registry.forget_retired(sample.pid);
            debug!(pid = sample.pid, "pid reused after exit");
            return None;
        }
        let delta = if reset {
            0
        } else {
            sample.cumulative_cpu_us - retired.cumulative_cpu_us
        };
        retired.cumulative_cpu_us = sample.cumulative_cpu_us;
        trace!(pid = sample.pid, delta, "reading after exit");
        Some((delta, retired.command.clone(), retired.parent_pid))
    }

    fn live_reading(&mut self, sample: &ProcessSample, reset: bool) -> (u64, String, i32) {
        match self.registry.get_mut(sample.pid) {
            Some(record) => {
                let previous = record.cumulative_cpu_us;
                if sample.cumulative_cpu_us < previous {
                    debug!(
                        pid = sample.pid,
                        previous,
                        current = sample.cumulative_cpu_us,
                        "cpu counter went backwards, crediting full reading"
                    );
                }
                let delta = if reset {
                    0
                } else {
                    cpu_delta(previous, sample.cumulative_cpu_us)
                };
                record.cumulative_cpu_us = sample.cumulative_cpu_us;
                if !sample.command.is_empty() {
                    record.command.clone_from(&sample.command);
                }
                if sample.parent_pid > 0 {
                    record.parent_pid = sample.parent_pid;
                }
                (delta, record.command.clone(), record.parent_pid)
            }
            None => {
                // First sight in this window: everything so far is new usage
                let delta = if reset { 0 } else { sample.cumulative_cpu_us };
                self.registry.insert(ProcessRecord::new(
                    sample.pid,
                    sample.parent_pid,
                    sample.command.clone(),
                    sample.cumulative_cpu_us,
                ));
                (delta, sample.command.clone(), sample.parent_pid)
            }
        }
    }

    pub(super) fn apply_exit<L: MetadataLookup + ?Sized>(
        &mut self,
        lookup: &L,
        config: &EngineConfig,
        sample: &ProcessSample,
    ) {
        let event = self.next_event();
        self.tally.exits += 1;

        // A record may exist from an update or from an earlier ancestor walk
        let known = self.registry.remove(sample.pid);
        let command = match known {
            Some(ref record) if sample.command.is_empty() => record.command.clone(),
            _ => sample.command.clone(),
        };
        let parent_pid = match known {
            Some(ref record) if sample.parent_pid <= 0 => record.parent_pid,
            _ => sample.parent_pid,
        };

        let cpu = sample.cumulative_cpu_us;
        let last_reading = known.as_ref().map_or(0, |record| record.cumulative_cpu_us);
        self.registry.retire(ProcessRecord::new(
            sample.pid,
            parent_pid,
            command.clone(),
            last_reading,
        ));

        self.ledger.entry(&command).credit_own(cpu, 1);
        self.propagate(lookup, config.max_walk_depth, event, parent_pid, cpu, 1);

        if config.history {
            self.histogram.record(cpu);
        }
        trace!(pid = sample.pid, parent_pid, command = %command, cpu, "exit");
    }
}
