//! Sample windows, long-lived process rescans and stale entry sweeps

use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

use super::{Engine, EngineState};
use crate::host::ProcessSample;

/// Time span the current aggregates cover
#[derive(Debug, Clone, Serialize)]
pub struct SampleWindow {
    /// When the engine was created
    pub session_started_at: SystemTime,
    /// When the current window started (last reset)
    pub sample_started_at: SystemTime,
    #[serde(skip)]
    pub sample_started: Instant,
    /// Number of window resets so far
    pub sample: u64,
    /// Number of reports written so far
    pub display: u64,
}

impl SampleWindow {
    pub(super) fn new() -> Self {
        let now = SystemTime::now();
        Self {
            session_started_at: now,
            sample_started_at: now,
            sample_started: Instant::now(),
            sample: 0,
            display: 0,
        }
    }

    fn restart(&mut self) {
        self.sample += 1;
        self.sample_started_at = SystemTime::now();
        self.sample_started = Instant::now();
    }

    /// Duration of the current window so far
    pub fn elapsed(&self) -> Duration {
        self.sample_started.elapsed()
    }

    /// True until the first report has been written
    pub fn is_first_display(&self) -> bool {
        self.display == 0
    }
}

impl EngineState {
    fn clear_window(&mut self, clear_histogram: bool) {
        self.registry.clear();
        self.ledger.reset();
        if clear_histogram {
            self.histogram.reset();
        }
        self.tally.exits = 0;
        self.window.restart();
    }

    fn sweep(&mut self, is_alive: impl Fn(i32) -> bool) -> usize {
        let stale: Vec<i32> = self
            .registry
            .pids()
            .into_iter()
            .filter(|&pid| !is_alive(pid))
            .collect();
        for pid in &stale {
            self.registry.remove(*pid);
        }
        let pruned = self.registry.prune_retired();
        if pruned > 0 {
            debug!(pruned, "dropped retired process records");
        }
        self.tally.removed += stale.len() as u64;
        stale.len()
    }
}

impl Engine {
    fn apply_reseed(&self, state: &mut EngineState, running: &[ProcessSample]) {
        for sample in running {
            state.apply_update(self.host.as_ref(), &self.config, sample, true);
        }
    }

    /// Register every running process with a zero delta
    ///
    /// Called once at start so CPU consumed before the engine existed is
    /// never charged. Returns the number of processes seeded.
    pub fn seed_running(&self) -> Result<usize> {
        let running = self.host.scan()?;
        if !self.accepting() {
            return Ok(0);
        }
        let mut state = self.lock();
        self.apply_reseed(&mut state, &running);
        debug!(processes = running.len(), "seeded running processes");
        Ok(running.len())
    }

    /// Start a new sample window
    ///
    /// Clears the registry and zeroes the ledger (and the histogram when
    /// history is enabled), then re-seeds the registry from the running
    /// processes so their pre-reset lifetime is not charged to the new
    /// window. Clearing and re-seeding happen under one lock acquisition.
    ///
    /// # Errors
    ///
    /// Returns the scan error; the window is still reset, but long-lived
    /// processes will then be charged their full lifetime on next sight.
    pub fn reset_window(&self) -> Result<()> {
        let scanned = self.host.scan();
        if !self.accepting() {
            return Ok(());
        }

        let mut state = self.lock();
        state.clear_window(self.config.history);
        let running = scanned?;
        self.apply_reseed(&mut state, &running);
        info!(
            sample = state.window.sample,
            processes = running.len(),
            "sample window reset"
        );
        Ok(())
    }

    /// Issue an update for every running process
    ///
    /// Lets long-lived processes accrue CPU without waiting for their exit.
    /// The lock is taken per process so kernel events keep flowing during a
    /// large scan. Returns the number of updates issued.
    pub fn rescan_long_lived(&self) -> Result<usize> {
        let running = self.host.scan()?;
        let mut issued = 0;
        for sample in &running {
            if !self.accepting() {
                break;
            }
            self.on_process_update(sample);
            issued += 1;
        }
        debug!(processes = issued, "rescanned long-lived processes");
        Ok(issued)
    }

    /// Evict records of processes that are gone
    ///
    /// Exit events can be missed (socket overflow, events racing a scan);
    /// without this the registry would only grow. Returns the number of
    /// records removed.
    pub fn sweep_stale_entries(&self) -> usize {
        let host = self.host.as_ref();
        let mut state = self.lock();
        let removed = state.sweep(|pid| host.is_alive(pid));
        if removed > 0 {
            info!(
                removed,
                remaining = state.registry.len(),
                "swept stale process records"
            );
        }
        removed
    }
}
