//! Per-command CPU accounting engine
//!
//! Combines two feeds into per-command aggregates:
//!
//! - **Exit events** pushed by the kernel with a process's exact lifetime CPU
//!   usage, so even processes living a few microseconds are accounted.
//! - **Update events** from a periodic scan of running processes, so
//!   long-lived processes accrue CPU between their start and their exit.
//!
//! Every event is charged to its own command and, through an ancestor walk,
//! to the *subtree* totals of every live ancestor's command.
//!
//! # Concurrency
//!
//! The registry, ledger, histogram and sample window live behind one mutex
//! and are always mutated together. One event (own credit, walk, histogram)
//! is applied within a single lock acquisition. Queries take the lock
//! independently, so a report assembled from several queries is not an atomic
//! snapshot.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use topfast::config::EngineConfig;
//! use topfast::engine::Engine;
//! use topfast::host::{FakeHost, ProcessSample};
//!
//! let host = Arc::new(FakeHost::new());
//! host.spawn(100, 1, "make", 0);
//!
//! let engine = Engine::new(EngineConfig::default(), host);
//! engine.on_process_exit(&ProcessSample::new(101, 100, 5_000, "cc1"));
//!
//! assert_eq!(engine.command("cc1").unwrap().own_exec_time_us, 5_000);
//! assert_eq!(engine.command("make").unwrap().subtree_exec_count, 1);
//! ```

mod histogram;
mod ingest;
mod ledger;
mod propagation;
mod registry;
mod sampling;

pub use histogram::{bucket_index, bucket_upper_bound, HistogramSnapshot, HISTOGRAM_BUCKETS};
pub use ingest::cpu_delta;
pub use ledger::{CommandStats, EventId, Metric};
pub use propagation::Walk;
pub use registry::ProcessRecord;
pub use sampling::SampleWindow;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::host::{Host, ProcessSample};
use crate::source::{EventSink, ProcessEvent};
use histogram::HistogramRecorder;
use ledger::CommandLedger;
use registry::ProcessRegistry;

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Exit events ingested in the current sample window
    pub exit_count: u64,
    /// Metadata lookups that found no process (session total)
    pub vanished_count: u64,
    /// Records evicted by the liveness sweep (session total)
    pub removed_count: u64,
    /// Distinct command names in the ledger
    pub command_count: usize,
    /// Records in the process registry
    pub process_count: usize,
    /// Ancestor walks cut short by the depth guard (session total)
    pub truncated_walks: u64,
}

#[derive(Debug, Default)]
struct Tally {
    exits: u64,
    vanished: u64,
    removed: u64,
    truncated_walks: u64,
}

/// Everything guarded by the engine lock
#[derive(Debug)]
struct EngineState {
    registry: ProcessRegistry,
    ledger: CommandLedger,
    histogram: HistogramRecorder,
    window: SampleWindow,
    tally: Tally,
    last_event: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            registry: ProcessRegistry::new(),
            ledger: CommandLedger::new(),
            histogram: HistogramRecorder::new(),
            window: SampleWindow::new(),
            tally: Tally::default(),
            last_event: 0,
        }
    }

    fn next_event(&mut self) -> EventId {
        self.last_event += 1;
        EventId(self.last_event)
    }

    fn counters(&self) -> Counters {
        Counters {
            exit_count: self.tally.exits,
            vanished_count: self.tally.vanished,
            removed_count: self.tally.removed,
            command_count: self.ledger.len(),
            process_count: self.registry.len(),
            truncated_walks: self.tally.truncated_walks,
        }
    }
}

/// The accounting engine: registry, ledger, histogram and sample window
pub struct Engine {
    state: Mutex<EngineState>,
    host: Arc<dyn Host>,
    config: EngineConfig,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("counters", &self.counters())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, host: Arc<dyn Host>) -> Self {
        Self {
            state: Mutex::new(EngineState::new()),
            host,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // The tables only hold counters: a panic mid-update cannot break them
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepting(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    /// Liveness refresh for a running process
    pub fn on_process_update(&self, sample: &ProcessSample) {
        if !self.accepting() {
            return;
        }
        let mut state = self.lock();
        state.apply_update(self.host.as_ref(), &self.config, sample, false);
    }

    /// Final accounting for a terminated process
    pub fn on_process_exit(&self, sample: &ProcessSample) {
        if !self.accepting() {
            return;
        }
        let mut state = self.lock();
        state.apply_exit(self.host.as_ref(), &self.config, sample);
    }

    /// Allocate an id for an externally driven [`Engine::propagate`] call
    pub fn next_event_id(&self) -> EventId {
        self.lock().next_event()
    }

    /// Credit `starting_pid` and all its ancestors' subtree totals
    ///
    /// Ancestors already credited for `event` are skipped, so repeating a
    /// call with the same id never double counts.
    pub fn propagate(&self, event: EventId, starting_pid: i32, delta_time_us: u64, delta_count: u64) -> Walk {
        let mut state = self.lock();
        state.propagate(
            self.host.as_ref(),
            self.config.max_walk_depth,
            event,
            starting_pid,
            delta_time_us,
            delta_count,
        )
    }

    /// Every command with a non-zero `metric`, highest first
    pub fn ranked(&self, metric: Metric) -> Vec<CommandStats> {
        self.lock().ledger.ranked(metric)
    }

    /// Up to `n` commands ordered by `metric`
    pub fn top_by(&self, metric: Metric, n: usize) -> Vec<CommandStats> {
        let mut ranked = self.ranked(metric);
        ranked.truncate(n);
        ranked
    }

    pub fn top_by_own_count(&self, n: usize) -> Vec<CommandStats> {
        self.top_by(Metric::OwnCount, n)
    }

    pub fn top_by_own_time(&self, n: usize) -> Vec<CommandStats> {
        self.top_by(Metric::OwnTime, n)
    }

    pub fn top_by_subtree_count(&self, n: usize) -> Vec<CommandStats> {
        self.top_by(Metric::SubtreeCount, n)
    }

    pub fn top_by_subtree_time(&self, n: usize) -> Vec<CommandStats> {
        self.top_by(Metric::SubtreeTime, n)
    }

    pub fn command(&self, command: &str) -> Option<CommandStats> {
        self.lock().ledger.get(command).cloned()
    }

    pub fn process(&self, pid: i32) -> Option<ProcessRecord> {
        self.lock().registry.get(pid).cloned()
    }

    pub fn histogram_snapshot(&self) -> HistogramSnapshot {
        self.lock().histogram.snapshot()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters()
    }

    pub fn window(&self) -> SampleWindow {
        self.lock().window.clone()
    }

    /// Advance the display index after a report has been written
    pub fn mark_displayed(&self) {
        self.lock().window.display += 1;
    }

    /// Stop accepting events and return the final counters
    ///
    /// An event already holding the lock completes; later deliveries and
    /// scans are ignored.
    pub fn shutdown(&self) -> Counters {
        self.shut_down.store(true, Ordering::Release);
        let counters = self.counters();
        info!(
            exits = counters.exit_count,
            commands = counters.command_count,
            vanished = counters.vanished_count,
            removed = counters.removed_count,
            "engine shut down"
        );
        counters
    }

    pub fn is_shut_down(&self) -> bool {
        !self.accepting()
    }
}

impl EventSink for Engine {
    fn deliver(&self, event: ProcessEvent) {
        if self.is_shut_down() {
            debug!(?event, "event dropped after shutdown");
            return;
        }
        match event {
            ProcessEvent::Update(sample) => self.on_process_update(&sample),
            ProcessEvent::Exit(sample) => self.on_process_exit(&sample),
        }
    }
}

#[cfg(test)]
mod tests;
