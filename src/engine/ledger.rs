//! Per-command aggregates
//!
//! Two views per command name:
//! - **own**: every process instance running that command
//! - **subtree**: every descendant of any instance (own instances excluded)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Identifies one ingested event for subtree deduplication
///
/// Allocated from a per-engine sequence, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Ranking criterion for the query surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    OwnCount,
    OwnTime,
    SubtreeCount,
    SubtreeTime,
}

/// Aggregates for one command name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    /// Command name, empty for vanished processes
    pub command: String,
    pub own_exec_count: u64,
    /// Microseconds
    pub own_exec_time_us: u64,
    pub subtree_exec_count: u64,
    /// Microseconds
    pub subtree_exec_time_us: u64,
    /// Last event credited to the subtree totals
    #[serde(skip)]
    pub last_credited: Option<EventId>,
}

impl CommandStats {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn credit_own(&mut self, time_us: u64, count: u64) {
        self.own_exec_time_us = self.own_exec_time_us.saturating_add(time_us);
        self.own_exec_count = self.own_exec_count.saturating_add(count);
    }

    /// Credit a descendant's usage, at most once per event
    ///
    /// Returns `false` when `event` was already credited.
    pub fn credit_subtree(&mut self, event: EventId, time_us: u64, count: u64) -> bool {
        if self.last_credited == Some(event) {
            return false;
        }
        self.subtree_exec_time_us = self.subtree_exec_time_us.saturating_add(time_us);
        self.subtree_exec_count = self.subtree_exec_count.saturating_add(count);
        self.last_credited = Some(event);
        true
    }

    pub fn metric(&self, metric: Metric) -> u64 {
        match metric {
            Metric::OwnCount => self.own_exec_count,
            Metric::OwnTime => self.own_exec_time_us,
            Metric::SubtreeCount => self.subtree_exec_count,
            Metric::SubtreeTime => self.subtree_exec_time_us,
        }
    }

    /// Zero every aggregate, keeping the name
    pub fn clear(&mut self) {
        *self = Self::new(std::mem::take(&mut self.command));
    }

    pub fn is_vanished(&self) -> bool {
        self.command.is_empty()
    }

    /// Name for display, `(vanished)` for the unresolved bucket
    pub fn display_name(&self) -> &str {
        if self.command.is_empty() {
            "(vanished)"
        } else {
            &self.command
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandLedger {
    commands: HashMap<String, CommandStats>,
}

impl CommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats for `command`, created on first reference
    pub fn entry(&mut self, command: &str) -> &mut CommandStats {
        self.commands
            .entry(command.to_string())
            .or_insert_with_key(|name| CommandStats::new(name.clone()))
    }

    pub fn get(&self, command: &str) -> Option<&CommandStats> {
        self.commands.get(command)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Zero all aggregates (names are kept)
    pub fn reset(&mut self) {
        for stats in self.commands.values_mut() {
            stats.clear();
        }
    }

    /// Commands with a non-zero `metric`, highest first
    ///
    /// Ties are ordered by command name so a given snapshot always ranks
    /// the same way.
    pub fn ranked(&self, metric: Metric) -> Vec<CommandStats> {
        let mut ranked: Vec<CommandStats> = self
            .commands
            .values()
            .filter(|s| s.metric(metric) > 0)
            .cloned()
            .collect();
        ranked.sort_by(|a, b| compare_by(metric, a, b));
        ranked
    }
}

fn compare_by(metric: Metric, a: &CommandStats, b: &CommandStats) -> Ordering {
    b.metric(metric)
        .cmp(&a.metric(metric))
        .then_with(|| a.command.cmp(&b.command))
}
