//! Ancestor walk crediting subtree totals
//!
//! Starting from the parent of the process an event is about, every
//! ancestor up to the root of the process tree gets the event's CPU time
//! (and exit count) added to its command's subtree totals. Ancestors the
//! registry does not know yet are resolved through the host and kept, so
//! the next walk through the same chain is pure table lookups.

use tracing::{debug, trace, warn};

use super::ledger::EventId;
use super::registry::ProcessRecord;
use super::{EngineState, Tally};
use crate::host::MetadataLookup;

/// Outcome of one ancestor walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Walk {
    /// Ancestors visited (pid > 1)
    pub visited: usize,
    /// Commands whose subtree totals changed
    pub credited: usize,
    /// Stopped by the depth guard rather than by reaching the root
    pub truncated: bool,
}

impl EngineState {
    pub(super) fn propagate<L: MetadataLookup + ?Sized>(
        &mut self,
        lookup: &L,
        max_depth: usize,
        event: EventId,
        starting_pid: i32,
        delta_time_us: u64,
        delta_count: u64,
    ) -> Walk {
        let mut walk = Walk::default();
        let mut pid = starting_pid;

        // pid 0/1: reached the root of the process tree
        while pid > 1 {
            if walk.visited >= max_depth {
                self.tally.truncated_walks += 1;
                walk.truncated = true;
                warn!(
                    event = event.0,
                    starting_pid,
                    max_depth,
                    "ancestor chain exceeds depth limit, walk truncated"
                );
                break;
            }
            walk.visited += 1;

            let tally = &mut self.tally;
            let record = self
                .registry
                .get_or_insert_with(pid, || resolve(lookup, pid, tally));

            let stats = self.ledger.entry(&record.command);
            if stats.credit_subtree(event, delta_time_us, delta_count) {
                walk.credited += 1;
            }
            pid = record.parent_pid;
        }

        trace!(
            event = event.0,
            starting_pid,
            visited = walk.visited,
            credited = walk.credited,
            "propagated"
        );
        walk
    }
}

/// Build a record for an ancestor seen for the first time
///
/// A vanished ancestor gets an empty command and parent 0, which ends the
/// walk after crediting the vanished bucket.
fn resolve<L: MetadataLookup + ?Sized>(lookup: &L, pid: i32, tally: &mut Tally) -> ProcessRecord {
    match lookup.lookup(pid) {
        Some(meta) => ProcessRecord::new(pid, meta.parent_pid, meta.command, 0),
        None => {
            tally.vanished += 1;
            debug!(pid, "ancestor vanished, chain ends here");
            ProcessRecord::vanished(pid)
        }
    }
}
