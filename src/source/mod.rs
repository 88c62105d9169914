//! Process event channel
//!
//! An [`EventSource`] produces [`ProcessEvent`]s and pushes them into an
//! [`EventSink`] (normally the [`crate::engine::Engine`]). The source owns the
//! calling thread until it is exhausted or fails.

pub mod scripted;
pub mod taskstats;

pub use scripted::ScriptedSource;
pub use taskstats::TaskstatsSource;

use thiserror::Error;

use crate::host::ProcessSample;

/// One observation of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Liveness refresh for a running process with its cumulative CPU
    Update(ProcessSample),
    /// Final accounting for a terminated process with its lifetime CPU
    Exit(ProcessSample),
}

impl ProcessEvent {
    pub fn sample(&self) -> &ProcessSample {
        match self {
            ProcessEvent::Update(sample) | ProcessEvent::Exit(sample) => sample,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, ProcessEvent::Exit(_))
    }
}

/// Consumer of process events; must tolerate concurrent delivery
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ProcessEvent);
}

/// Producer of process events
pub trait EventSource: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Deliver events until the source is exhausted or fails
    fn run(&mut self, sink: &dyn EventSink) -> Result<(), SourceError>;
}

/// Errors raised by event sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open event channel: {0} (CAP_NET_ADMIN is required)")]
    Open(#[source] std::io::Error),

    #[error("taskstats generic netlink family not available: {0}")]
    FamilyUnavailable(String),

    #[error("cannot register for exit events on cpus {mask}: {source}")]
    Register {
        mask: String,
        #[source]
        source: std::io::Error,
    },

    #[error("event channel receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("malformed netlink message: {0}")]
    Malformed(&'static str),
}
