//! Replay of a fixed event sequence
//!
//! Drives the engine deterministically in tests, benches and fuzzing.

use std::collections::VecDeque;

use super::{EventSink, EventSource, ProcessEvent, SourceError};
use crate::host::ProcessSample;

#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    events: VecDeque<ProcessEvent>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(mut self, pid: i32, parent_pid: i32, command: &str, cpu_us: u64) -> Self {
        self.events
            .push_back(ProcessEvent::Update(ProcessSample::new(pid, parent_pid, cpu_us, command)));
        self
    }

    pub fn exit(mut self, pid: i32, parent_pid: i32, command: &str, cpu_us: u64) -> Self {
        self.events
            .push_back(ProcessEvent::Exit(ProcessSample::new(pid, parent_pid, cpu_us, command)));
        self
    }

    pub fn push(&mut self, event: ProcessEvent) {
        self.events.push_back(event);
    }

    /// Events not yet delivered
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl FromIterator<ProcessEvent> for ScriptedSource {
    fn from_iter<I: IntoIterator<Item = ProcessEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

impl EventSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn run(&mut self, sink: &dyn EventSink) -> Result<(), SourceError> {
        while let Some(event) = self.events.pop_front() {
            sink.deliver(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::host::FakeHost;
    use std::sync::Arc;

    #[test]
    fn test_replays_in_order() {
        let host = Arc::new(FakeHost::new());
        host.spawn(50, 1, "bash", 0);
        let engine = Engine::new(EngineConfig::default(), host);

        let mut source = ScriptedSource::new()
            .update(60, 50, "vim", 1_000)
            .update(60, 50, "vim", 1_500)
            .exit(60, 50, "vim", 1_800);
        assert_eq!(source.remaining(), 3);

        source.run(&engine).unwrap();
        assert_eq!(source.remaining(), 0);

        let vim = engine.command("vim").unwrap();
        // 1000 + 500 from updates, 1800 on exit
        assert_eq!(vim.own_exec_time_us, 3_300);
        assert_eq!(vim.own_exec_count, 1);
        assert_eq!(engine.command("bash").unwrap().subtree_exec_count, 1);
    }

    #[test]
    fn test_collect_from_iterator() {
        let source: ScriptedSource = (0..5)
            .map(|i| ProcessEvent::Exit(ProcessSample::new(100 + i, 1, 10, "true")))
            .collect();
        assert_eq!(source.remaining(), 5);
        assert_eq!(source.name(), "scripted");
    }
}
