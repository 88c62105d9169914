// Engine behaviour over a hand-crafted process tree
//
// Every test drives the engine through FakeHost, the same way the kernel
// event channel and the /proc scanner drive it in production.

use super::*;
use crate::host::FakeHost;

fn engine(host: &Arc<FakeHost>) -> Engine {
    Engine::new(EngineConfig::default(), host.clone())
}

fn engine_with_history(host: &Arc<FakeHost>) -> Engine {
    let config = EngineConfig {
        history: true,
        ..EngineConfig::default()
    };
    Engine::new(config, host.clone())
}

/// sshd(100) -> bash(200) -> make(300), all children of init
fn build_tree() -> Arc<FakeHost> {
    let host = Arc::new(FakeHost::new());
    host.spawn(100, 1, "sshd", 0);
    host.spawn(200, 100, "bash", 0);
    host.spawn(300, 200, "make", 0);
    host
}

fn exit(pid: i32, parent_pid: i32, cpu_us: u64, command: &str) -> ProcessSample {
    ProcessSample::new(pid, parent_pid, cpu_us, command)
}

#[test]
fn test_exit_credits_own_and_every_ancestor_subtree() {
    let host = build_tree();
    let engine = engine(&host);

    engine.on_process_exit(&exit(400, 300, 5_000, "cc1"));

    let cc1 = engine.command("cc1").unwrap();
    assert_eq!(cc1.own_exec_count, 1);
    assert_eq!(cc1.own_exec_time_us, 5_000);
    assert_eq!(cc1.subtree_exec_count, 0);

    for ancestor in ["make", "bash", "sshd"] {
        let stats = engine.command(ancestor).unwrap();
        assert_eq!(stats.subtree_exec_count, 1, "{ancestor}");
        assert_eq!(stats.subtree_exec_time_us, 5_000, "{ancestor}");
        assert_eq!(stats.own_exec_count, 0, "{ancestor}");
    }
    assert_eq!(engine.counters().exit_count, 1);
}

#[test]
fn test_three_level_chain_excludes_own_subtree() {
    // A(10) -> B(20) -> C(30) -> root
    let host = Arc::new(FakeHost::new());
    host.spawn(30, 1, "c", 0);
    host.spawn(20, 30, "b", 0);
    let engine = engine(&host);

    engine.on_process_exit(&exit(10, 20, 5_000, "a"));

    let a = engine.command("a").unwrap();
    assert_eq!((a.own_exec_count, a.own_exec_time_us), (1, 5_000));
    assert_eq!(a.subtree_exec_count, 0);
    assert_eq!(engine.command("b").unwrap().subtree_exec_count, 1);
    assert_eq!(engine.command("c").unwrap().subtree_exec_count, 1);
}

#[test]
fn test_exit_count_conservation() {
    let host = build_tree();
    let engine = engine(&host);
    let commands = ["ls", "grep", "sed", "awk", "ls", "ls", "cat"];

    for (i, command) in commands.iter().enumerate() {
        engine.on_process_exit(&exit(1000 + i as i32, 300, 10 * i as u64, command));
    }

    let own_total: u64 = engine
        .ranked(Metric::OwnCount)
        .iter()
        .map(|s| s.own_exec_count)
        .sum();
    assert_eq!(own_total, commands.len() as u64);
    assert_eq!(engine.command("ls").unwrap().own_exec_count, 3);
    assert_eq!(engine.command("make").unwrap().subtree_exec_count, 7);
}

#[test]
fn test_repeated_command_in_chain_credited_once_per_event() {
    // bash(200) -> bash(210) -> bash(220) -> true
    let host = build_tree();
    host.spawn(210, 200, "bash", 0);
    host.spawn(220, 210, "bash", 0);
    let engine = engine(&host);

    engine.on_process_exit(&exit(230, 220, 700, "true"));

    let bash = engine.command("bash").unwrap();
    assert_eq!(bash.subtree_exec_count, 1);
    assert_eq!(bash.subtree_exec_time_us, 700);
    assert_eq!(engine.command("sshd").unwrap().subtree_exec_count, 1);
}

#[test]
fn test_propagate_is_idempotent_per_event() {
    let host = build_tree();
    let engine = engine(&host);
    let event = engine.next_event_id();

    let first = engine.propagate(event, 300, 1_000, 1);
    let second = engine.propagate(event, 300, 1_000, 1);

    assert_eq!(first.visited, 3);
    assert_eq!(first.credited, 3);
    assert_eq!(second.credited, 0);
    let make = engine.command("make").unwrap();
    assert_eq!((make.subtree_exec_count, make.subtree_exec_time_us), (1, 1_000));

    // A different event credits again
    engine.propagate(engine.next_event_id(), 300, 1_000, 1);
    assert_eq!(engine.command("make").unwrap().subtree_exec_count, 2);
}

#[test]
fn test_walk_stops_at_root() {
    let host = build_tree();
    let engine = engine(&host);

    let walk = engine.propagate(engine.next_event_id(), 1, 10, 1);
    assert_eq!(walk, Walk::default());
    let walk = engine.propagate(engine.next_event_id(), 0, 10, 1);
    assert_eq!(walk.visited, 0);
    assert!(engine.command("init").is_none());
}

#[test]
fn test_ancestors_resolved_once_then_cached() {
    let host = build_tree();
    let engine = engine(&host);

    engine.on_process_exit(&exit(400, 300, 1, "cc1"));
    let after_first = host.lookup_calls();
    assert_eq!(after_first, 3);

    engine.on_process_exit(&exit(401, 300, 1, "cc1"));
    assert_eq!(host.lookup_calls(), after_first);
    assert_eq!(engine.process(300).unwrap().command, "make");
}

#[test]
fn test_vanished_ancestor_ends_walk() {
    let host = Arc::new(FakeHost::new());
    let engine = engine(&host);

    // Parent 900 already gone
    engine.on_process_exit(&exit(901, 900, 250, "sleep"));

    let vanished = engine.command("").unwrap();
    assert_eq!(vanished.subtree_exec_count, 1);
    assert_eq!(vanished.subtree_exec_time_us, 250);
    assert_eq!(vanished.display_name(), "(vanished)");

    let counters = engine.counters();
    assert_eq!(counters.vanished_count, 1);
    assert!(engine.process(900).unwrap().is_vanished());
    assert_eq!(engine.command("sleep").unwrap().own_exec_count, 1);
}

#[test]
fn test_broken_chain_keeps_partial_credits() {
    // make(300) -> ghost(250, vanished): make was credited before the chain broke
    let host = Arc::new(FakeHost::new());
    host.spawn(300, 250, "make", 0);
    let engine = engine(&host);

    engine.on_process_exit(&exit(400, 300, 90, "cc1"));

    assert_eq!(engine.command("make").unwrap().subtree_exec_time_us, 90);
    assert_eq!(engine.command("").unwrap().subtree_exec_time_us, 90);
    assert_eq!(engine.counters().vanished_count, 1);
}

#[test]
fn test_cyclic_parent_chain_is_truncated() {
    let host = Arc::new(FakeHost::new());
    host.spawn(10, 11, "ping", 0);
    host.spawn(11, 10, "pong", 0);
    let config = EngineConfig {
        max_walk_depth: 8,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, host.clone());

    engine.on_process_exit(&exit(12, 10, 40, "leaf"));

    let counters = engine.counters();
    assert_eq!(counters.truncated_walks, 1);
    assert_eq!(engine.command("ping").unwrap().subtree_exec_count, 1);
    assert_eq!(engine.command("pong").unwrap().subtree_exec_count, 1);
    assert_eq!(engine.command("leaf").unwrap().own_exec_count, 1);
}

#[test]
fn test_update_first_sight_credits_full_reading_without_count() {
    let host = build_tree();
    let engine = engine(&host);

    engine.on_process_update(&ProcessSample::new(500, 300, 2_000, "rustc"));

    let rustc = engine.command("rustc").unwrap();
    assert_eq!(rustc.own_exec_time_us, 2_000);
    assert_eq!(rustc.own_exec_count, 0);
    let make = engine.command("make").unwrap();
    assert_eq!(make.subtree_exec_time_us, 2_000);
    assert_eq!(make.subtree_exec_count, 0);
    assert_eq!(engine.process(500).unwrap().cumulative_cpu_us, 2_000);
}

#[test]
fn test_update_known_process_credits_delta() {
    let host = build_tree();
    let engine = engine(&host);

    engine.on_process_update(&ProcessSample::new(500, 300, 2_000, "rustc"));
    engine.on_process_update(&ProcessSample::new(500, 300, 2_600, "rustc"));

    assert_eq!(engine.command("rustc").unwrap().own_exec_time_us, 2_600);
    assert_eq!(engine.command("make").unwrap().subtree_exec_time_us, 2_600);
}

#[test]
fn test_counter_decrease_credits_new_value() {
    assert_eq!(cpu_delta(100, 50), 50);
    assert_eq!(cpu_delta(100, 150), 50);
    assert_eq!(cpu_delta(0, 0), 0);

    let host = build_tree();
    let engine = engine(&host);
    engine.on_process_update(&ProcessSample::new(500, 300, 100, "java"));
    engine.on_process_update(&ProcessSample::new(500, 300, 50, "java"));

    // 100 on first sight, then 50 (not -50, not a wrapped difference)
    assert_eq!(engine.command("java").unwrap().own_exec_time_us, 150);
    assert_eq!(engine.process(500).unwrap().cumulative_cpu_us, 50);
}

#[test]
fn test_zero_delta_update_does_not_walk() {
    let host = build_tree();
    let engine = engine(&host);

    engine.on_process_update(&ProcessSample::new(500, 300, 0, "idle"));

    assert_eq!(host.lookup_calls(), 0);
    assert_eq!(engine.command("idle").unwrap(), CommandStats::new("idle"));
}

#[test]
fn test_exit_of_known_process_reuses_cached_metadata() {
    let host = build_tree();
    let engine = engine(&host);
    engine.on_process_update(&ProcessSample::new(500, 300, 10, "rustc"));
    let lookups = host.lookup_calls();

    // Exit event lacking command and parent: fall back to the record
    engine.on_process_exit(&exit(500, 0, 900, ""));

    assert_eq!(host.lookup_calls(), lookups);
    let rustc = engine.command("rustc").unwrap();
    assert_eq!(rustc.own_exec_count, 1);
    assert_eq!(rustc.own_exec_time_us, 10 + 900);
    assert_eq!(engine.command("make").unwrap().subtree_exec_count, 1);
    assert!(engine.process(500).is_none());
}

#[test]
fn test_exit_removes_record_created_by_walk() {
    let host = build_tree();
    let engine = engine(&host);
    engine.on_process_exit(&exit(400, 300, 5, "cc1"));
    assert!(engine.process(300).is_some());

    engine.on_process_exit(&exit(300, 200, 50, "make"));
    assert!(engine.process(300).is_none());
    assert_eq!(engine.command("make").unwrap().own_exec_count, 1);
}

/// A reading of `daemon`(500) under make, taken at `reading`, and its exit
fn daemon_events(reading: u64, exit_cpu: u64) -> (ProcessSample, ProcessSample) {
    (
        ProcessSample::new(500, 300, reading, "daemon"),
        exit(500, 300, exit_cpu, "daemon"),
    )
}

fn seeded_daemon_engine() -> (Arc<FakeHost>, Engine) {
    let host = build_tree();
    host.spawn(500, 300, "daemon", 30);
    let engine = engine(&host);
    engine.seed_running().unwrap();
    (host, engine)
}

#[test]
fn test_update_and_exit_of_one_pid_commute() {
    let (update, exit_event) = daemon_events(50, 60);

    let (_host, in_order) = seeded_daemon_engine();
    in_order.on_process_update(&update);
    in_order.on_process_exit(&exit_event);

    // Scan read /proc before the exit, but its update lands after it
    let (_host, late) = seeded_daemon_engine();
    late.on_process_exit(&exit_event);
    late.on_process_update(&update);

    let totals = |engine: &Engine, command: &str| {
        let s = engine.command(command).unwrap();
        (
            s.own_exec_count,
            s.own_exec_time_us,
            s.subtree_exec_count,
            s.subtree_exec_time_us,
        )
    };
    for command in ["daemon", "make", "bash", "sshd"] {
        assert_eq!(totals(&in_order, command), totals(&late, command), "{command}");
    }
    let daemon = late.command("daemon").unwrap();
    assert_eq!(daemon.own_exec_time_us, 20 + 60);
    assert_eq!(daemon.own_exec_count, 1);
    assert_eq!(late.command("make").unwrap().subtree_exec_time_us, 80);
}

#[test]
fn test_late_reading_leaves_no_record_for_exited_pid() {
    let (_host, engine) = seeded_daemon_engine();
    let (update, exit_event) = daemon_events(50, 60);

    engine.on_process_exit(&exit_event);
    engine.on_process_update(&update);
    // Same reading again: nothing new to charge
    engine.on_process_update(&update);

    assert!(engine.process(500).is_none());
    assert_eq!(engine.counters().process_count, 3);
    assert_eq!(engine.command("daemon").unwrap().own_exec_time_us, 80);
}

#[test]
fn test_reused_pid_after_exit_is_a_new_process() {
    let (_host, engine) = seeded_daemon_engine();
    let (_, exit_event) = daemon_events(50, 60);
    engine.on_process_exit(&exit_event);

    // Reading below the exited process's last one: another process
    engine.on_process_update(&ProcessSample::new(500, 200, 5, "vim"));

    assert_eq!(engine.command("vim").unwrap().own_exec_time_us, 5);
    assert_eq!(engine.command("daemon").unwrap().own_exec_time_us, 60);
    assert_eq!(engine.process(500).unwrap().command, "vim");
}

#[test]
fn test_histogram_records_exits_when_enabled() {
    let host = build_tree();
    let engine = engine_with_history(&host);

    engine.on_process_exit(&exit(400, 300, 950, "cc1"));
    engine.on_process_exit(&exit(401, 300, 0, "true"));
    engine.on_process_update(&ProcessSample::new(500, 300, 12_345, "rustc"));

    let histogram = engine.histogram_snapshot();
    assert_eq!(histogram.buckets[2], 1);
    assert_eq!(histogram.buckets[0], 1);
    assert_eq!(histogram.total(), 2);
}

#[test]
fn test_histogram_untouched_without_history() {
    let host = build_tree();
    let engine = engine(&host);

    for i in 0..20 {
        engine.on_process_exit(&exit(400 + i, 300, 10u64.pow(i as u32 % 8), "cc1"));
    }

    assert!(engine.histogram_snapshot().is_empty());
}

#[test]
fn test_seed_running_charges_nothing() {
    let host = build_tree();
    host.set_cpu(100, 9_000_000);
    host.set_cpu(300, 1_234);
    let engine = engine(&host);

    assert_eq!(engine.seed_running().unwrap(), 3);

    assert!(engine.ranked(Metric::OwnTime).is_empty());
    assert!(engine.ranked(Metric::SubtreeTime).is_empty());
    assert_eq!(engine.process(100).unwrap().cumulative_cpu_us, 9_000_000);
}

#[test]
fn test_rescan_accrues_long_lived_usage() {
    let host = build_tree();
    let engine = engine(&host);
    engine.seed_running().unwrap();

    host.set_cpu(300, 4_000);
    assert_eq!(engine.rescan_long_lived().unwrap(), 3);
    host.set_cpu(300, 4_500);
    engine.rescan_long_lived().unwrap();

    let make = engine.command("make").unwrap();
    assert_eq!(make.own_exec_time_us, 4_500);
    assert_eq!(make.own_exec_count, 0);
    assert_eq!(engine.command("bash").unwrap().subtree_exec_time_us, 4_500);
    assert_eq!(engine.command("sshd").unwrap().subtree_exec_time_us, 4_500);
}

#[test]
fn test_reset_window_zeroes_aggregates_and_reseeds() {
    let host = build_tree();
    host.set_cpu(300, 50_000);
    let engine = engine_with_history(&host);
    engine.on_process_exit(&exit(400, 300, 5_000, "cc1"));
    engine.rescan_long_lived().unwrap();
    assert!(!engine.ranked(Metric::OwnTime).is_empty());

    engine.reset_window().unwrap();

    for metric in [
        Metric::OwnCount,
        Metric::OwnTime,
        Metric::SubtreeCount,
        Metric::SubtreeTime,
    ] {
        assert!(engine.ranked(metric).is_empty(), "{metric:?}");
    }
    // Long-lived processes stay registered with their current reading
    let make = engine.process(300).unwrap();
    assert_eq!(make.cumulative_cpu_us, 50_000);
    assert_eq!(engine.command("cc1").unwrap(), CommandStats::new("cc1"));
    assert!(engine.histogram_snapshot().is_empty());

    let counters = engine.counters();
    assert_eq!(counters.exit_count, 0);
    assert_eq!(counters.process_count, 3);
    assert_eq!(engine.window().sample, 1);

    // Only post-reset usage is charged
    host.set_cpu(300, 50_700);
    engine.rescan_long_lived().unwrap();
    assert_eq!(engine.command("make").unwrap().own_exec_time_us, 700);
}

#[test]
fn test_reset_keeps_histogram_without_history() {
    let host = build_tree();
    let engine = engine(&host);
    engine.reset_window().unwrap();
    assert!(engine.histogram_snapshot().is_empty());
    assert_eq!(engine.window().sample, 1);
}

#[test]
fn test_sweep_removes_dead_processes() {
    let host = build_tree();
    let engine = engine(&host);
    engine.seed_running().unwrap();
    engine.on_process_exit(&exit(400, 300, 5, "cc1"));

    // make died and its exit event was missed
    host.reap(300);
    assert_eq!(engine.sweep_stale_entries(), 1);

    assert!(engine.process(300).is_none());
    assert!(engine.process(200).is_some());
    let counters = engine.counters();
    assert_eq!(counters.removed_count, 1);
    assert_eq!(counters.process_count, 2);

    assert_eq!(engine.sweep_stale_entries(), 0);
}

#[test]
fn test_top_queries_truncate_and_order() {
    let host = build_tree();
    let engine = engine(&host);
    for (i, (command, cpu)) in [("a", 30), ("b", 10), ("c", 20), ("b", 10)].iter().enumerate() {
        engine.on_process_exit(&exit(1000 + i as i32, 300, *cpu, command));
    }

    let by_time: Vec<_> = engine.top_by_own_time(2).into_iter().map(|s| s.command).collect();
    assert_eq!(by_time, vec!["a", "b"]);
    let by_count: Vec<_> = engine.top_by_own_count(1).into_iter().map(|s| s.command).collect();
    assert_eq!(by_count, vec!["b"]);

    let subtree: Vec<_> = engine
        .top_by_subtree_count(10)
        .into_iter()
        .map(|s| s.command)
        .collect();
    assert_eq!(subtree, vec!["bash", "make", "sshd"]);
    assert_eq!(engine.top_by_subtree_time(0).len(), 0);
}

#[test]
fn test_shutdown_ignores_later_events() {
    let host = build_tree();
    let engine = engine(&host);
    engine.deliver(ProcessEvent::Exit(exit(400, 300, 5, "cc1")));

    let counters = engine.shutdown();
    assert_eq!(counters.exit_count, 1);
    assert!(engine.is_shut_down());

    engine.deliver(ProcessEvent::Exit(exit(401, 300, 5, "cc1")));
    engine.on_process_update(&ProcessSample::new(402, 300, 5, "cc1"));
    assert_eq!(engine.counters().exit_count, 1);
    assert_eq!(engine.command("cc1").unwrap().own_exec_time_us, 5);
}

#[test]
fn test_mark_displayed() {
    let host = build_tree();
    let engine = engine(&host);
    assert!(engine.window().is_first_display());
    engine.mark_displayed();
    assert!(!engine.window().is_first_display());
    assert_eq!(engine.window().display, 1);
}

#[test]
fn test_concurrent_delivery_matches_serial_totals() {
    let host = build_tree();
    let engine = Arc::new(engine(&host));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for i in 0..250 {
                    let pid = 10_000 + t * 1_000 + i;
                    engine.on_process_exit(&exit(pid, 300, 3, "worker"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let worker = engine.command("worker").unwrap();
    assert_eq!(worker.own_exec_count, 1_000);
    assert_eq!(worker.own_exec_time_us, 3_000);
    assert_eq!(engine.command("sshd").unwrap().subtree_exec_count, 1_000);
    assert_eq!(engine.counters().exit_count, 1_000);
}
