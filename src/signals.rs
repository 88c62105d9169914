//! Signal handling
//!
//! - `SIGUSR1`: write a report
//! - `SIGUSR2`: write a report, then start a new sample window
//! - `SIGTERM` / `SIGINT`: final report, engine shutdown, exit
//!
//! The handled signals are blocked in every thread (block them before
//! spawning any) and consumed synchronously by one thread with `sigwait`, so
//! handlers are ordinary code that may lock and allocate.

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::report::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Report,
    ReportAndReset,
    Shutdown,
}

pub fn action_for(signal: Signal) -> Option<SignalAction> {
    match signal {
        Signal::SIGUSR1 => Some(SignalAction::Report),
        Signal::SIGUSR2 => Some(SignalAction::ReportAndReset),
        Signal::SIGTERM | Signal::SIGINT => Some(SignalAction::Shutdown),
        _ => None,
    }
}

pub fn handled_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGTERM, Signal::SIGINT] {
        set.add(signal);
    }
    set
}

/// Block the handled signals in the calling thread
///
/// Threads spawned afterwards inherit the mask.
pub fn block_handled() -> Result<SigSet> {
    let set = handled_signals();
    set.thread_block().context("Failed to block signals")?;
    Ok(set)
}

fn log_failure(what: &str, result: Result<()>) {
    if let Err(error) = result {
        error!(error = %format!("{error:#}"), "{what} failed");
    }
}

/// Consume `signals` on a dedicated thread
///
/// On a shutdown signal the final report is written, the engine is shut
/// down and `on_shutdown` runs on the signal thread; it is expected to end
/// the process.
pub fn spawn_signal_thread<F>(signals: SigSet, reporter: Arc<Reporter>, on_shutdown: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(Signal) + Send + 'static,
{
    thread::Builder::new()
        .name("topfast-signals".to_string())
        .spawn(move || {
            let mut on_shutdown = Some(on_shutdown);
            loop {
                let signal = match signals.wait() {
                    Ok(signal) => signal,
                    Err(errno) => {
                        error!(%errno, "sigwait failed, signals no longer handled");
                        return;
                    }
                };
                let Some(action) = action_for(signal) else {
                    debug!(signal = signal.as_str(), "ignoring signal");
                    continue;
                };
                info!(signal = signal.as_str(), ?action, "signal received");

                match action {
                    SignalAction::Report => log_failure("report", reporter.report()),
                    SignalAction::ReportAndReset => {
                        log_failure("report and reset", reporter.report_and_reset())
                    }
                    SignalAction::Shutdown => {
                        log_failure("final report", reporter.report());
                        log_failure(
                            "farewell",
                            reporter.farewell(&format!("{} signal", signal.as_str())),
                        );
                        reporter.engine().shutdown();
                        if let Some(on_shutdown) = on_shutdown.take() {
                            on_shutdown(signal);
                        }
                        return;
                    }
                }
            }
        })
        .context("Failed to spawn signal thread")
}
