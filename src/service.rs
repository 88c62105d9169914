//! Background timers: periodic report, long-lived rescan, stale sweep
//!
//! Each enabled timer runs on its own thread, selecting between a
//! `crossbeam` tick channel and a shared stop channel. Dropping the stop
//! sender disconnects the channel, which wakes every timer thread at once.

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::report::Reporter;

/// Running timer threads
#[derive(Debug)]
pub struct Service {
    stop: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Service {
    /// Spawn one thread per enabled timer
    pub fn start(reporter: Arc<Reporter>, config: &ServiceConfig) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(0);
        let mut workers = Vec::new();

        let clear_on_report = config.clear_on_report;
        let periodic = Arc::clone(&reporter);
        workers.extend(spawn_timer("report", config.report_interval, &stopped, move || {
            let result = if clear_on_report {
                periodic.report_and_reset()
            } else {
                periodic.report()
            };
            if let Err(error) = result {
                error!(error = %format!("{error:#}"), "periodic report failed");
            }
        })?);

        let engine = Arc::clone(reporter.engine());
        workers.extend(spawn_timer("rescan", config.rescan_interval, &stopped, move || {
            if let Err(error) = engine.rescan_long_lived() {
                warn!(error = %format!("{error:#}"), "long-lived process rescan failed");
            }
        })?);

        let engine = Arc::clone(reporter.engine());
        workers.extend(spawn_timer("sweep", config.sweep_interval, &stopped, move || {
            engine.sweep_stale_entries();
        })?);

        info!(
            timers = workers.len(),
            report_interval = ?config.report_interval,
            rescan_interval = ?config.rescan_interval,
            sweep_interval = ?config.sweep_interval,
            "service started"
        );
        Ok(Self {
            stop: Some(stop),
            workers,
        })
    }

    /// Number of running timer threads
    pub fn timers(&self) -> usize {
        self.workers.len()
    }

    /// Stop every timer and wait for in-flight work to finish
    pub fn stop(&mut self) {
        if self.stop.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        debug!("service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_timer<F>(
    name: &'static str,
    period: Duration,
    stopped: &Receiver<()>,
    mut task: F,
) -> Result<Option<JoinHandle<()>>>
where
    F: FnMut() + Send + 'static,
{
    if period.is_zero() {
        debug!(timer = name, "timer disabled");
        return Ok(None);
    }

    let ticker = tick(period);
    let stopped = stopped.clone();
    let handle = thread::Builder::new()
        .name(format!("topfast-{name}"))
        .spawn(move || loop {
            select! {
                recv(stopped) -> _ => break,
                recv(ticker) -> _ => task(),
            }
        })
        .with_context(|| format!("Failed to spawn {name} timer thread"))?;
    Ok(Some(handle))
}
