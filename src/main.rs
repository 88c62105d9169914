use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex, PoisonError};
use topfast::cli::Cli;
use topfast::config::Config;
use topfast::engine::Engine;
use topfast::host::ProcFs;
use topfast::report::{ReportOptions, Reporter};
use topfast::service::Service;
use topfast::signals;
use topfast::source::{EventSource, TaskstatsSource};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` raises the level to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration file (if any) overlaid with explicit flags
fn load_config(args: &Cli) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    args.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

fn open_output(args: &Cli) -> Result<Box<dyn Write + Send>> {
    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let output = open_output(&args)?;

    // Before any thread exists, so that every thread inherits the mask
    let signal_set = signals::block_handled()?;

    let mut source = TaskstatsSource::open().context("Cannot listen for process exits")?;

    let engine = Arc::new(Engine::new(config.engine.clone(), Arc::new(ProcFs::new())));
    let seeded = engine
        .seed_running()
        .context("Failed to scan running processes")?;
    info!(seeded, "registry seeded with running processes");

    let options = ReportOptions {
        format: args.output_format(),
        sort: args.sort,
        top: args.top,
    };
    let reporter = Arc::new(Reporter::new(Arc::clone(&engine), options, output));
    let service = Arc::new(Mutex::new(Service::start(
        Arc::clone(&reporter),
        &config.service,
    )?));

    let on_shutdown = {
        let service = Arc::clone(&service);
        move |_: Signal| {
            service
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stop();
            std::process::exit(0);
        }
    };
    signals::spawn_signal_thread(signal_set, Arc::clone(&reporter), on_shutdown)?;

    info!(source = source.name(), "collecting process events");
    let outcome = source.run(engine.as_ref());

    // Only reached when the source gives up
    service
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .stop();
    if let Err(error) = reporter.report() {
        error!(error = %format!("{error:#}"), "final report failed");
    }
    engine.shutdown();

    outcome.with_context(|| format!("Event source {} failed", source.name()))
}
