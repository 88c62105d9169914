//! CLI argument parsing for topfast

use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables (default)
    Text,
    /// `:`-separated rows for scripts
    Raw,
    /// One JSON object per report
    Json,
}

/// Ranking criterion for the top sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// CPU time
    Time,
    /// Number of exited processes
    Count,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Time => "time",
            SortKey::Count => "count",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "topfast")]
#[command(version)]
#[command(
    about = "Per-command CPU accounting that catches even the shortest-lived processes",
    long_about = None
)]
pub struct Cli {
    /// Write reports to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Sort criterion for the top sections
    #[arg(short, long, value_enum, default_value = "time")]
    pub sort: SortKey,

    /// Periodic report interval, e.g. 10s or 1m (0s disables) [default: 10s]
    #[arg(short, long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Script-friendly raw output (same as --format raw)
    #[arg(short, long, conflicts_with = "format")]
    pub raw: bool,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Start a new sample window after every periodic report
    #[arg(short, long)]
    pub clear: bool,

    /// Track the execution-time histogram of exited processes
    #[arg(short = 'H', long)]
    pub history: bool,

    /// Lines per top section (0 hides the sections)
    #[arg(short, long, value_name = "N", default_value = "10")]
    pub top: usize,

    /// TOML configuration file; explicit flags override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Interval between long-lived process rescans (0s disables)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub rescan_interval: Option<Duration>,

    /// Interval between stale process sweeps (0s disables)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub sweep_interval: Option<Duration>,

    /// Maximum ancestors visited per event
    #[arg(long = "max-depth", value_name = "N")]
    pub max_depth: Option<usize>,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn output_format(&self) -> OutputFormat {
        if self.raw {
            OutputFormat::Raw
        } else {
            self.format.unwrap_or(OutputFormat::Text)
        }
    }

    /// Overlay explicitly given flags on a loaded configuration
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(interval) = self.interval {
            config.service.report_interval = interval;
        }
        if self.clear {
            config.service.clear_on_report = true;
        }
        if self.history {
            config.engine.history = true;
        }
        if let Some(interval) = self.rescan_interval {
            config.service.rescan_interval = interval;
        }
        if let Some(interval) = self.sweep_interval {
            config.service.sweep_interval = interval;
        }
        if let Some(depth) = self.max_depth {
            config.engine.max_walk_depth = depth;
        }
    }
}
