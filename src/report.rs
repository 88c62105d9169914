//! Report rendering
//!
//! A report is assembled from engine queries into a [`ReportData`] and then
//! rendered as text tables, `:`-separated raw rows or JSON. Rendering is pure
//! so every format can be tested without a live engine.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::cli::{OutputFormat, SortKey};
use crate::engine::{
    bucket_upper_bound, CommandStats, Counters, Engine, HistogramSnapshot, Metric,
};
use crate::host::procfs::configured_cpus;

/// Commands every process descends from; their subtree totals say nothing
const UBIQUITOUS_ANCESTORS: [&str; 2] = ["init", "systemd"];

const SEPARATOR_WIDTH: usize = 80;

/// One line of a top section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub command: String,
    pub time_us: u64,
    pub count: u64,
    /// Share of the machine's CPU capacity over the sample
    pub cpu_percent: f64,
    /// Share of the section's total count
    pub count_percent: f64,
    pub count_per_sec: f64,
}

/// Everything a report shows, captured at report time
#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    /// Unix time in seconds
    pub timestamp: u64,
    pub hostname: String,
    pub date: String,
    pub cpus: usize,
    #[serde(with = "humantime_serde")]
    pub sample_duration: Duration,
    pub counters: Counters,
    pub sort: SortKey,
    pub top: usize,
    /// Reports written before this one
    pub display: u64,
    pub commands: Vec<Row>,
    pub subtrees: Vec<Row>,
    pub histogram: Option<HistogramSnapshot>,
}

impl ReportData {
    /// Query the engine for one report
    ///
    /// Queries take the engine lock one by one; events landing in between
    /// show up in some sections and not others.
    pub fn collect(engine: &Engine, sort: SortKey, top: usize, cpus: usize, hostname: &str) -> Self {
        let now = SystemTime::now();
        let window = engine.window();
        let sample_duration = window.elapsed();
        let seconds = sample_duration.as_secs_f64();

        let (own_metric, subtree_metric) = match sort {
            SortKey::Time => (Metric::OwnTime, Metric::SubtreeTime),
            SortKey::Count => (Metric::OwnCount, Metric::SubtreeCount),
        };

        let own = engine.ranked(own_metric);
        let subtree: Vec<CommandStats> = engine
            .ranked(subtree_metric)
            .into_iter()
            .filter(|stats| !stats.is_vanished() && !UBIQUITOUS_ANCESTORS.contains(&stats.command.as_str()))
            .collect();

        Self {
            timestamp: now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
            hostname: hostname.to_string(),
            date: humantime::format_rfc3339_seconds(now).to_string(),
            cpus,
            sample_duration,
            counters: engine.counters(),
            sort,
            top,
            display: window.display,
            commands: build_rows(&own, false, top, cpus, seconds),
            subtrees: build_rows(&subtree, true, top, cpus, seconds),
            histogram: engine.config().history.then(|| engine.histogram_snapshot()),
        }
    }

    fn seconds(&self) -> f64 {
        self.sample_duration.as_secs_f64()
    }

    fn exit_rate(&self) -> f64 {
        rate(self.counters.exit_count, self.seconds())
    }
}

/// `100 * time / (cpus * sample duration)`
pub fn cpu_percent(time_us: u64, cpus: usize, seconds: f64) -> f64 {
    let capacity_us = cpus as f64 * seconds * 1e6;
    if capacity_us > 0.0 {
        100.0 * time_us as f64 / capacity_us
    } else {
        0.0
    }
}

fn share(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

fn rate(count: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        count as f64 / seconds
    } else {
        0.0
    }
}

/// Histogram cell value: percentage of exits, rounded up to 0.01
pub fn histogram_percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let hundredths = (10_000 * u128::from(count)).div_ceil(u128::from(total));
    hundredths as f64 / 100.0
}

/// Rows for the first `top` entries of an already ranked list
///
/// Count percentages are relative to the whole list, not just the rows shown.
pub fn build_rows(stats: &[CommandStats], subtree: bool, top: usize, cpus: usize, seconds: f64) -> Vec<Row> {
    let pick = |s: &CommandStats| {
        if subtree {
            (s.subtree_exec_time_us, s.subtree_exec_count)
        } else {
            (s.own_exec_time_us, s.own_exec_count)
        }
    };
    let count_total: u64 = stats.iter().map(|s| pick(s).1).sum();

    stats
        .iter()
        .take(top)
        .map(|s| {
            let (time_us, count) = pick(s);
            Row {
                command: s.display_name().to_string(),
                time_us,
                count,
                cpu_percent: cpu_percent(time_us, cpus, seconds),
                count_percent: share(count, count_total),
                count_per_sec: rate(count, seconds),
            }
        })
        .collect()
}

fn separator(title: &str) -> String {
    format!("{title:=^width$}", width = SEPARATOR_WIDTH)
}

fn exec_time(time_us: u64) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_micros(time_us))
}

fn write_header<W: fmt::Write>(out: &mut W, data: &ReportData, prefix: &str) -> fmt::Result {
    // Sub-millisecond precision is noise at report intervals
    let duration = Duration::from_millis(data.sample_duration.as_millis() as u64);
    writeln!(out, "{prefix}hostname:           {}", data.hostname)?;
    writeln!(out, "{prefix}date:               {}", data.date)?;
    writeln!(out, "{prefix}cpus:               {}", data.cpus)?;
    writeln!(out, "{prefix}sample duration:    {}", humantime::format_duration(duration))?;
    writeln!(
        out,
        "{prefix}exit count:         {} ({:.2}e/s)",
        data.counters.exit_count,
        data.exit_rate()
    )?;
    writeln!(out, "{prefix}number of commands: {}", data.counters.command_count)
}

fn write_text_rows<W: fmt::Write>(out: &mut W, rows: &[Row], sort: SortKey) -> fmt::Result {
    for row in rows {
        match sort {
            SortKey::Time => writeln!(
                out,
                "{:>15}: {:.2}%et ({})   {:.2}%ec ({}) {:.2}e/s",
                row.command,
                row.cpu_percent,
                exec_time(row.time_us),
                row.count_percent,
                row.count,
                row.count_per_sec
            )?,
            SortKey::Count => writeln!(
                out,
                "{:>15}: {:.2}%ec ({}) {:.2}e/s   {:.2}%et ({})",
                row.command,
                row.count_percent,
                row.count,
                row.count_per_sec,
                row.cpu_percent,
                exec_time(row.time_us)
            )?,
        }
    }
    Ok(())
}

/// One column per bucket between the first and last non-empty bucket
pub fn write_histogram<W: fmt::Write>(out: &mut W, histogram: &HistogramSnapshot, exits: u64) -> fmt::Result {
    let Some((first, last)) = histogram.occupied_range() else {
        return Ok(());
    };
    let total = histogram.total();

    writeln!(out, "{}", separator(&format!(" command execution time histogram ({exits} executed commands) ")))?;
    out.write_char('|')?;
    for index in first..=last {
        let label = match bucket_upper_bound(index) {
            Some(bound) => format!("<{}", humantime::format_duration(bound)),
            None => "<inf".to_string(),
        };
        write!(out, "{label:>7} |")?;
    }
    out.write_str("\n|")?;
    for &count in &histogram.buckets[first..=last] {
        if count == 0 {
            out.write_str("        |")?;
        } else {
            write!(out, "{:>6}% |", histogram_percent(count, total))?;
        }
    }
    out.write_char('\n')
}

pub fn render_text<W: fmt::Write>(out: &mut W, data: &ReportData) -> fmt::Result {
    let sort = data.sort.as_str();
    write_header(out, data, "")?;
    if data.top > 0 {
        writeln!(out, "{}", separator(&format!(" top {} commands sorted by {sort} ", data.top)))?;
        write_text_rows(out, &data.commands, data.sort)?;
    }
    if let Some(histogram) = &data.histogram {
        write_histogram(out, histogram, data.counters.exit_count)?;
    }
    if data.top > 0 {
        writeln!(
            out,
            "{}",
            separator(&format!(" top {} commands sorted by sum of subprocesses {sort} ", data.top))
        )?;
        write_text_rows(out, &data.subtrees, data.sort)?;
    }
    writeln!(out, "{}", separator(""))
}

fn write_raw_rows<W: fmt::Write>(out: &mut W, timestamp: u64, kind: &str, rows: &[Row]) -> fmt::Result {
    for row in rows {
        writeln!(
            out,
            "{timestamp}:{kind}:{}:{:.2}:{}:{:.2}:{}:{:.6}",
            row.command, row.cpu_percent, row.time_us, row.count_percent, row.count, row.count_per_sec
        )?;
    }
    Ok(())
}

/// Raw rows; the `##` column legends are only written on the first report
pub fn render_raw<W: fmt::Write>(out: &mut W, data: &ReportData) -> fmt::Result {
    const COLUMNS: &str =
        "[time stamp s]:{kind}:[command]:[CPU percent]:[time usec]:[nb exec percent]:[nb exec]:[nb exec per s]";
    let sort = data.sort.as_str();
    let legend = data.display == 0;

    write_header(out, data, "# ")?;
    if data.top == 0 {
        return Ok(());
    }
    if legend {
        writeln!(out, "## top {} commands sorted by {sort}", data.top)?;
        writeln!(out, "## {}", COLUMNS.replace("{kind}", "cmd"))?;
    }
    write_raw_rows(out, data.timestamp, "cmd", &data.commands)?;
    if legend {
        writeln!(out, "## top {} commands sorted by sum of subprocesses {sort}", data.top)?;
        writeln!(out, "## {}", COLUMNS.replace("{kind}", "sub"))?;
    }
    write_raw_rows(out, data.timestamp, "sub", &data.subtrees)
}

pub fn render_json(data: &ReportData) -> serde_json::Result<String> {
    serde_json::to_string(data)
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Presentation settings for a [`Reporter`]
#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub format: OutputFormat,
    pub sort: SortKey,
    pub top: usize,
}

/// Writes reports for one engine to one output
///
/// Reports may be requested from several threads (timer, signals); the
/// output lock serialises them, including the pre-report rescan.
pub struct Reporter {
    engine: Arc<Engine>,
    options: ReportOptions,
    out: Mutex<Box<dyn Write + Send>>,
    cpus: usize,
    hostname: String,
}

impl Reporter {
    pub fn new(engine: Arc<Engine>, options: ReportOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            engine,
            options,
            out: Mutex::new(out),
            cpus: configured_cpus(),
            hostname: local_hostname(),
        }
    }

    /// Override the host details shown in the header
    pub fn with_host_info(mut self, hostname: impl Into<String>, cpus: usize) -> Self {
        self.hostname = hostname.into();
        self.cpus = cpus.max(1);
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Charge long-lived processes up to now, then write one report
    pub fn report(&self) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(error) = self.engine.rescan_long_lived() {
            warn!(error = %format!("{error:#}"), "rescan before report failed");
        }
        let data = ReportData::collect(
            &self.engine,
            self.options.sort,
            self.options.top,
            self.cpus,
            &self.hostname,
        );

        let mut rendered = String::new();
        match self.options.format {
            OutputFormat::Text => render_text(&mut rendered, &data)?,
            OutputFormat::Raw => render_raw(&mut rendered, &data)?,
            OutputFormat::Json => {
                rendered = render_json(&data).context("Failed to serialize report")?;
                rendered.push('\n');
            }
        }
        out.write_all(rendered.as_bytes())
            .and_then(|()| out.flush())
            .context("Failed to write report")?;

        self.engine.mark_displayed();
        debug!(display = data.display, format = ?self.options.format, "report written");
        Ok(())
    }

    /// Write a report, then start a new sample window
    pub fn report_and_reset(&self) -> Result<()> {
        self.report()?;
        self.engine
            .reset_window()
            .context("Failed to re-seed running processes after reset")
    }

    /// Closing line after the final report
    pub fn farewell(&self, reason: &str) -> Result<()> {
        let line = match self.options.format {
            OutputFormat::Text => format!("Received {reason}. Exiting.\n"),
            OutputFormat::Raw => format!("# Received {reason}. Exiting.\n"),
            OutputFormat::Json => return Ok(()),
        };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())
            .and_then(|()| out.flush())
            .context("Failed to write report")
    }
}
