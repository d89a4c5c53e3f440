//! Measurement records and their CSV representation.
//!
//! Every metric family has its own record type, so a schema mismatch in a per-run file surfaces as
//! a [`csv::Error`] when the file is read instead of a missing column deep inside aggregation.
//!
//! ## File Naming
//!
//! Per-run files are named `{mode}_{requests}_{family}_run{iteration}.csv` and the averaged files
//! `{mode}_{requests}_{family}_avg.csv`, where `mode` is the label of a [`DurabilityMode`] and
//! `family` the name of a [`Family`]. For example, the syscall counts of the second iteration of an
//! `appendfsync always` run with 100000 requests land in `always_100000_syscalls_run2.csv`.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// The fsync policy of the append-only log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Fsync {
    Always,
    EverySec,
    No,
}

impl Fsync {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fsync::Always => "always",
            Fsync::EverySec => "everysec",
            Fsync::No => "no",
        }
    }
}

/// How the server under test persists writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DurabilityMode {
    /// Point-in-time snapshots only (RDB).
    Snapshot,
    /// Append-only log flushed according to the fsync policy.
    AppendOnly(Fsync),
}

impl DurabilityMode {
    /// The label used in file names and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            DurabilityMode::Snapshot => "rdb",
            DurabilityMode::AppendOnly(f) => f.as_str(),
        }
    }

    /// Server configuration parameters that select this mode, in the order they must be applied.
    pub fn settings(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            DurabilityMode::Snapshot => vec![("appendonly", "no")],
            DurabilityMode::AppendOnly(f) => vec![
                ("save", ""),
                ("appendonly", "yes"),
                ("appendfsync", f.as_str()),
            ],
        }
    }

    /// The settings as `--key value` flags, for servers that only take them at launch.
    pub fn launch_args(&self) -> Vec<String> {
        self.settings()
            .into_iter()
            .flat_map(|(k, v)| [format!("--{}", k), v.to_string()])
            .collect()
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A metric family; each family has its own per-run and averaged files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    Performance,
    CpuUsage,
    MemoryUsage,
    Syscalls,
    SyscallTimes,
    Usage,
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Performance => "performance",
            Family::CpuUsage => "cpu_usage",
            Family::MemoryUsage => "memory_usage",
            Family::Syscalls => "syscalls",
            Family::SyscallTimes => "syscalls-times",
            Family::Usage => "usage",
        }
    }
}

pub fn run_file_name(
    mode: DurabilityMode,
    requests: u64,
    family: Family,
    iteration: usize,
) -> String {
    format!(
        "{}_{}_{}_run{}.csv",
        mode.label(),
        requests,
        family.name(),
        iteration
    )
}

pub fn avg_file_name(mode: DurabilityMode, requests: u64, family: Family) -> String {
    format!("{}_{}_{}_avg.csv", mode.label(), requests, family.name())
}

/// Identifies exactly one measurement run. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunConfiguration {
    pub variant: String,
    pub mode: DurabilityMode,
    pub requests: u64,
    pub iteration: usize,
    pub port: u16,
}

impl RunConfiguration {
    pub fn file_name(&self, family: Family) -> String {
        run_file_name(self.mode, self.requests, family, self.iteration)
    }
}

impl fmt::Display for RunConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mode {} requests {} run {}",
            self.variant, self.mode, self.requests, self.iteration
        )
    }
}

/// One poll of the monitored process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// One row of the load generator's CSV output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PerformanceRecord {
    #[serde(rename = "test")]
    pub operation: String,
    pub rps: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub max_latency_ms: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyscallCount {
    pub syscall: String,
    pub count: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyscallTime {
    pub syscall: String,
    pub time: f64,
}

/// Per-run average CPU usage, in percent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct CpuUsage {
    pub avg_cpu_usage: f64,
}

/// Per-run average resident memory, in MB.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct MemoryUsage {
    pub avg_mem_usage: f64,
}

/// Averaged performance of one operation across all runs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PerformanceSummary {
    #[serde(rename = "test")]
    pub operation: String,
    pub rps: f64,
    pub rps_std: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub max_latency_ms: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyscallCountSummary {
    pub syscall: String,
    pub avg_count: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyscallTimeSummary {
    pub syscall: String,
    pub avg_time: f64,
}

/// Averaged resource usage across all runs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ResourceUsage {
    pub avg_cpu_usage: f64,
    pub avg_mem_usage: f64,
}

/// Wall-clock duration of one measurement step, appended to `timing_log.csv`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimingEntry {
    #[serde(rename = "Benchmark")]
    pub step: String,
    #[serde(rename = "Time (seconds)")]
    pub seconds: f64,
}

pub fn parse_csv<T: DeserializeOwned>(reader: impl Read) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)?;
    parse_csv(file)
}

/// Write `rows` to `path`, replacing whatever was there.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Remove the per-run file at `path` if there is one.
pub fn remove_run_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Append one row to `path`, writing the header first if the file is new or empty.
pub fn append_csv<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(fresh)
        .from_writer(file);
    wtr.serialize(row)?;
    wtr.flush()?;
    Ok(())
}
