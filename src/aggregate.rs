//! Averages per-run measurements across the iterations of a run configuration.
//!
//! The averaging functions are pure: they take the parsed per-run rows and return summary rows.
//! The `aggregate_*` functions around them locate the per-run files of one durability mode and
//! request count in a CSV directory, average them and overwrite the matching `_avg.csv` file, so
//! aggregating twice over the same inputs writes the same bytes twice.
//!
//! Every average must be derived from one file per configured iteration. Under
//! [`MissingRuns::Fail`] a missing file is an [`Error::AggregationInputMismatch`]; under
//! [`MissingRuns::Skip`] the files found are averaged and the gap is logged.

use crate::config::Measure;
use crate::error::{Error, Result};
use crate::record::{
    avg_file_name, read_csv, run_file_name, write_csv, CpuUsage, DurabilityMode, Family,
    MemoryUsage, PerformanceRecord, PerformanceSummary, ResourceUsage, SyscallCount,
    SyscallCountSummary, SyscallTime, SyscallTimeSummary,
};
use hashbrown::HashMap;
use log::{info, warn};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// What to do when fewer per-run files exist than configured iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingRuns {
    Fail,
    Skip,
}

impl MissingRuns {
    pub fn new(partial: bool) -> Self {
        if partial {
            MissingRuns::Skip
        } else {
            MissingRuns::Fail
        }
    }
}

/// The rows of one per-run file, with the path they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct RunFile<T> {
    pub path: PathBuf,
    pub rows: Vec<T>,
}

/// Arithmetic mean; zero for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; zero for fewer than two values.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

// {{{ averages

/// One summary row per operation, in the order operations first appear.
pub fn average_performance(runs: &[Vec<PerformanceRecord>]) -> Vec<PerformanceSummary> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<&PerformanceRecord>> = Vec::new();
    for record in runs.iter().flatten() {
        let i = *index.entry(record.operation.as_str()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[i].push(record);
    }
    groups
        .into_iter()
        .map(|group| {
            let field = |f: fn(&PerformanceRecord) -> f64| -> Vec<f64> {
                group.iter().map(|r| f(r)).collect()
            };
            let rps = field(|r| r.rps);
            PerformanceSummary {
                operation: group[0].operation.clone(),
                rps: mean(&rps),
                rps_std: std_dev(&rps),
                avg_latency_ms: mean(&field(|r| r.avg_latency_ms)),
                min_latency_ms: mean(&field(|r| r.min_latency_ms)),
                p50_latency_ms: mean(&field(|r| r.p50_latency_ms)),
                p95_latency_ms: mean(&field(|r| r.p95_latency_ms)),
                p99_latency_ms: mean(&field(|r| r.p99_latency_ms)),
                max_latency_ms: mean(&field(|r| r.max_latency_ms)),
            }
        })
        .collect()
}

/// Collect one value of `syscall` from every run; a run without it is an error.
fn per_run<T>(
    runs: &[RunFile<T>],
    syscall: &str,
    name: impl Fn(&T) -> &str,
    value: impl Fn(&T) -> f64,
) -> Result<Vec<f64>> {
    runs.iter()
        .map(|run| {
            run.rows
                .iter()
                .find(|r| name(*r) == syscall)
                .map(&value)
                .ok_or_else(|| Error::MissingSyscall {
                    syscall: syscall.to_string(),
                    path: run.path.clone(),
                })
        })
        .collect()
}

/// Mean count of each syscall of interest, rounded up.
pub fn average_syscalls(
    runs: &[RunFile<SyscallCount>],
    syscalls: &[String],
) -> Result<Vec<SyscallCountSummary>> {
    let mut out = Vec::with_capacity(syscalls.len());
    for syscall in syscalls {
        let counts = per_run(runs, syscall, |r| r.syscall.as_str(), |r| r.count as f64)?;
        out.push(SyscallCountSummary {
            syscall: syscall.clone(),
            avg_count: mean(&counts).ceil() as u64,
        });
    }
    Ok(out)
}

/// Mean cumulative time of each syscall of interest, followed by a `total` row holding the sum of
/// those means.
pub fn average_syscall_times(
    runs: &[RunFile<SyscallTime>],
    syscalls: &[String],
) -> Result<Vec<SyscallTimeSummary>> {
    let mut out = Vec::with_capacity(syscalls.len() + 1);
    for syscall in syscalls {
        let times = per_run(runs, syscall, |r| r.syscall.as_str(), |r| r.time)?;
        out.push(SyscallTimeSummary {
            syscall: syscall.clone(),
            avg_time: mean(&times),
        });
    }
    let total = out.iter().map(|r| r.avg_time).sum();
    out.push(SyscallTimeSummary {
        syscall: "total".to_string(),
        avg_time: total,
    });
    Ok(out)
}

pub fn average_resource_usage(cpu: &[f64], memory: &[f64]) -> ResourceUsage {
    ResourceUsage {
        avg_cpu_usage: mean(cpu),
        avg_mem_usage: mean(memory),
    }
}

// }}} averages

// {{{ files

/// Read the per-run files of iterations `1..=iterations`.
fn collect_runs<T: DeserializeOwned>(
    dir: &Path,
    mode: DurabilityMode,
    requests: u64,
    family: Family,
    iterations: usize,
    policy: MissingRuns,
) -> Result<Vec<RunFile<T>>> {
    let mut runs = Vec::with_capacity(iterations);
    for i in 1..=iterations {
        let path = dir.join(run_file_name(mode, requests, family, i));
        if !path.exists() {
            continue;
        }
        let rows = read_csv(&path)?;
        runs.push(RunFile { path, rows });
    }
    let mismatch = Error::AggregationInputMismatch {
        family: format!("{} {} {}", mode, requests, family.name()),
        expected: iterations,
        found: runs.len(),
    };
    if runs.is_empty() || (runs.len() < iterations && policy == MissingRuns::Fail) {
        return Err(mismatch);
    }
    if runs.len() < iterations {
        warn!("Averaging over fewer runs than configured: {}", mismatch);
    }
    Ok(runs)
}

/// Where and what to aggregate.
#[derive(Clone, Copy, Debug)]
pub struct AggregateTarget<'a> {
    pub dir: &'a Path,
    pub mode: DurabilityMode,
    pub requests: u64,
    pub iterations: usize,
    pub policy: MissingRuns,
}

impl AggregateTarget<'_> {
    fn runs<T: DeserializeOwned>(&self, family: Family) -> Result<Vec<RunFile<T>>> {
        collect_runs(
            self.dir,
            self.mode,
            self.requests,
            family,
            self.iterations,
            self.policy,
        )
    }

    fn avg_path(&self, family: Family) -> PathBuf {
        self.dir.join(avg_file_name(self.mode, self.requests, family))
    }
}

pub fn aggregate_performance(t: &AggregateTarget) -> Result<PathBuf> {
    let runs: Vec<RunFile<PerformanceRecord>> = t.runs(Family::Performance)?;
    let rows: Vec<Vec<PerformanceRecord>> = runs.into_iter().map(|r| r.rows).collect();
    let path = t.avg_path(Family::Performance);
    write_csv(&path, &average_performance(&rows))?;
    Ok(path)
}

pub fn aggregate_syscalls(t: &AggregateTarget, syscalls: &[String]) -> Result<PathBuf> {
    let runs: Vec<RunFile<SyscallCount>> = t.runs(Family::Syscalls)?;
    let path = t.avg_path(Family::Syscalls);
    write_csv(&path, &average_syscalls(&runs, syscalls)?)?;
    Ok(path)
}

pub fn aggregate_syscall_times(t: &AggregateTarget, syscalls: &[String]) -> Result<PathBuf> {
    let runs: Vec<RunFile<SyscallTime>> = t.runs(Family::SyscallTimes)?;
    let path = t.avg_path(Family::SyscallTimes);
    write_csv(&path, &average_syscall_times(&runs, syscalls)?)?;
    Ok(path)
}

pub fn aggregate_resource_usage(t: &AggregateTarget) -> Result<PathBuf> {
    let cpu: Vec<RunFile<CpuUsage>> = t.runs(Family::CpuUsage)?;
    let memory: Vec<RunFile<MemoryUsage>> = t.runs(Family::MemoryUsage)?;
    let cpu: Vec<f64> = cpu.iter().flat_map(|r| r.rows.iter().map(|u| u.avg_cpu_usage)).collect();
    let memory: Vec<f64> = memory
        .iter()
        .flat_map(|r| r.rows.iter().map(|u| u.avg_mem_usage))
        .collect();
    let path = t.avg_path(Family::Usage);
    write_csv(&path, &[average_resource_usage(&cpu, &memory)])?;
    Ok(path)
}

/// Aggregate every family the measurements produce. Returns the written files.
pub fn aggregate_measures(
    t: &AggregateTarget,
    measure: &[Measure],
    syscalls: &[String],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for m in measure {
        match m {
            Measure::Rps => written.push(aggregate_performance(t)?),
            Measure::Load => written.push(aggregate_resource_usage(t)?),
            Measure::Syscalls => {
                written.push(aggregate_syscalls(t, syscalls)?);
                written.push(aggregate_syscall_times(t, syscalls)?);
            }
        }
    }
    for path in written.iter() {
        info!("Averaged into {}", path.display());
    }
    Ok(written)
}

// }}} files

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fsync;
    use tempfile::TempDir;

    const MODE: DurabilityMode = DurabilityMode::AppendOnly(Fsync::Always);

    fn counts(pairs: &[(&str, u64)]) -> Vec<SyscallCount> {
        pairs
            .iter()
            .map(|(s, c)| SyscallCount {
                syscall: s.to_string(),
                count: *c,
            })
            .collect()
    }

    fn run<T>(i: usize, rows: Vec<T>) -> RunFile<T> {
        RunFile {
            path: PathBuf::from(format!("run{}.csv", i)),
            rows,
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn syscall_counts_are_rounded_up() {
        let runs = vec![
            run(1, counts(&[("write", 9), ("fdatasync", 10)])),
            run(2, counts(&[("write", 10), ("fdatasync", 12)])),
            run(3, counts(&[("fdatasync", 11), ("write", 10)])),
        ];
        let avg = average_syscalls(&runs[..2], &names(&["write"])).unwrap();
        assert_eq!(avg[0].avg_count, 10);
        let avg = average_syscalls(&runs, &names(&["fdatasync", "write"])).unwrap();
        assert_eq!(avg[0].syscall, "fdatasync");
        assert_eq!(avg[0].avg_count, 11);
        // 29 / 3 = 9.67
        assert_eq!(avg[1].avg_count, 10);
    }

    #[test]
    fn missing_syscall_is_an_error() {
        let runs = vec![
            run(1, counts(&[("write", 9), ("fdatasync", 10)])),
            run(2, counts(&[("write", 10)])),
        ];
        match average_syscalls(&runs, &names(&["write", "fdatasync"])) {
            Err(Error::MissingSyscall { syscall, path }) => {
                assert_eq!(syscall, "fdatasync");
                assert_eq!(path, PathBuf::from("run2.csv"));
            }
            r => panic!("expected a missing syscall, got {:?}", r),
        }
    }

    #[test]
    fn time_total_is_sum_of_means() {
        let times = |w: f64, f: f64, u: f64| {
            vec![
                SyscallTime {
                    syscall: "write".to_string(),
                    time: w,
                },
                SyscallTime {
                    syscall: "fdatasync".to_string(),
                    time: f,
                },
                SyscallTime {
                    syscall: "io_uring_enter".to_string(),
                    time: u,
                },
            ]
        };
        let runs = vec![
            run(1, times(0.1, 0.25, 0.0)),
            run(2, times(0.3, 0.5, 0.01)),
            run(3, times(0.2, 0.75, 0.02)),
        ];
        let syscalls = names(&["write", "fdatasync", "io_uring_enter"]);
        let avg = average_syscall_times(&runs, &syscalls).unwrap();
        assert_eq!(avg.len(), 4);
        assert_eq!(avg[3].syscall, "total");
        let sum: f64 = avg[..3].iter().map(|r| r.avg_time).sum();
        assert!((avg[3].avg_time - sum).abs() < 1e-12);
        assert!((avg[1].avg_time - 0.5).abs() < 1e-12);
    }

    fn perf(op: &str, rps: f64, p99: f64) -> PerformanceRecord {
        PerformanceRecord {
            operation: op.to_string(),
            rps,
            avg_latency_ms: 0.3,
            min_latency_ms: 0.1,
            p50_latency_ms: 0.25,
            p95_latency_ms: 0.4,
            p99_latency_ms: p99,
            max_latency_ms: 1.0,
        }
    }

    #[test]
    fn performance_grouped_by_operation() {
        let runs = vec![
            vec![perf("SET", 100.0, 1.0), perf("LPUSH", 50.0, 2.0)],
            vec![perf("LPUSH", 70.0, 4.0), perf("SET", 200.0, 3.0)],
        ];
        let avg = average_performance(&runs);
        assert_eq!(avg.len(), 2);
        assert_eq!(avg[0].operation, "SET");
        assert!((avg[0].rps - 150.0).abs() < 1e-9);
        assert!((avg[0].p99_latency_ms - 2.0).abs() < 1e-9);
        assert!((avg[1].rps - 60.0).abs() < 1e-9);
        // sample deviation of {50, 70}
        assert!((avg[1].rps_std - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(average_performance(&runs[..1])[0].rps_std, 0.0);
    }

    #[test]
    fn resource_usage_mean() {
        let u = average_resource_usage(&[10.0, 20.0, 30.0], &[5.0, 7.0]);
        assert_eq!(u.avg_cpu_usage, 20.0);
        assert_eq!(u.avg_mem_usage, 6.0);
        assert_eq!(average_resource_usage(&[], &[]).avg_cpu_usage, 0.0);
    }

    fn write_counts(dir: &TempDir, iteration: usize, fdatasync: u64) {
        let path = dir
            .path()
            .join(run_file_name(MODE, 1000, Family::Syscalls, iteration));
        write_csv(&path, &counts(&[("write", 100), ("fdatasync", fdatasync)])).unwrap();
    }

    fn target(dir: &TempDir, policy: MissingRuns) -> AggregateTarget<'_> {
        AggregateTarget {
            dir: dir.path(),
            mode: MODE,
            requests: 1000,
            iterations: 3,
            policy,
        }
    }

    #[test]
    fn missing_run_fails_strict_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        write_counts(&dir, 1, 10);
        write_counts(&dir, 3, 13);
        match aggregate_syscalls(&target(&dir, MissingRuns::Fail), &names(&["fdatasync"])) {
            Err(Error::AggregationInputMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            r => panic!("expected an input mismatch, got {:?}", r),
        }
        assert!(!dir
            .path()
            .join(avg_file_name(MODE, 1000, Family::Syscalls))
            .exists());
    }

    #[test]
    fn missing_run_is_skipped_when_partial() {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        write_counts(&dir, 1, 10);
        write_counts(&dir, 3, 13);
        let path =
            aggregate_syscalls(&target(&dir, MissingRuns::Skip), &names(&["fdatasync"])).unwrap();
        let avg: Vec<SyscallCountSummary> = read_csv(&path).unwrap();
        // divided by the two files found
        assert_eq!(avg[0].avg_count, 12);
    }

    #[test]
    fn no_runs_fail_even_when_partial() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            aggregate_performance(&target(&dir, MissingRuns::Skip)),
            Err(Error::AggregationInputMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        for (i, (a, b)) in [(90000.1, 0.31), (95000.7, 0.29), (93000.3, 0.33)]
            .iter()
            .enumerate()
        {
            let path = dir
                .path()
                .join(run_file_name(MODE, 1000, Family::Performance, i + 1));
            write_csv(&path, &[perf("SET", *a, *b), perf("LPUSH", a / 2.0, b * 2.0)]).unwrap();
            let path = dir
                .path()
                .join(run_file_name(MODE, 1000, Family::CpuUsage, i + 1));
            write_csv(&path, &[CpuUsage { avg_cpu_usage: *b * 100.0 }]).unwrap();
            let path = dir
                .path()
                .join(run_file_name(MODE, 1000, Family::MemoryUsage, i + 1));
            write_csv(&path, &[MemoryUsage { avg_mem_usage: *a / 1000.0 }]).unwrap();
        }
        let t = target(&dir, MissingRuns::Fail);
        let written = aggregate_measures(&t, &[Measure::Rps, Measure::Load], &[]).unwrap();
        assert_eq!(written.len(), 2);
        let first: Vec<Vec<u8>> = written.iter().map(|p| std::fs::read(p).unwrap()).collect();
        aggregate_measures(&t, &[Measure::Rps, Measure::Load], &[]).unwrap();
        let second: Vec<Vec<u8>> = written.iter().map(|p| std::fs::read(p).unwrap()).collect();
        assert_eq!(first, second);
        let usage: Vec<ResourceUsage> = read_csv(&written[1]).unwrap();
        assert!((usage[0].avg_cpu_usage - 31.0).abs() < 1e-9);
    }
}

// }}} tests
