//! Syscall tracing of the server while load is driven.
//!
//! Two backends attach to the server process:
//!
//! - `script`: an external script invoked as `<script> <pid> <counts> <times> <log>` that writes
//!   the `syscall,count` and `syscall,time` CSV files itself once interrupted.
//! - `strace`: `strace -c -f -p <pid> -o <log>`. Its summary table is parsed here and the two CSV
//!   files are written for the configured syscalls.
//!
//! Either way, the tracer is an OS process stopped with SIGINT, optionally run through `sudo`.
//! [`traced_drive`] wraps one load generator run in a trace window and records when each step
//! happened, so that the window is known to enclose the load.

use crate::config::{LoadSpec, TraceSpec, TracerKind};
use crate::driver::{drive, DriveMode};
use crate::error::{Error, Result};
use crate::record::{remove_run_file, write_csv, SyscallCount, SyscallTime};
use crate::server::signal;
use hashbrown::HashMap;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use quanta::Instant;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Where one trace writes its outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceOutputs {
    pub counts: PathBuf,
    pub times: PathBuf,
    pub log: PathBuf,
}

pub struct TracerHandle {
    child: Child,
    kind: TracerKind,
    syscalls: Vec<String>,
    outputs: TraceOutputs,
}

fn tracer_command(spec: &TraceSpec, pid: u32, outputs: &TraceOutputs) -> Command {
    let mut args: Vec<String> = match spec.kind {
        TracerKind::Script(ref script) => vec![
            script.display().to_string(),
            pid.to_string(),
            outputs.counts.display().to_string(),
            outputs.times.display().to_string(),
            outputs.log.display().to_string(),
        ],
        TracerKind::Strace => vec![
            "strace".to_string(),
            "-c".to_string(),
            "-f".to_string(),
            "-p".to_string(),
            pid.to_string(),
            "-o".to_string(),
            outputs.log.display().to_string(),
        ],
    };
    if spec.sudo {
        args.insert(0, "sudo".to_string());
    }
    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Remove the CSV files of `outputs`. Missing files are fine, and the raw log is kept for
/// inspection.
pub fn discard_outputs(outputs: &TraceOutputs) -> Result<()> {
    remove_run_file(&outputs.counts)?;
    remove_run_file(&outputs.times)
}

/// Spawn the tracer attached to `pid`. Returns as soon as the tracer process exists.
///
/// Outputs left over from an earlier trace are removed first, so they cannot pass for the outputs
/// of this one.
pub fn start_trace(spec: &TraceSpec, pid: u32, outputs: TraceOutputs) -> Result<TracerHandle> {
    discard_outputs(&outputs)?;
    let mut cmd = tracer_command(spec, pid, &outputs);
    debug!("Starting tracer: {:?}", cmd);
    let child = cmd.spawn()?;
    Ok(TracerHandle {
        child,
        kind: spec.kind.clone(),
        syscalls: spec.syscalls.clone(),
        outputs,
    })
}

/// Interrupt the tracer, wait for it to exit and check that both CSV files exist.
///
/// With the built-in backend, a log without a summary table means strace never attached or died
/// before detaching, and is reported as missing output instead of being read as zero syscalls.
pub fn stop_trace(mut handle: TracerHandle) -> Result<TraceOutputs> {
    signal(handle.child.id(), Signal::SIGINT)?;
    let status = handle.child.wait()?;
    debug!("Tracer exited with {}", status);
    if handle.kind == TracerKind::Strace {
        let missing = || Error::MissingTraceOutput {
            path: handle.outputs.log.clone(),
        };
        let text = std::fs::read_to_string(&handle.outputs.log).map_err(|_| missing())?;
        let Some(summary) = parse_strace_summary(&text) else {
            warn!("strace exited with {} and left no summary", status);
            return Err(missing());
        };
        if !status.success() {
            warn!("strace exited with {} after writing its summary", status);
        }
        write_summary(&summary, &handle.syscalls, &handle.outputs)?;
    }
    for path in [&handle.outputs.counts, &handle.outputs.times] {
        if !path.exists() {
            return Err(Error::MissingTraceOutput { path: path.clone() });
        }
    }
    Ok(handle.outputs)
}

// {{{ strace

/// One row of the `strace -c` summary table.
#[derive(Clone, Debug, PartialEq)]
pub struct StraceRow {
    pub seconds: f64,
    pub calls: u64,
}

/// Parse the table `strace -c` prints on detach, keyed by syscall name.
///
/// ```text
/// % time     seconds  usecs/call     calls    errors syscall
/// ------ ----------- ----------- --------- --------- ----------------
///  72.41    0.004213          10       402           write
///  27.59    0.001605          40        40           fdatasync
/// ------ ----------- ----------- --------- --------- ----------------
/// 100.00    0.005818          13       442           total
/// ```
///
/// The `errors` column is blank for syscalls that never failed. Lines that are not rows of the
/// table are skipped. The `total` row closes the table; without it there is no summary and `None`
/// is returned.
pub fn parse_strace_summary(text: &str) -> Option<HashMap<String, StraceRow>> {
    let mut rows = HashMap::new();
    let mut total = false;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let Some(name) = fields.last() else {
            continue;
        };
        let (Ok(seconds), Ok(calls)) = (fields[1].parse::<f64>(), fields[3].parse::<u64>()) else {
            continue;
        };
        if fields[0].parse::<f64>().is_err() {
            continue;
        }
        if *name == "total" {
            total = true;
            continue;
        }
        rows.insert(name.to_string(), StraceRow { seconds, calls });
    }
    total.then_some(rows)
}

fn write_summary(
    summary: &HashMap<String, StraceRow>,
    syscalls: &[String],
    outputs: &TraceOutputs,
) -> Result<()> {
    let zero = StraceRow {
        seconds: 0.0,
        calls: 0,
    };
    let mut counts = Vec::with_capacity(syscalls.len());
    let mut times = Vec::with_capacity(syscalls.len());
    for name in syscalls {
        let row = summary.get(name).unwrap_or(&zero);
        counts.push(SyscallCount {
            syscall: name.clone(),
            count: row.calls,
        });
        times.push(SyscallTime {
            syscall: name.clone(),
            time: row.seconds,
        });
    }
    write_csv(&outputs.counts, &counts)?;
    write_csv(&outputs.times, &times)?;
    Ok(())
}

// }}} strace

// {{{ timeline

/// When each step of a traced run happened.
#[derive(Clone, Copy, Debug)]
pub struct RunTimeline {
    pub tracer_started: Instant,
    pub driver_started: Instant,
    pub driver_finished: Instant,
    pub tracer_stopped: Instant,
}

impl RunTimeline {
    /// Whether the trace window encloses the load window.
    pub fn encloses(&self) -> bool {
        self.tracer_started < self.driver_started
            && self.driver_started <= self.driver_finished
            && self.driver_finished < self.tracer_stopped
    }
}

/// Drive load against `port` with the tracer attached to `pid` around it.
///
/// The load generator starts `settle` after the tracer and the tracer is stopped `settle` after
/// the load generator returns. A failing load generator still stops the tracer, and a run that
/// fails either way leaves no trace outputs behind.
pub fn traced_drive(
    trace: &TraceSpec,
    load: &LoadSpec,
    requests: u64,
    port: u16,
    pid: u32,
    outputs: TraceOutputs,
) -> Result<RunTimeline> {
    let handle = start_trace(trace, pid, outputs.clone())?;
    let tracer_started = Instant::now();
    std::thread::sleep(trace.settle);
    let driver_started = Instant::now();
    let driven = drive(load, requests, port, DriveMode::Discard);
    let driver_finished = Instant::now();
    std::thread::sleep(trace.settle);
    let stopped = stop_trace(handle);
    let tracer_stopped = Instant::now();
    if driven.is_err() || stopped.is_err() {
        discard_outputs(&outputs)?;
    }
    driven?;
    let outputs = stopped?;
    info!(
        "Traced {} requests in {:.2}s, counts in {}",
        requests,
        (driver_finished - driver_started).as_secs_f64(),
        outputs.counts.display()
    );
    Ok(RunTimeline {
        tracer_started,
        driver_started,
        driver_finished,
        tracer_stopped,
    })
}

/// Outputs of a trace named after `stem`: CSVs in `csv_dir`, raw tracer log in `log_dir`.
pub fn outputs_for(
    csv_dir: &Path,
    log_dir: &Path,
    counts: &str,
    times: &str,
    stem: &str,
) -> TraceOutputs {
    TraceOutputs {
        counts: csv_dir.join(counts),
        times: csv_dir.join(times),
        log: log_dir.join(format!("{}_strace.txt", stem)),
    }
}

// }}} timeline

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::record::read_csv;
    use std::time::Duration;

    const SUMMARY: &str = "\
% time     seconds  usecs/call     calls    errors syscall
------ ----------- ----------- --------- --------- ----------------
 72.41    0.004213          10       402           write
 20.00    0.001200          30        40           fdatasync
  7.59    0.000405           5        81        12 epoll_wait
------ ----------- ----------- --------- --------- ----------------
100.00    0.005818          13       523        12 total
";

    #[test]
    fn strace_summary() {
        let rows = parse_strace_summary(SUMMARY).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows["write"].calls, 402);
        assert!((rows["fdatasync"].seconds - 0.0012).abs() < 1e-12);
        assert_eq!(rows["epoll_wait"].calls, 81);
        assert!(!rows.contains_key("total"));
    }

    #[test]
    fn strace_log_without_table() {
        assert!(parse_strace_summary("").is_none());
        let log = "strace: attach: ptrace(PTRACE_SEIZE, 42): Operation not permitted\n";
        assert!(parse_strace_summary(log).is_none());
        // header only, strace killed before detaching
        assert!(parse_strace_summary(&SUMMARY[..SUMMARY.find(" 72.41").unwrap()]).is_none());
    }

    #[test]
    fn strace_that_cannot_attach_is_missing_output() {
        let dir = fixtures::scratch();
        let outputs = outputs_for(dir.path(), dir.path(), "c.csv", "t.csv", "run1");
        let strace = fixtures::script(
            dir.path(),
            "strace",
            ": > \"$1\"\n\
echo 'strace: attach: ptrace(PTRACE_SEIZE): Operation not permitted' >&2\nexit 1",
        );
        let child = Command::new(strace)
            .arg(&outputs.log)
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let handle = TracerHandle {
            child,
            kind: TracerKind::Strace,
            syscalls: vec!["write".to_string()],
            outputs: outputs.clone(),
        };
        std::thread::sleep(Duration::from_millis(100));
        match stop_trace(handle) {
            Err(Error::MissingTraceOutput { path }) => assert_eq!(path, outputs.log),
            r => panic!("expected missing trace output, got {:?}", r.map(|_| ())),
        }
        assert!(!outputs.counts.exists());
        assert!(!outputs.times.exists());
    }

    #[test]
    fn failed_load_leaves_no_trace_outputs() {
        let dir = fixtures::scratch();
        let trace = fixtures::tracer_script(dir.path());
        let mut load = fixtures::load_generator(dir.path());
        load.executable = fixtures::script(dir.path(), "fail.sh", "exit 1");
        let outputs = outputs_for(dir.path(), dir.path(), "c.csv", "t.csv", "run1");
        let r = traced_drive(&trace, &load, 10, 6380, std::process::id(), outputs.clone());
        assert!(matches!(r, Err(Error::DriverFailure { .. })));
        assert!(!outputs.counts.exists());
        assert!(!outputs.times.exists());
        // the raw log stays for inspection
        assert!(outputs.log.exists());
    }

    #[test]
    fn strace_summary_absent_syscalls_are_zero() {
        let dir = fixtures::scratch();
        let outputs = outputs_for(dir.path(), dir.path(), "c.csv", "t.csv", "run");
        let syscalls = vec!["write".to_string(), "io_uring_enter".to_string()];
        let summary = parse_strace_summary(SUMMARY).unwrap();
        write_summary(&summary, &syscalls, &outputs).unwrap();
        let counts: Vec<SyscallCount> = read_csv(&outputs.counts).unwrap();
        assert_eq!(
            counts,
            vec![
                SyscallCount {
                    syscall: "write".to_string(),
                    count: 402
                },
                SyscallCount {
                    syscall: "io_uring_enter".to_string(),
                    count: 0
                },
            ]
        );
        let times: Vec<SyscallTime> = read_csv(&outputs.times).unwrap();
        assert_eq!(times[1].time, 0.0);
    }

    #[test]
    fn script_tracer_encloses_load() {
        let _ = env_logger::try_init();
        let dir = fixtures::scratch();
        let trace = fixtures::tracer_script(dir.path());
        let load = fixtures::load_generator(dir.path());
        let outputs = outputs_for(dir.path(), dir.path(), "c.csv", "t.csv", "run1");
        let timeline = traced_drive(
            &trace,
            &load,
            1000,
            6380,
            std::process::id(),
            outputs.clone(),
        )
        .unwrap();
        assert!(timeline.encloses());
        assert!(timeline.driver_started - timeline.tracer_started >= trace.settle);
        assert!(timeline.tracer_stopped - timeline.driver_finished >= trace.settle);
        let counts: Vec<SyscallCount> = read_csv(&outputs.counts).unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[1].count, 40);
        assert_eq!(std::fs::read_to_string(&outputs.log).unwrap().trim(), "done");
    }

    #[test]
    fn silent_tracer_is_missing_output() {
        let dir = fixtures::scratch();
        let mut trace = fixtures::tracer_script(dir.path());
        trace.kind = TracerKind::Script(fixtures::script(
            dir.path(),
            "silent.sh",
            "trap 'exit 0' INT\nwhile true; do sleep 0.05; done",
        ));
        let outputs = outputs_for(dir.path(), dir.path(), "c.csv", "t.csv", "run1");
        // left over from an earlier run
        std::fs::write(&outputs.counts, "syscall,count\nwrite,1\n").unwrap();
        let handle = start_trace(&trace, std::process::id(), outputs).unwrap();
        std::thread::sleep(trace.settle);
        match stop_trace(handle) {
            Err(Error::MissingTraceOutput { path }) => assert!(path.ends_with("c.csv")),
            r => panic!("expected missing trace output, got {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn tracer_command_line() {
        let dir = fixtures::scratch();
        let mut trace = fixtures::tracer_script(dir.path());
        trace.kind = TracerKind::Strace;
        trace.sudo = true;
        let outputs = outputs_for(Path::new("csvs"), Path::new("logs"), "c.csv", "t.csv", "x");
        let cmd = tracer_command(&trace, 42, &outputs);
        assert_eq!(cmd.get_program(), "sudo");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(
            args,
            vec!["strace", "-c", "-f", "-p", "42", "-o", "logs/x_strace.txt"]
        );
    }
}

// }}} tests
