//! The experiment driver.
//!
//! An [`Experiment`] walks every selected variant of a [`HarnessConfig`] strictly one run at a
//! time. Per variant it frees the port, starts the server, and then for every iteration, every
//! durability mode and every request count performs the configured measurements, each writing its
//! own per-run files. Once all iterations are done the per-run files are averaged and the server is
//! stopped before the next variant starts.
//!
//! A variant that can be reconfigured live keeps a single server for all of its modes and switches
//! modes over the administrative connection. Otherwise every mode gets a fresh server launched with
//! the mode's settings as command line flags.
//!
//! Any failure aborts the experiment. The error names the step that failed, and the server of the
//! failing variant is stopped on the way out, since it is owned by a [`ServerHandle`] that stops it
//! on drop.

use crate::aggregate::{aggregate_measures, mean, AggregateTarget, MissingRuns};
use crate::client::AdminClient;
use crate::config::{HarnessConfig, Measure, Variant};
use crate::driver::{drive, DriveMode};
use crate::error::Result;
use crate::monitor::{start_monitoring, stop_monitoring, SysinfoProbe};
use crate::record::{
    append_csv, remove_run_file, write_csv, CpuUsage, DurabilityMode, Family, MemoryUsage,
    RunConfiguration, TimingEntry,
};
use crate::server::{free_port, LiveServers, ServerHandle};
use crate::tracer::{outputs_for, traced_drive};
use log::{debug, info, warn};
use quanta::Instant;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub const TIMING_LOG: &str = "timing_log.csv";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ServersStarting,
    Running { iteration: usize, requests: u64 },
    Aggregating,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::ServersStarting => write!(f, "starting servers"),
            Phase::Running {
                iteration,
                requests,
            } => write!(f, "running iteration {} with {} requests", iteration, requests),
            Phase::Aggregating => write!(f, "aggregating"),
            Phase::Done => write!(f, "done"),
            Phase::Aborted => write!(f, "aborted"),
        }
    }
}

/// Modes measured on one server process, with the flags that server is launched with.
struct ModeGroup {
    modes: Vec<DurabilityMode>,
    launch_args: Vec<String>,
    log_name: String,
}

fn mode_groups(variant: &Variant) -> Vec<ModeGroup> {
    if variant.live_reconfigure {
        return vec![ModeGroup {
            modes: variant.modes.clone(),
            launch_args: vec![],
            log_name: "server.log".to_string(),
        }];
    }
    variant
        .modes
        .iter()
        .map(|mode| ModeGroup {
            modes: vec![*mode],
            launch_args: mode.launch_args(),
            log_name: format!("server_{}.log", mode.label()),
        })
        .collect()
}

/// Switch a live server to `mode`, then wait until it is done persisting and has settled.
fn switch_mode(admin: &mut AdminClient, variant: &Variant, mode: DurabilityMode) -> Result<()> {
    admin.apply_mode(mode)?;
    admin.wait_idle(variant.server.startup_timeout)?;
    std::thread::sleep(variant.reconfigure_settle);
    Ok(())
}

/// Average every per-run file of `variant` already on disk. Returns the written files.
pub fn aggregate_variant(config: &HarnessConfig, variant: &Variant) -> Result<Vec<PathBuf>> {
    let dir = config.csv_dir(variant);
    let mut written = Vec::new();
    for mode in variant.modes.iter() {
        for requests in config.requests.iter() {
            let target = AggregateTarget {
                dir: &dir,
                mode: *mode,
                requests: *requests,
                iterations: config.iterations,
                policy: MissingRuns::new(variant.partial),
            };
            written.extend(aggregate_measures(
                &target,
                &variant.measure,
                &variant.trace.syscalls,
            )?);
        }
    }
    Ok(written)
}

pub struct Experiment<'a> {
    config: &'a HarnessConfig,
    live: Arc<LiveServers>,
    phase: Phase,
}

impl<'a> Experiment<'a> {
    pub fn new(config: &'a HarnessConfig, live: Arc<LiveServers>) -> Self {
        Self {
            config,
            live,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Experiment phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Run every variant to completion, or abort on the first failure.
    pub fn run(&mut self) -> Result<()> {
        let config = self.config;
        for variant in config.variants.iter() {
            if let Err(e) = self.run_variant(variant) {
                let e = e.during(format!("variant {} while {}", variant.name, self.phase));
                self.enter(Phase::Aborted);
                return Err(e);
            }
        }
        self.enter(Phase::Done);
        info!("Experiment finished");
        Ok(())
    }

    fn run_variant(&mut self, variant: &Variant) -> Result<()> {
        let started = Instant::now();
        let csv_dir = self.config.csv_dir(variant);
        let log_dir = self.config.log_dir(variant);
        std::fs::create_dir_all(&csv_dir)?;
        std::fs::create_dir_all(&log_dir)?;
        let timing = csv_dir.join(TIMING_LOG);
        if timing.exists() {
            std::fs::remove_file(&timing)?;
        }
        info!(
            "Variant {}: modes [{}], {} iterations, requests {:?}",
            variant.name,
            variant
                .modes
                .iter()
                .map(|m| m.label())
                .collect::<Vec<_>>()
                .join(", "),
            self.config.iterations,
            self.config.requests
        );
        for group in mode_groups(variant) {
            self.enter(Phase::ServersStarting);
            free_port(variant.server.port, variant.server.kill_settle)?;
            let server = ServerHandle::start(
                &variant.name,
                &variant.server,
                &group.launch_args,
                &log_dir.join(&group.log_name),
                &self.live,
            )?;
            let mut admin = if variant.live_reconfigure {
                Some(AdminClient::connect(variant.server.port)?)
            } else {
                None
            };
            for iteration in 1..=self.config.iterations {
                for mode in group.modes.iter() {
                    if let Some(admin) = admin.as_mut() {
                        switch_mode(admin, variant, *mode).map_err(|e| {
                            e.during(format!("switching {} to mode {}", variant.name, mode))
                        })?;
                    }
                    for requests in self.config.requests.iter() {
                        self.enter(Phase::Running {
                            iteration,
                            requests: *requests,
                        });
                        let run = RunConfiguration {
                            variant: variant.name.clone(),
                            mode: *mode,
                            requests: *requests,
                            iteration,
                            port: variant.server.port,
                        };
                        self.measure(variant, &server, &run)?;
                    }
                }
            }
            // stopped explicitly so a failing stop is reported
            let mut server = server;
            server.stop()?;
        }
        append_csv(
            &timing,
            &TimingEntry {
                step: "Total".to_string(),
                seconds: started.elapsed().as_secs_f64(),
            },
        )?;
        self.enter(Phase::Aggregating);
        aggregate_variant(self.config, variant)?;
        Ok(())
    }

    fn measure(
        &self,
        variant: &Variant,
        server: &ServerHandle,
        run: &RunConfiguration,
    ) -> Result<()> {
        info!("Running {}", run);
        for m in variant.measure.iter() {
            self.measure_one(*m, variant, server, run)
                .map_err(|e| e.during(format!("{} of {}", m, run)))?;
        }
        Ok(())
    }

    fn measure_one(
        &self,
        m: Measure,
        variant: &Variant,
        server: &ServerHandle,
        run: &RunConfiguration,
    ) -> Result<()> {
        let csv_dir = self.config.csv_dir(variant);
        let timing = csv_dir.join(TIMING_LOG);
        let log_time = |step: &str, start: Instant| {
            let row = TimingEntry {
                step: format!("{} {} {}", step, run.mode, run.requests),
                seconds: start.elapsed().as_secs_f64(),
            };
            append_csv(&timing, &row)
        };
        let start = Instant::now();
        match m {
            Measure::Rps => {
                let out = csv_dir.join(run.file_name(Family::Performance));
                drive(&variant.load, run.requests, run.port, DriveMode::Capture(out))?;
                log_time("Performance benchmark", start)
            }
            Measure::Load => {
                let cpu_file = csv_dir.join(run.file_name(Family::CpuUsage));
                let memory_file = csv_dir.join(run.file_name(Family::MemoryUsage));
                remove_run_file(&cpu_file)?;
                remove_run_file(&memory_file)?;
                let probe = SysinfoProbe::new();
                let monitor = start_monitoring(probe, server.pid(), variant.sample_interval);
                let driven = drive(&variant.load, run.requests, run.port, DriveMode::Discard);
                let samples = stop_monitoring(monitor);
                driven?;
                if samples.is_empty() {
                    warn!("No resource samples for {}", run);
                }
                let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
                let memory: Vec<f64> = samples.iter().map(|s| s.memory_mb).collect();
                write_csv(
                    &cpu_file,
                    &[CpuUsage {
                        avg_cpu_usage: mean(&cpu),
                    }],
                )?;
                write_csv(
                    &memory_file,
                    &[MemoryUsage {
                        avg_mem_usage: mean(&memory),
                    }],
                )?;
                log_time("Resource usage", start)
            }
            Measure::Syscalls => {
                let stem = format!("{}_{}_run{}", run.mode, run.requests, run.iteration);
                let outputs = outputs_for(
                    &csv_dir,
                    &self.config.log_dir(variant),
                    &run.file_name(Family::Syscalls),
                    &run.file_name(Family::SyscallTimes),
                    &stem,
                );
                let timeline = traced_drive(
                    &variant.trace,
                    &variant.load,
                    run.requests,
                    run.port,
                    server.pid(),
                    outputs,
                )?;
                if !timeline.encloses() {
                    warn!("Trace window of {} does not enclose the load", run);
                }
                log_time("Strace", start)
            }
        }
    }
}
