//! Periodic CPU and memory sampling of a running process.
//!
//! A monitor runs in its own thread and polls a [`ProcessProbe`] every sampling interval until it
//! is stopped or the process disappears. The interval is also how long a stop request may take to
//! be noticed, since the thread waits on the stop channel between two samples. One last sample is
//! taken when the stop arrives, so the tail of a short run is covered as well.

use crate::error::{Error, Result};
use crate::record::ResourceSample;
use crate::ProcessProbe;
use log::{debug, warn};
use nix::errno::Errno;
use nix::time::ClockId;
use nix::unistd::Pid as UnixPid;
use quanta::Instant;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

const MB: f64 = (1 << 20) as f64;

/// CPU time consumed by `pid` so far, summed over all of its threads.
fn cpu_time(pid: u32) -> Result<Duration> {
    let clock = ClockId::pid_cpu_clock_id(UnixPid::from_raw(pid as i32));
    match clock.and_then(|c| c.now()) {
        Ok(t) => Ok(Duration::from(t)),
        Err(Errno::ESRCH) | Err(Errno::EINVAL) => Err(Error::ProcessNotFound { pid }),
        Err(e) => Err(Error::Sys(e)),
    }
}

/// Samples through the host's process table.
///
/// Memory is the resident set reported by `sysinfo`. CPU usage is the CPU time the process used
/// since the previous sample divided by the wall time in between, in percent of one core, so a
/// process spinning on two cores reads 200. The first sample of a process only records a
/// reference point and reads 0.
pub struct SysinfoProbe {
    system: System,
    last: Option<(u32, Duration, Instant)>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last: None,
        }
    }

    fn cpu_percent(&mut self, pid: u32) -> Result<f64> {
        let used = cpu_time(pid)?;
        let now = Instant::now();
        let percent = match self.last {
            Some((last_pid, last_used, last_now)) if last_pid == pid && now > last_now => {
                let wall = (now - last_now).as_secs_f64();
                used.saturating_sub(last_used).as_secs_f64() / wall * 100.0
            }
            _ => 0.0,
        };
        self.last = Some((pid, used, now));
        Ok(percent)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn attach(&mut self, pid: u32) -> Result<()> {
        self.cpu_percent(pid).map(|_| ())
    }

    fn sample(&mut self, pid: u32) -> Result<ResourceSample> {
        let spid = Pid::from_u32(pid);
        let kind = ProcessRefreshKind::new().with_memory();
        if !self.system.refresh_process_specifics(spid, kind) {
            return Err(Error::ProcessNotFound { pid });
        }
        let Some(process) = self.system.process(spid) else {
            return Err(Error::ProcessNotFound { pid });
        };
        // an exited child stays in the table until it is reaped
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Err(Error::ProcessNotFound { pid });
        }
        let memory_mb = process.memory() as f64 / MB;
        Ok(ResourceSample {
            cpu_percent: self.cpu_percent(pid)?,
            memory_mb,
        })
    }
}

pub struct MonitorHandle {
    pid: u32,
    stop_tx: Sender<()>,
    thread: JoinHandle<Vec<ResourceSample>>,
}

/// Start sampling `pid` every `interval` in a background thread.
pub fn start_monitoring<P>(mut probe: P, pid: u32, interval: Duration) -> MonitorHandle
where
    P: ProcessProbe + Send + 'static,
{
    let (stop_tx, stop_rx) = channel::<()>();
    let thread = std::thread::spawn(move || {
        let mut samples = Vec::new();
        if let Err(e) = probe.attach(pid) {
            debug!("Cannot attach to process {}: {}", pid, e);
            return samples;
        }
        loop {
            let stopping = match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => false,
                // stop requested or the handle is gone
                _ => true,
            };
            match probe.sample(pid) {
                Ok(s) => samples.push(s),
                Err(Error::ProcessNotFound { .. }) => {
                    debug!("Process {} is gone, monitor exits", pid);
                    break;
                }
                Err(e) => {
                    warn!("Sampling process {} failed: {}", pid, e);
                    break;
                }
            }
            if stopping {
                break;
            }
        }
        samples
    });
    MonitorHandle {
        pid,
        stop_tx,
        thread,
    }
}

/// Stop the monitor and return every sample it collected, in order.
pub fn stop_monitoring(handle: MonitorHandle) -> Vec<ResourceSample> {
    let _ = handle.stop_tx.send(());
    match handle.thread.join() {
        Ok(samples) => {
            debug!("Monitor of {} collected {} samples", handle.pid, samples.len());
            samples
        }
        Err(_) => {
            warn!("Monitor of {} panicked, no samples kept", handle.pid);
            vec![]
        }
    }
}
