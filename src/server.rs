//! Lifecycle of the key-value server under test.
//!
//! A server is spawned from a [`ServerSpec`] with its configuration file and `--port` as arguments
//! and its output redirected to a log file. [`ServerHandle::start`] only returns once the server
//! is ready, either because the configured marker line showed up in its output or because the
//! port answers a ping. The handle stops the server with SIGTERM when it is stopped explicitly or
//! dropped, so a server never outlives the run that started it.
//!
//! Every live server is also recorded in a shared [`LiveServers`] set, which is what the Ctrl-C
//! handler uses to tear servers down before the harness exits.

use crate::client::AdminClient;
use crate::config::{Readiness, ServerSpec};
use crate::error::{Error, Result};
use hashbrown::HashSet;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub(crate) fn signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Sys(e)),
    }
}

// {{{ registry

/// The set of servers currently running, shared with the interrupt handler.
#[derive(Default)]
pub struct LiveServers(Mutex<HashSet<u32>>);

impl LiveServers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, pid: u32) {
        self.0.lock().insert(pid);
    }

    fn remove(&self, pid: u32) {
        self.0.lock().remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.0.lock().iter().copied().collect()
    }

    /// SIGTERM every live server. Used on interrupt, when no handle will be dropped normally.
    pub fn terminate_all(&self) {
        for pid in self.0.lock().drain() {
            info!("Terminating server {}", pid);
            if let Err(e) = signal(pid, Signal::SIGTERM) {
                warn!("Failed to terminate server {}: {}", pid, e);
            }
        }
    }
}

// }}} registry

// {{{ handle

pub struct ServerHandle {
    name: String,
    port: u16,
    pid: u32,
    child: Option<Child>,
    copier: Option<JoinHandle<()>>,
    live: Arc<LiveServers>,
}

/// Copy the server's output into the log, reporting the first line that contains `marker`.
fn copy_output(
    stdout: impl std::io::Read + Send + 'static,
    mut log: File,
    marker: String,
) -> (JoinHandle<()>, std::sync::mpsc::Receiver<()>) {
    let (ready_tx, ready_rx) = channel();
    let handle = std::thread::spawn(move || {
        let mut ready = Some(ready_tx);
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else {
                break;
            };
            let _ = writeln!(log, "{}", line);
            if ready.is_some() && line.contains(&marker) {
                let _ = ready.take().map(|tx| tx.send(()));
            }
        }
    });
    (handle, ready_rx)
}

impl ServerHandle {
    /// Spawn the server and block until it is ready.
    ///
    /// `launch_args` are appended to the command line, after the configuration file and the port.
    pub fn start(
        name: &str,
        spec: &ServerSpec,
        launch_args: &[String],
        log_path: &Path,
        live: &Arc<LiveServers>,
    ) -> Result<Self> {
        let log = File::create(log_path)?;
        let mut cmd = Command::new(&spec.executable);
        cmd.arg(&spec.config)
            .arg("--port")
            .arg(spec.port.to_string())
            .args(launch_args)
            .current_dir(&spec.dir)
            .stdin(Stdio::null())
            .stderr(log.try_clone()?);
        match spec.readiness {
            Readiness::Marker(_) => cmd.stdout(Stdio::piped()),
            Readiness::Probe => cmd.stdout(log.try_clone()?),
        };
        debug!("Starting server {}: {:?}", name, cmd);
        let mut child = cmd.spawn().map_err(|e| Error::Startup {
            name: name.to_string(),
            reason: format!("cannot spawn {}: {}", spec.executable.display(), e),
        })?;
        let pid = child.id();
        live.insert(pid);

        let (copier, ready_rx) = match (&spec.readiness, child.stdout.take()) {
            (Readiness::Marker(marker), Some(stdout)) => {
                let (h, rx) = copy_output(stdout, log, marker.clone());
                (Some(h), Some(rx))
            }
            _ => (None, None),
        };

        // from here on, dropping the handle tears the server down
        let mut handle = Self {
            name: name.to_string(),
            port: spec.port,
            pid,
            child: Some(child),
            copier,
            live: live.clone(),
        };
        handle.wait_ready(spec, ready_rx)?;
        info!("Server {} (pid {}) is ready on port {}", name, pid, spec.port);
        Ok(handle)
    }

    fn startup_error(&self, reason: String) -> Error {
        Error::Startup {
            name: self.name.clone(),
            reason,
        }
    }

    fn exited(&mut self) -> Result<Option<String>> {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => Ok(Some(format!("exited with {}", status))),
            Some(Ok(None)) => Ok(None),
            Some(Err(e)) => Err(Error::Io(e)),
            None => Ok(Some("already stopped".to_string())),
        }
    }

    fn wait_ready(
        &mut self,
        spec: &ServerSpec,
        ready_rx: Option<std::sync::mpsc::Receiver<()>>,
    ) -> Result<()> {
        let deadline = Instant::now() + spec.startup_timeout;
        loop {
            if let Some(reason) = self.exited()? {
                return Err(self.startup_error(reason));
            }
            match ready_rx {
                Some(ref rx) => match rx.recv_timeout(READY_POLL_INTERVAL) {
                    Ok(()) => return Ok(()),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        // output closed without the marker, the process is on its way out
                        std::thread::sleep(READY_POLL_INTERVAL);
                        let reason = self
                            .exited()?
                            .unwrap_or("closed its output before becoming ready".to_string());
                        return Err(self.startup_error(reason));
                    }
                },
                None => {
                    if AdminClient::probe(self.port, READY_POLL_INTERVAL) {
                        return Ok(());
                    }
                    std::thread::sleep(READY_POLL_INTERVAL);
                }
            }
            if Instant::now() >= deadline {
                return Err(self.startup_error(format!(
                    "not ready after {:.1}s",
                    spec.startup_timeout.as_secs_f64()
                )));
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// SIGTERM the server and reap it. Stopping a stopped server does nothing.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.live.remove(self.pid);
        if child.try_wait()?.is_none() {
            signal(self.pid, Signal::SIGTERM)?;
        }
        let status = child.wait()?;
        if let Some(copier) = self.copier.take() {
            let _ = copier.join();
        }
        info!("Server {} (pid {}) stopped: {}", self.name, self.pid, status);
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop server {}: {}", self.name, e);
        }
    }
}

// }}} handle

// {{{ port

/// Whether something on this host is bound to `port`.
pub fn port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// The pids holding `port`, as reported by `lsof`. An empty list if `lsof` is not installed.
fn port_holders(port: u16) -> Result<Vec<u32>> {
    let output = match Command::new("lsof")
        .arg("-t")
        .arg(format!("-i:{}", port))
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("lsof is not installed, cannot look up holders of port {}", port);
            return Ok(vec![]);
        }
        Err(e) => return Err(Error::Io(e)),
    };
    // lsof exits with 1 when nothing matches
    if !output.status.success() && output.status.code() != Some(1) {
        return Err(Error::Io(std::io::Error::other(format!(
            "lsof failed with {}",
            output.status
        ))));
    }
    let me = std::process::id();
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|pid| *pid != me)
        .collect())
}

/// Force-kill whatever holds `port`, then wait `settle` for the port to be released.
///
/// Fails with [`Error::PortInUse`] only if the port is still bound afterwards.
pub fn free_port(port: u16, settle: Duration) -> Result<()> {
    let holders = port_holders(port)?;
    for pid in holders.iter() {
        warn!("Killing process {} on port {}", pid, port);
        signal(*pid, Signal::SIGKILL)?;
    }
    if !holders.is_empty() {
        std::thread::sleep(settle);
    }
    if port_in_use(port) {
        return Err(Error::PortInUse { port });
    }
    Ok(())
}

// }}} port

// {{{ tests


// }}} tests
