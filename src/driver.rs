//! Runs the external load generator against a live server.
//!
//! The load generator is invoked as
//!
//! ```text
//! <benchmark> -p <port> -c <clients> -t <operations> -n <requests> (--csv | -q)
//! ```
//!
//! In [`DriveMode::Capture`] its machine-readable report is kept in a file and parsed into
//! [`PerformanceRecord`]s. The report is written next to its final path and only moved there once
//! the load generator succeeded and the report parsed, so a failed run leaves no per-run file. In
//! [`DriveMode::Discard`] the output is thrown away; the run only exists to put the server under
//! load while something else is measured.

use crate::config::LoadSpec;
use crate::error::{Error, Result};
use crate::record::{read_csv, remove_run_file, PerformanceRecord};
use log::debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Clone, Debug, PartialEq)]
pub enum DriveMode {
    /// Keep the CSV report at this path and parse it.
    Capture(PathBuf),
    /// Quiet mode, output discarded.
    Discard,
}

fn command(spec: &LoadSpec, requests: u64, port: u16, mode: &DriveMode) -> Command {
    let mut cmd = Command::new(&spec.executable);
    cmd.arg("-p")
        .arg(port.to_string())
        .arg("-c")
        .arg(spec.clients.to_string())
        .arg("-t")
        .arg(&spec.operations)
        .arg("-n")
        .arg(requests.to_string())
        .arg(match mode {
            DriveMode::Capture(_) => "--csv",
            DriveMode::Discard => "-q",
        })
        .stdin(Stdio::null());
    cmd
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Drive `requests` requests at the server on `port` and wait for the load generator to finish.
///
/// Returns the parsed report in capture mode and `None` in discard mode. A non-zero exit status is
/// an [`Error::DriverFailure`].
pub fn drive(
    spec: &LoadSpec,
    requests: u64,
    port: u16,
    mode: DriveMode,
) -> Result<Option<Vec<PerformanceRecord>>> {
    let mut cmd = command(spec, requests, port, &mode);
    let DriveMode::Capture(path) = mode else {
        cmd.stdout(Stdio::null());
        debug!("Driving load: {:?}", cmd);
        run(&mut cmd)?;
        return Ok(None);
    };
    let staging = staging_path(&path);
    remove_run_file(&path)?;
    cmd.stdout(File::create(&staging)?);
    debug!("Driving load: {:?}", cmd);
    let parsed = run(&mut cmd).and_then(|_| read_csv(&staging));
    let rows = match parsed {
        Ok(rows) => rows,
        Err(e) => {
            let _ = remove_run_file(&staging);
            return Err(e);
        }
    };
    std::fs::rename(&staging, &path)?;
    Ok(Some(rows))
}

fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(Error::DriverFailure {
            command: format!("{:?}", cmd),
            status,
        });
    }
    Ok(())
}
