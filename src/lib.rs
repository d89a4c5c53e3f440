#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A benchmark harness that compares the persistence configurations of a key-value server.
//!
//! With `persistbench`, you describe in TOML the server builds to compare, each as a variant with
//! its executable, port and durability modes (snapshots, or an append-only log with one of the
//! fsync policies). The harness then starts every server, drives load against it with an external
//! load generator and measures throughput and latency, CPU and memory usage of the server, and
//! the syscalls the server makes while under load. Every run is repeated a configurable number of
//! times and the per-run measurements are averaged into one CSV file per metric family.
//!
//! A few key design choices include:
//!
//! - The server, the load generator and the syscall tracer are external programs. The harness
//! only starts, signals and waits for them, and reads the files they produce.
//! - Runs are strictly sequential. Nothing else the harness controls competes with a run for CPU,
//! memory or disk, and the only concurrent task is the resource monitor of the run itself.
//! - Every measurement family has its own record type, so a malformed per-run file is an error when
//! it is read, not a wrong number in a summary.
//! - Servers are owned by handles that stop them when dropped, and a Ctrl-C stops every live
//! server before the harness exits.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@config`] for the config format of an experiment.
//! - [`mod@record`] for the layout of the output files.
//! - [`cmdline()`] for the usage of the default command line interface.

use crate::error::Result;
use crate::record::ResourceSample;

/// A source of CPU and memory readings for a process.
///
/// The resource monitor polls a probe once per sampling interval. A probe reports a process that
/// no longer exists with [`Error::ProcessNotFound`], which ends the monitoring quietly.
pub trait ProcessProbe {
    /// Called once before the first sample of `pid`, for probes that measure against a reference
    /// point.
    fn attach(&mut self, _pid: u32) -> Result<()> {
        Ok(())
    }

    /// Take one reading of `pid`. CPU usage is in percent of one core, memory is the resident set
    /// in MB.
    fn sample(&mut self, pid: u32) -> Result<ResourceSample>;
}

pub mod aggregate;
pub mod client;
mod cmdline;
pub mod config;
pub mod driver;
pub mod error;
pub mod experiment;
pub mod integrity;
pub mod monitor;
pub mod plot;
pub mod record;
pub mod server;
pub mod tracer;

#[cfg(test)]
mod fixtures;

pub use cmdline::cmdline;
pub use error::Error;
