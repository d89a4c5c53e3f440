//! Errors raised while orchestrating and aggregating benchmark runs.
//!
//! Failures of the process controller, the load driver and the tracer are fatal to the enclosing
//! run and are never retried. [`Error::ProcessNotFound`] is the only variant that the harness
//! swallows: the resource monitor logs it and returns the samples it already has.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The server exited, or never became reachable, before it was ready.
    #[error("server `{name}` failed to start: {reason}")]
    Startup { name: String, reason: String },

    /// A stale process still holds the port after the preflight kill.
    #[error("port {port} is still in use")]
    PortInUse { port: u16 },

    /// The load generator exited with a non-zero status.
    #[error("load generator `{command}` failed with {status}")]
    DriverFailure { command: String, status: ExitStatus },

    /// The tracer exited without writing one of its output files.
    #[error("tracer did not produce {}", path.display())]
    MissingTraceOutput { path: PathBuf },

    /// Fewer per-run files exist than the configured iteration count.
    #[error("expected {expected} per-run files for {family}, found {found}")]
    AggregationInputMismatch {
        family: String,
        expected: usize,
        found: usize,
    },

    /// The external chart renderer exited with a non-zero status.
    #[error("chart renderer `{command}` failed with {status}")]
    RenderFailure { command: String, status: ExitStatus },

    /// A per-run syscall file lacks one of the syscalls of interest.
    #[error("syscall `{syscall}` missing from {}", path.display())]
    MissingSyscall { syscall: String, path: PathBuf },

    /// The monitored process is gone.
    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    /// A snapshot or log rewrite was still running when the wait for it ran out.
    #[error("server on port {port} still persisting after {:.1}s", waited.as_secs_f64())]
    PersistenceBusy { port: u16, waited: Duration },

    /// Persisted data did not survive a restart.
    #[error("{incorrect} of {total} keys were not recovered")]
    Integrity { incorrect: usize, total: usize },

    /// A failure together with the experiment step it ended.
    #[error("{step}: {source}")]
    Step { step: String, source: Box<Error> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl Error {
    /// Name the step this error ended. An error that already names its step keeps it.
    pub fn during(self, step: impl fmt::Display) -> Self {
        match self {
            Error::Step { .. } => self,
            e => Error::Step {
                step: step.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// The error underneath any step.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            e => e,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Figment(Box::new(e))
    }
}
