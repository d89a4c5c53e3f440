//! The harness configuration.
//!
//! ## Configuration Format
//!
//! An experiment is described in TOML. It consists of one or more server variants, each defined in
//! a dictionary named `variant`, so the configuration of each variant starts with `[[variant]]`. A
//! `[global]` section provides the experiment-wide options and fills in any option a variant does
//! not set itself. Optional `[[comparison]]` sections pair two variants for chart rendering.
//!
//! ```toml
//! [global]
//! benchmark = "./redis-benchmark"
//! iterations = 3
//! requests = [10000, 100000]
//!
//! [[variant]]
//! name = "RDB"
//! server = "./src/redis-server"
//! config = "redis.conf"
//! dir = "../redis"
//! port = 6381
//! persistence = "rdb"
//!
//! [[variant]]
//! name = "AOF"
//! server = "./src/redis-server"
//! config = "redis.conf"
//! dir = "../redis"
//! port = 6380
//! persistence = "aof"
//! fsync = ["always", "everysec", "no"]
//!
//! [[comparison]]
//! left = "RDB"
//! right = "AOF"
//! fsync = "always"
//! ```
//!
//! Available options can be found in [`VariantOpt`] and [`GlobalOpt`]. As with any figment
//! configuration, options can also be overridden through environment variables.
//!
//! The parsed options are resolved once into an immutable [`HarnessConfig`] that is handed to
//! every component by reference.

use crate::error::{Error, Result};
use crate::record::{DurabilityMode, Fsync};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_READY_MARKER: &str = "Ready to accept connections";
pub const DEFAULT_SYSCALLS: [&str; 3] = ["write", "fdatasync", "io_uring_enter"];

// {{{ options

/// The configuration of a single server variant deserialized from a TOML string.
///
/// All fields but `name` are optional, as they may be given in `[global]` instead.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VariantOpt {
    /// Name of the variant, also the directory its outputs are written to.
    pub name: String,

    /// Label used in charts. Default: the name.
    pub label: Option<String>,

    /// Bar color used in charts.
    pub color: Option<String>,

    /// Path of the server executable, relative to `dir`.
    pub server: Option<String>,

    /// Server configuration file passed as the first argument. Default: "redis.conf".
    pub config: Option<String>,

    /// Working directory of the server.
    pub dir: Option<String>,

    /// Port the server listens on. Default: 6379.
    pub port: Option<u16>,

    /// Readiness check: "probe" (ping the port) or "marker" (wait for a line in the server's
    /// output). Default: "probe".
    pub ready: Option<String>,

    /// The line that marks the server ready. Default: "Ready to accept connections".
    pub ready_marker: Option<String>,

    /// Seconds to wait for the server to become ready. Default: 30.
    pub startup_timeout: Option<f32>,

    /// Seconds to wait after force-killing a stale process on the port. Default: 5.
    pub kill_settle: Option<f32>,

    /// Directory holding the persisted data, wiped before an integrity check.
    pub data_dir: Option<String>,

    /// Path of the load generator. Default: "./redis-benchmark".
    pub benchmark: Option<String>,

    /// Number of parallel load generator connections. Default: 50.
    pub clients: Option<usize>,

    /// Comma-separated operation mix. Default: "set,lpush".
    pub operations: Option<String>,

    /// Tracer backend: "script" (external script) or "strace" (built-in). Default: "script".
    pub tracer: Option<String>,

    /// Path of the tracer script. Default: "./strace-syscalls.sh".
    pub tracer_script: Option<String>,

    /// Whether the tracer runs through sudo. Default: false.
    pub sudo: Option<bool>,

    /// Syscalls of interest. Default: write, fdatasync, io_uring_enter.
    pub syscalls: Option<Vec<String>>,

    /// Seconds between tracer attach and load start, and between load end and tracer stop.
    /// Default: 0.5.
    pub trace_settle: Option<f32>,

    /// Seconds between two resource samples. Default: 0.1.
    pub sample_interval: Option<f32>,

    /// Measurements taken for each run, any of "rps", "load" and "syscalls". Default: all.
    pub measure: Option<Vec<String>>,

    /// Average over the per-run files found even when some iterations are missing.
    /// Default: false.
    pub partial: Option<bool>,

    /// "rdb" or "aof".
    pub persistence: Option<String>,

    /// Fsync policies measured for "aof". Default: always, everysec, no.
    pub fsync: Option<Vec<Fsync>>,

    /// Whether the durability mode can be changed on the running server. When false, each mode is
    /// passed as launch flags and the server is restarted between modes. Default: true.
    pub live_reconfigure: Option<bool>,

    /// Seconds to wait after a live mode switch, once no snapshot or log rewrite is running
    /// anymore. Default: 1.
    pub reconfigure_settle: Option<f32>,
}

/// The options of the `[global]` section.
///
/// The experiment-wide options are only read from here. The rest override missing fields in each
/// `[[variant]]` section; their usage is documented in [`VariantOpt`].
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    /// Root of the output tree. Default: "data".
    pub output: Option<String>,
    /// Repetitions of every run. Default: 1.
    pub iterations: Option<usize>,
    /// Request counts driven per run. Default: [100000].
    pub requests: Option<Vec<u64>>,
    /// External chart renderer.
    pub plot: Option<String>,
    // variant
    pub server: Option<String>,
    pub config: Option<String>,
    pub dir: Option<String>,
    pub port: Option<u16>,
    pub ready: Option<String>,
    pub ready_marker: Option<String>,
    pub startup_timeout: Option<f32>,
    pub kill_settle: Option<f32>,
    pub benchmark: Option<String>,
    pub clients: Option<usize>,
    pub operations: Option<String>,
    pub tracer: Option<String>,
    pub tracer_script: Option<String>,
    pub sudo: Option<bool>,
    pub syscalls: Option<Vec<String>>,
    pub trace_settle: Option<f32>,
    pub sample_interval: Option<f32>,
    pub measure: Option<Vec<String>>,
    pub partial: Option<bool>,
    pub live_reconfigure: Option<bool>,
    pub reconfigure_settle: Option<f32>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut VariantOpt) {
        opt.label = opt.label.clone().or_else(|| Some(opt.name.clone()));
        opt.server = opt.server.clone().or_else(|| self.server.clone());
        opt.config = opt
            .config
            .clone()
            .or_else(|| Some(self.config.clone().unwrap_or("redis.conf".to_string())));
        opt.dir = opt
            .dir
            .clone()
            .or_else(|| Some(self.dir.clone().unwrap_or(".".to_string())));
        opt.port = opt.port.or_else(|| Some(self.port.unwrap_or(6379)));
        opt.ready = opt
            .ready
            .clone()
            .or_else(|| Some(self.ready.clone().unwrap_or("probe".to_string())));
        opt.ready_marker = opt.ready_marker.clone().or_else(|| {
            Some(
                self.ready_marker
                    .clone()
                    .unwrap_or(DEFAULT_READY_MARKER.to_string()),
            )
        });
        opt.startup_timeout = opt
            .startup_timeout
            .or_else(|| Some(self.startup_timeout.unwrap_or(30.0)));
        opt.kill_settle = opt
            .kill_settle
            .or_else(|| Some(self.kill_settle.unwrap_or(5.0)));
        opt.benchmark = opt.benchmark.clone().or_else(|| {
            Some(
                self.benchmark
                    .clone()
                    .unwrap_or("./redis-benchmark".to_string()),
            )
        });
        opt.clients = opt.clients.or_else(|| Some(self.clients.unwrap_or(50)));
        opt.operations = opt
            .operations
            .clone()
            .or_else(|| Some(self.operations.clone().unwrap_or("set,lpush".to_string())));
        opt.tracer = opt
            .tracer
            .clone()
            .or_else(|| Some(self.tracer.clone().unwrap_or("script".to_string())));
        opt.tracer_script = opt.tracer_script.clone().or_else(|| {
            Some(
                self.tracer_script
                    .clone()
                    .unwrap_or("./strace-syscalls.sh".to_string()),
            )
        });
        opt.sudo = opt.sudo.or_else(|| Some(self.sudo.unwrap_or(false)));
        opt.syscalls = opt.syscalls.clone().or_else(|| {
            Some(self.syscalls.clone().unwrap_or_else(|| {
                DEFAULT_SYSCALLS.iter().map(|s| s.to_string()).collect()
            }))
        });
        opt.trace_settle = opt
            .trace_settle
            .or_else(|| Some(self.trace_settle.unwrap_or(0.5)));
        opt.sample_interval = opt
            .sample_interval
            .or_else(|| Some(self.sample_interval.unwrap_or(0.1)));
        opt.measure = opt.measure.clone().or_else(|| {
            Some(self.measure.clone().unwrap_or_else(|| {
                vec!["rps".to_string(), "load".to_string(), "syscalls".to_string()]
            }))
        });
        opt.partial = opt.partial.or_else(|| Some(self.partial.unwrap_or(false)));
        opt.live_reconfigure = opt
            .live_reconfigure
            .or_else(|| Some(self.live_reconfigure.unwrap_or(true)));
        opt.reconfigure_settle = opt
            .reconfigure_settle
            .or_else(|| Some(self.reconfigure_settle.unwrap_or(1.0)));
        if opt.persistence.as_deref() == Some("aof") && opt.fsync.is_none() {
            opt.fsync = Some(vec![Fsync::Always, Fsync::EverySec, Fsync::No]);
        }
    }
}

/// A pair of variants whose averaged outputs are charted against each other.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Comparison {
    pub left: String,
    pub right: String,
    /// Fsync policy compared on the append-only side(s). Default: always.
    pub fsync: Option<Fsync>,
}

/// The whole configuration file, after `[global]` has been applied to every variant.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HarnessOpt {
    #[serde(default)]
    pub global: GlobalOpt,
    pub variant: Vec<VariantOpt>,
    #[serde(default)]
    pub comparison: Vec<Comparison>,
}

impl HarnessOpt {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut opt: HarnessOpt = Figment::new()
            .merge(Toml::string(text))
            .merge(Env::raw())
            .extract()?;
        debug!("Creating harness with the following configurations: {:?}", opt);
        let global = opt.global.clone();
        for v in opt.variant.iter_mut() {
            global.apply(v);
        }
        Ok(opt)
    }
}

// }}} options

// {{{ resolved

/// How the process controller decides that a freshly spawned server is ready.
#[derive(Clone, Debug, PartialEq)]
pub enum Readiness {
    /// Wait for a line containing the marker on the server's standard output.
    Marker(String),
    /// Poll the port with a ping until it answers.
    Probe,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TracerKind {
    /// `<script> <pid> <counts> <times> <log>`, stopped with SIGINT.
    Script(PathBuf),
    /// `strace -c` attached to the server, summary parsed by the harness.
    Strace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Measure {
    /// Throughput and latency, captured from the load generator.
    Rps,
    /// CPU and memory of the server, sampled while load is driven.
    Load,
    /// Syscall counts and times of the server, traced while load is driven.
    Syscalls,
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Measure::Rps => "performance benchmark",
            Measure::Load => "resource usage",
            Measure::Syscalls => "syscall trace",
        })
    }
}

impl Measure {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "rps" => Ok(Measure::Rps),
            "load" => Ok(Measure::Load),
            "syscalls" => Ok(Measure::Syscalls),
            _ => Err(Error::Config(format!(
                "measure should be one of: rps, load, syscalls, got {}",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerSpec {
    pub executable: PathBuf,
    pub config: String,
    pub dir: PathBuf,
    pub port: u16,
    pub readiness: Readiness,
    pub startup_timeout: Duration,
    pub kill_settle: Duration,
    pub data_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadSpec {
    pub executable: PathBuf,
    pub clients: usize,
    pub operations: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceSpec {
    pub kind: TracerKind,
    pub sudo: bool,
    pub syscalls: Vec<String>,
    pub settle: Duration,
}

/// A fully resolved server variant.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    pub name: String,
    pub label: String,
    pub color: Option<String>,
    pub server: ServerSpec,
    pub load: LoadSpec,
    pub trace: TraceSpec,
    pub sample_interval: Duration,
    pub measure: Vec<Measure>,
    pub partial: bool,
    pub modes: Vec<DurabilityMode>,
    pub live_reconfigure: bool,
    pub reconfigure_settle: Duration,
}

fn secs(name: &str, v: Option<f32>) -> Result<Duration> {
    let v = v.unwrap_or_default();
    if !v.is_finite() || v < 0.0 {
        return Err(Error::Config(format!("{} should be a non-negative number", name)));
    }
    Ok(Duration::from_secs_f32(v))
}

impl Variant {
    /// Expects `[global]` to be applied already.
    fn new(opt: &VariantOpt) -> Result<Self> {
        let missing =
            |field: &str| Error::Config(format!("{}: {} should be given", opt.name, field));
        if opt.name.is_empty() {
            return Err(Error::Config("variant name should not be empty".to_string()));
        }
        let executable = PathBuf::from(opt.server.clone().ok_or_else(|| missing("server"))?);
        let readiness = match opt.ready.as_deref() {
            Some("probe") => Readiness::Probe,
            Some("marker") => Readiness::Marker(opt.ready_marker.clone().unwrap_or_default()),
            _ => {
                return Err(Error::Config(
                    "ready should be one of: probe, marker".to_string(),
                ))
            }
        };
        let server = ServerSpec {
            executable,
            config: opt.config.clone().unwrap_or_default(),
            dir: PathBuf::from(opt.dir.clone().unwrap_or_default()),
            port: opt.port.ok_or_else(|| missing("port"))?,
            readiness,
            startup_timeout: secs("startup_timeout", opt.startup_timeout)?,
            kill_settle: secs("kill_settle", opt.kill_settle)?,
            data_dir: opt.data_dir.as_ref().map(PathBuf::from),
        };

        let clients = opt.clients.unwrap_or_default();
        if clients == 0 {
            return Err(Error::Config("clients should be positive".to_string()));
        }
        let load = LoadSpec {
            executable: PathBuf::from(opt.benchmark.clone().unwrap_or_default()),
            clients,
            operations: opt.operations.clone().unwrap_or_default(),
        };

        let kind = match opt.tracer.as_deref() {
            Some("script") => TracerKind::Script(PathBuf::from(
                opt.tracer_script.clone().unwrap_or_default(),
            )),
            Some("strace") => TracerKind::Strace,
            _ => {
                return Err(Error::Config(
                    "tracer should be one of: script, strace".to_string(),
                ))
            }
        };
        let syscalls = opt.syscalls.clone().unwrap_or_default();
        if syscalls.is_empty() {
            return Err(Error::Config("syscalls should not be empty".to_string()));
        }
        let trace = TraceSpec {
            kind,
            sudo: opt.sudo.unwrap_or_default(),
            syscalls,
            settle: secs("trace_settle", opt.trace_settle)?,
        };

        let sample_interval = secs("sample_interval", opt.sample_interval)?;
        if sample_interval.is_zero() {
            return Err(Error::Config("sample_interval should be positive".to_string()));
        }

        let mut measure = Vec::new();
        for m in opt.measure.clone().unwrap_or_default().iter() {
            let m = Measure::parse(m)?;
            if !measure.contains(&m) {
                measure.push(m);
            }
        }

        let modes = match opt.persistence.as_deref() {
            Some("rdb") => vec![DurabilityMode::Snapshot],
            Some("aof") => {
                let fsync = opt.fsync.clone().unwrap_or_default();
                if fsync.is_empty() {
                    return Err(Error::Config("fsync should not be empty".to_string()));
                }
                fsync.into_iter().map(DurabilityMode::AppendOnly).collect()
            }
            _ => {
                return Err(Error::Config(format!(
                    "{}: persistence should be one of: rdb, aof",
                    opt.name
                )))
            }
        };

        Ok(Self {
            name: opt.name.clone(),
            label: opt.label.clone().unwrap_or_else(|| opt.name.clone()),
            color: opt.color.clone(),
            server,
            load,
            trace,
            sample_interval,
            measure,
            partial: opt.partial.unwrap_or_default(),
            modes,
            live_reconfigure: opt.live_reconfigure.unwrap_or(true),
            reconfigure_settle: secs("reconfigure_settle", opt.reconfigure_settle)?,
        })
    }

    /// The durability mode a comparison refers to on this variant.
    pub fn mode_for(&self, fsync: Fsync) -> Option<DurabilityMode> {
        self.modes
            .iter()
            .find(|m| match m {
                DurabilityMode::Snapshot => true,
                DurabilityMode::AppendOnly(f) => *f == fsync,
            })
            .copied()
    }
}

/// The resolved configuration of one experiment.
#[derive(Clone, Debug, PartialEq)]
pub struct HarnessConfig {
    pub output: PathBuf,
    pub iterations: usize,
    pub requests: Vec<u64>,
    pub plot: Option<PathBuf>,
    pub variants: Vec<Variant>,
    pub comparisons: Vec<Comparison>,
}

impl HarnessConfig {
    pub fn new(opt: &HarnessOpt) -> Result<Self> {
        let iterations = opt.global.iterations.unwrap_or(1);
        if iterations == 0 {
            return Err(Error::Config("iterations should be positive".to_string()));
        }
        let requests = opt.global.requests.clone().unwrap_or(vec![100000]);
        if requests.is_empty() || requests.iter().any(|r| *r == 0) {
            return Err(Error::Config(
                "requests should be a non-empty list of positive counts".to_string(),
            ));
        }
        if opt.variant.is_empty() {
            return Err(Error::Config("at least one variant should be given".to_string()));
        }
        let mut variants: Vec<Variant> = Vec::with_capacity(opt.variant.len());
        for v in opt.variant.iter() {
            let v = Variant::new(v)?;
            if variants.iter().any(|o| o.name == v.name) {
                return Err(Error::Config(format!("duplicate variant {}", v.name)));
            }
            variants.push(v);
        }
        Ok(Self {
            output: PathBuf::from(opt.global.output.clone().unwrap_or("data".to_string())),
            iterations,
            requests,
            plot: opt.global.plot.as_ref().map(PathBuf::from),
            variants,
            comparisons: opt.comparison.clone(),
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::new(&HarnessOpt::from_toml_str(text)?)
    }

    /// Keep only the named variants, in the configured order.
    pub fn select(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        for n in names.iter() {
            if !self.variants.iter().any(|v| &v.name == n) {
                return Err(Error::Config(format!("variant {} not found", n)));
            }
        }
        self.variants.retain(|v| names.contains(&v.name));
        Ok(())
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn csv_dir(&self, variant: &Variant) -> PathBuf {
        self.output.join(&variant.name).join("csvs")
    }

    pub fn log_dir(&self, variant: &Variant) -> PathBuf {
        self.output.join(&variant.name).join("logs")
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.output.join("graphs")
    }
}

// }}} resolved

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;

    const PRESET: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/presets/redis.toml"));

    const STRACE_PRESET: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/presets/strace.toml"));

    #[test]
    fn preset_is_resolved() {
        let cfg = HarnessConfig::from_toml_str(PRESET).unwrap();
        assert_eq!(cfg.iterations, 3);
        assert_eq!(cfg.requests, vec![10000, 100000]);
        assert_eq!(cfg.variants.len(), 3);
        let rdb = cfg.variant("RDB").unwrap();
        assert_eq!(rdb.modes, vec![DurabilityMode::Snapshot]);
        assert_eq!(rdb.server.port, 6381);
        assert_eq!(rdb.load.clients, 50);
        assert!(rdb.trace.sudo);
        assert_eq!(
            rdb.trace.kind,
            TracerKind::Script(PathBuf::from("./strace-syscalls.sh"))
        );
        assert_eq!(rdb.measure, vec![Measure::Rps, Measure::Load, Measure::Syscalls]);
        let uring = cfg.variant("URING_AOF").unwrap();
        assert_eq!(uring.modes.len(), 3);
        assert_eq!(uring.label, "URING AOF");
        assert_eq!(uring.trace.settle, Duration::from_millis(500));
        assert_eq!(uring.reconfigure_settle, Duration::from_secs(1));
        assert_eq!(cfg.comparisons.len(), 5);
        assert_eq!(cfg.csv_dir(uring), PathBuf::from("data/URING_AOF/csvs"));
    }

    #[test]
    fn strace_preset_is_resolved() {
        let cfg = HarnessConfig::from_toml_str(STRACE_PRESET).unwrap();
        let v = &cfg.variants[0];
        assert_eq!(v.trace.kind, TracerKind::Strace);
        assert_eq!(
            v.server.readiness,
            Readiness::Marker(DEFAULT_READY_MARKER.to_string())
        );
        assert_eq!(v.measure, vec![Measure::Syscalls]);
        assert_eq!(v.modes, vec![DurabilityMode::AppendOnly(Fsync::Always)]);
        assert!(cfg.plot.is_none());
    }

    #[test]
    fn variant_options_override_global() {
        let opt = r#"
            [global]
            server = "./a"
            clients = 8
            sudo = true

            [[variant]]
            name = "x"
            port = 7000
            clients = 2
            persistence = "rdb"

            [[variant]]
            name = "y"
            port = 7001
            sudo = false
            persistence = "aof"
        "#;
        let cfg = HarnessConfig::from_toml_str(opt).unwrap();
        let x = cfg.variant("x").unwrap();
        let y = cfg.variant("y").unwrap();
        assert_eq!(x.load.clients, 2);
        assert_eq!(y.load.clients, 8);
        assert!(x.trace.sudo);
        assert!(!y.trace.sudo);
        assert_eq!(y.modes.len(), 3);
        assert_eq!(x.server.executable, PathBuf::from("./a"));
        assert_eq!(x.server.readiness, Readiness::Probe);
    }

    #[test]
    fn select_variants() {
        let mut cfg = HarnessConfig::from_toml_str(PRESET).unwrap();
        cfg.select(&["URING_AOF".to_string(), "RDB".to_string()])
            .unwrap();
        let names: Vec<&str> = cfg.variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["RDB", "URING_AOF"]);
        assert!(cfg.select(&["nope".to_string()]).is_err());
    }

    fn invalid(opt: &str) {
        match HarnessConfig::from_toml_str(opt) {
            Err(Error::Config(_)) => {}
            r => panic!("expected a configuration error, got {:?}", r),
        }
    }

    #[test]
    fn invalid_persistence() {
        invalid(
            r#"
            [[variant]]
            name = "x"
            server = "./a"
            persistence = "wal"
        "#,
        );
    }

    #[test]
    fn invalid_measure() {
        invalid(
            r#"
            [global]
            measure = ["rps", "iops"]

            [[variant]]
            name = "x"
            server = "./a"
            persistence = "rdb"
        "#,
        );
    }

    #[test]
    fn invalid_iterations() {
        invalid(
            r#"
            [global]
            iterations = 0

            [[variant]]
            name = "x"
            server = "./a"
            persistence = "rdb"
        "#,
        );
    }

    #[test]
    fn missing_server() {
        invalid(
            r#"
            [[variant]]
            name = "x"
            persistence = "rdb"
        "#,
        );
    }

    #[test]
    fn duplicate_variant() {
        invalid(
            r#"
            [global]
            server = "./a"

            [[variant]]
            name = "x"
            persistence = "rdb"

            [[variant]]
            name = "x"
            persistence = "aof"
        "#,
        );
    }

    #[test]
    fn comparison_modes() {
        let cfg = HarnessConfig::from_toml_str(PRESET).unwrap();
        let rdb = cfg.variant("RDB").unwrap();
        let aof = cfg.variant("AOF").unwrap();
        assert_eq!(rdb.mode_for(Fsync::No), Some(DurabilityMode::Snapshot));
        assert_eq!(
            aof.mode_for(Fsync::EverySec),
            Some(DurabilityMode::AppendOnly(Fsync::EverySec))
        );
    }
}

// }}} tests
