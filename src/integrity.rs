//! Checks that writes survive a graceful restart of the server.
//!
//! The check wipes the variant's data directory, writes `key_1..key_N` and increments a counter
//! `N` times, asking for a log rewrite at a random point in between when the mode uses the
//! append-only log. The server is then stopped, started again on the same data and every value is
//! read back.
//!
//! The server is always launched with the mode's settings as flags, so the restarted server loads
//! the same persistence files it wrote whatever its configuration file says.

use crate::client::AdminClient;
use crate::config::{HarnessConfig, Variant};
use crate::error::{Error, Result};
use crate::record::{write_csv, DurabilityMode};
use crate::server::{free_port, LiveServers, ServerHandle};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const COUNTER_KEY: &str = "incr_key_1";
pub const INTEGRITY_FILE: &str = "integrity.csv";

/// Outcome of one check, one row of `integrity.csv`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IntegrityReport {
    pub variant: String,
    pub mode: String,
    pub keys: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub counter_ok: bool,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.incorrect == 0 && self.counter_ok
    }
}

/// Compare `key_1..key_N` and the counter against what was written, reading through `get`.
pub fn tally<F>(keys: usize, mut get: F) -> Result<(usize, usize, bool)>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut correct = 0;
    let mut incorrect = 0;
    for i in 1..=keys {
        match get(&format!("key_{}", i))? {
            Some(v) if v == i.to_string() => correct += 1,
            _ => incorrect += 1,
        }
    }
    let counter_ok = get(COUNTER_KEY)?.as_deref() == Some(keys.to_string().as_str());
    Ok((correct, incorrect, counter_ok))
}

fn write_data(admin: &mut AdminClient, mode: DurabilityMode, keys: usize) -> Result<()> {
    let rewrite_at = match mode {
        DurabilityMode::AppendOnly(_) => Some(rand::rng().random_range(1..=keys)),
        DurabilityMode::Snapshot => None,
    };
    for i in 1..=keys {
        admin.set(&format!("key_{}", i), &i.to_string())?;
        if rewrite_at == Some(i) {
            info!("Rewriting the append-only log after {} keys", i);
            admin.rewrite_log()?;
        }
    }
    admin.set(COUNTER_KEY, "0")?;
    for _ in 0..keys {
        admin.incr(COUNTER_KEY)?;
    }
    Ok(())
}

/// Run the check for the first durability mode of `variant`.
pub fn check(
    config: &HarnessConfig,
    variant: &Variant,
    keys: usize,
    live: &Arc<LiveServers>,
) -> Result<IntegrityReport> {
    if keys == 0 {
        return Err(Error::Config("keys should be positive".to_string()));
    }
    let Some(mode) = variant.modes.first().copied() else {
        return Err(Error::Config(format!("{}: no durability mode", variant.name)));
    };
    let spec = &variant.server;
    match spec.data_dir {
        Some(ref dir) if dir.exists() => {
            info!("Removing {}", dir.display());
            std::fs::remove_dir_all(dir)?;
        }
        Some(_) => {}
        None => warn!(
            "{}: no data_dir configured, existing data may mask lost writes",
            variant.name
        ),
    }
    let log_dir = config.log_dir(variant);
    let csv_dir = config.csv_dir(variant);
    std::fs::create_dir_all(&log_dir)?;
    std::fs::create_dir_all(&csv_dir)?;
    let args = mode.launch_args();
    let log: PathBuf = log_dir.join("integrity_server.log");

    free_port(spec.port, spec.kill_settle)?;
    let mut server = ServerHandle::start(&variant.name, spec, &args, &log, live)?;
    let mut admin = AdminClient::connect(spec.port)?;
    info!("Writing {} keys to {} ({})", keys, variant.name, mode);
    write_data(&mut admin, mode, keys)?;
    drop(admin);
    server.stop()?;

    let restart_log = log_dir.join("integrity_server_restart.log");
    let mut server = ServerHandle::start(&variant.name, spec, &args, &restart_log, live)?;
    let mut admin = AdminClient::connect(spec.port)?;
    let (correct, incorrect, counter_ok) = tally(keys, |k| admin.get(k))?;
    drop(admin);
    server.stop()?;

    let report = IntegrityReport {
        variant: variant.name.clone(),
        mode: mode.label().to_string(),
        keys,
        correct,
        incorrect,
        counter_ok,
    };
    info!(
        "{}: {} correct, {} incorrect keys, counter {}",
        variant.name,
        correct,
        incorrect,
        if counter_ok { "correct" } else { "incorrect" }
    );
    write_csv(&csv_dir.join(INTEGRITY_FILE), &[report.clone()])?;
    Ok(report)
}

/// Fails with [`Error::Integrity`] unless every key and the counter were recovered.
pub fn ensure_passed(report: &IntegrityReport) -> Result<()> {
    if report.passed() {
        return Ok(());
    }
    Err(Error::Integrity {
        incorrect: report.incorrect + usize::from(!report.counter_ok),
        total: report.keys + 1,
    })
}
