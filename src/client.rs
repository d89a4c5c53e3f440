//! An administrative connection to the server under test.
//!
//! The harness never speaks the data protocol itself; the load generator does. This client only
//! probes liveness and reads or changes configuration parameters on a live server.

use crate::error::{Error, Result};
use crate::record::DurabilityMode;
use log::debug;
use redis::InfoDict;
use std::time::{Duration, Instant};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether `info` reports a snapshot or an append-only log rewrite as running or scheduled.
fn persisting(info: &InfoDict) -> bool {
    [
        "rdb_bgsave_in_progress",
        "aof_rewrite_in_progress",
        "aof_rewrite_scheduled",
    ]
    .iter()
    .any(|key| info.get::<i64>(key).unwrap_or(0) != 0)
}

pub struct AdminClient {
    port: u16,
    conn: redis::Connection,
}

fn url(port: u16) -> String {
    format!("redis://127.0.0.1:{}/", port)
}

impl AdminClient {
    pub fn connect(port: u16) -> Result<Self> {
        let client = redis::Client::open(url(port))?;
        let conn = client.get_connection()?;
        Ok(Self { port, conn })
    }

    /// Returns whether a server on `port` answers a ping within `timeout`.
    pub fn probe(port: u16, timeout: Duration) -> bool {
        let Ok(client) = redis::Client::open(url(port)) else {
            return false;
        };
        match client.get_connection_with_timeout(timeout) {
            Ok(mut conn) => redis::cmd("PING").query::<String>(&mut conn).is_ok(),
            Err(_) => false,
        }
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        debug!("CONFIG SET {} \"{}\" on port {}", key, value, self.port);
        redis::cmd("CONFIG")
            .arg("SET")
            .arg(key)
            .arg(value)
            .query::<()>(&mut self.conn)?;
        Ok(())
    }

    pub fn get_config(&mut self, key: &str) -> Result<String> {
        // the reply is a flat list of (name, value) pairs
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(key)
            .query(&mut self.conn)?;
        reply
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0] == key)
            .map(|pair| pair[1].clone())
            .ok_or_else(|| Error::Config(format!("server has no parameter {}", key)))
    }

    /// Switch the live server to `mode` and read the settings back.
    pub fn apply_mode(&mut self, mode: DurabilityMode) -> Result<()> {
        for (key, value) in mode.settings() {
            self.set_config(key, value)?;
            let actual = self.get_config(key)?;
            if actual != value {
                return Err(Error::Config(format!(
                    "server kept {} = \"{}\" after setting \"{}\"",
                    key, actual, value
                )));
            }
        }
        Ok(())
    }

    /// Poll the server until no snapshot or log rewrite is running, for at most `timeout`.
    ///
    /// Turning the append-only log on starts a rewrite in the background, which would otherwise
    /// overlap the first run measured in the new mode.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let info: InfoDict = redis::cmd("INFO").arg("persistence").query(&mut self.conn)?;
            if !persisting(&info) {
                debug!("Persistence idle on port {} after {:?}", self.port, start.elapsed());
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::PersistenceBusy {
                    port: self.port,
                    waited: timeout,
                });
            }
            std::thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        redis::cmd("SET").arg(key).arg(value).query::<()>(&mut self.conn)?;
        Ok(())
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(redis::cmd("GET").arg(key).query(&mut self.conn)?)
    }

    pub fn incr(&mut self, key: &str) -> Result<i64> {
        Ok(redis::cmd("INCR").arg(key).query(&mut self.conn)?)
    }

    /// Ask the server to compact its append-only log in the background.
    pub fn rewrite_log(&mut self) -> Result<()> {
        redis::cmd("BGREWRITEAOF").query::<String>(&mut self.conn)?;
        Ok(())
    }
}
