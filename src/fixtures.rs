//! Stand-ins for the external binaries, mostly shell scripts written into scratch directories.

use crate::config::{LoadSpec, Readiness, ServerSpec, TraceSpec, TracerKind};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{Builder, TempDir};

pub fn scratch() -> TempDir {
    Builder::new().prefix("persistbench").tempdir().unwrap()
}

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A server that prints the ready marker and then idles until terminated.
pub fn marker_server(dir: &Path) -> ServerSpec {
    let exe = script(
        dir,
        "server.sh",
        "echo \"booting with $@\"\necho \"* Ready to accept connections tcp\"\nexec sleep 30",
    );
    ServerSpec {
        executable: exe,
        config: "redis.conf".to_string(),
        dir: dir.to_path_buf(),
        port: 0,
        readiness: Readiness::Marker("Ready to accept connections".to_string()),
        startup_timeout: Duration::from_secs(10),
        kill_settle: Duration::ZERO,
        data_dir: None,
    }
}

pub const PERFORMANCE_CSV: &str = r#""test","rps","avg_latency_ms","min_latency_ms","p50_latency_ms","p95_latency_ms","p99_latency_ms","max_latency_ms"
"SET","90000.00","0.300","0.088","0.287","0.439","0.583","1.175"
"LPUSH","95000.00","0.287","0.080","0.279","0.407","0.535","0.975""#;

/// A load generator that records its arguments and prints a fixed CSV report when asked to.
pub fn load_generator(dir: &Path) -> LoadSpec {
    let args = dir.join("driver-args.txt");
    let body = format!(
        "echo \"$@\" > {}\nsleep 0.2\n\
for a in \"$@\"; do\n  if [ \"$a\" = \"--csv\" ]; then\n    cat <<'EOF'\n{}\nEOF\n  fi\ndone",
        args.display(),
        PERFORMANCE_CSV
    );
    LoadSpec {
        executable: script(dir, "benchmark.sh", &body),
        clients: 50,
        operations: "set,lpush".to_string(),
    }
}

/// A tracer script that writes its two CSV outputs once interrupted.
pub fn tracer_script(dir: &Path) -> TraceSpec {
    let body = "trap '\
printf \"syscall,count\\nwrite,120\\nfdatasync,40\\nio_uring_enter,0\\n\" > \"$2\"; \
printf \"syscall,time\\nwrite,0.012\\nfdatasync,0.2\\nio_uring_enter,0\\n\" > \"$3\"; \
echo done > \"$4\"; exit 0' INT\n\
while true; do sleep 0.05; done";
    TraceSpec {
        kind: TracerKind::Script(script(dir, "tracer.sh", body)),
        sudo: false,
        syscalls: vec![
            "write".to_string(),
            "fdatasync".to_string(),
            "io_uring_enter".to_string(),
        ],
        settle: Duration::from_millis(100),
    }
}

/// A stand-in for the server's administrative protocol.
///
/// Keeps `CONFIG SET` values for `CONFIG GET` and reports a log rewrite in progress for the first
/// `busy` `INFO` requests. Anything else is answered with `+OK`.
pub struct RespServer {
    pub port: u16,
    state: Arc<Mutex<RespState>>,
}

#[derive(Default)]
struct RespState {
    config: HashMap<String, String>,
    info_polls: usize,
}

impl RespServer {
    pub fn start(busy: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(RespState::default()));
        let shared = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };
                let shared = shared.clone();
                std::thread::spawn(move || serve(stream, busy, &shared));
            }
        });
        Self { port, state }
    }

    pub fn config(&self, key: &str) -> Option<String> {
        self.state.lock().config.get(key).cloned()
    }

    pub fn info_polls(&self) -> usize {
        self.state.lock().info_polls
    }
}

fn bulk(s: &str) -> String {
    format!("${}\r\n{}\r\n", s.len(), s)
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let n: usize = line.trim().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len: usize = line.trim().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).ok()?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).ok()?);
    }
    Some(args)
}

fn serve(stream: TcpStream, busy: usize, state: &Mutex<RespState>) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    while let Some(args) = read_command(&mut reader) {
        let name = args.first().map(|a| a.to_uppercase()).unwrap_or_default();
        let sub = args.get(1).map(|a| a.to_uppercase()).unwrap_or_default();
        let mut state = state.lock();
        let reply = match (name.as_str(), sub.as_str()) {
            ("CONFIG", "SET") if args.len() == 4 => {
                state.config.insert(args[2].clone(), args[3].clone());
                "+OK\r\n".to_string()
            }
            ("CONFIG", "GET") if args.len() == 3 => {
                let value = state.config.get(&args[2]).cloned().unwrap_or_default();
                format!("*2\r\n{}{}", bulk(&args[2]), bulk(&value))
            }
            ("INFO", _) => {
                state.info_polls += 1;
                let rewriting = usize::from(state.info_polls <= busy);
                bulk(&format!(
                    "# Persistence\r\nrdb_bgsave_in_progress:0\r\naof_rewrite_in_progress:{}\r\n",
                    rewriting
                ))
            }
            _ => "+OK\r\n".to_string(),
        };
        drop(state);
        if writer.write_all(reply.as_bytes()).is_err() {
            break;
        }
    }
}
