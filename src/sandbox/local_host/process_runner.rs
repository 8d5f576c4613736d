use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use crate::sandbox::error::SandboxError;
use crate::sandbox::logs::SharedLogRing;

/// Stdout fragments that mean the dev server is accepting connections.
/// Covers vite, next, CRA-style tooling. Matching is case-insensitive.
pub const READY_MARKERS: &[&str] = &[
    "local:",
    "ready in",
    "compiled successfully",
    "listening on",
    "server running",
];

/// A supervised local dev-server process.
///
/// Stdout and stderr are pumped line-by-line into the preview's log ring.
/// The stdout pump also scans for readiness markers; not every dev server
/// prints one, so the local backend pairs `marker_seen` with an
/// assume-ready deadline.
pub struct ProcessRunner {
    child: Mutex<Option<tokio::process::Child>>,
    marker_seen: Arc<AtomicBool>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    started_at: Instant,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessRunner {
    /// Spawn `command` in `cwd` with a filtered environment.
    ///
    /// Only allowlisted host vars are inherited; `PORT` is always set to
    /// the claimed port for tooling that reads it instead of flags.
    pub fn spawn(
        command: &[String],
        cwd: &std::path::Path,
        env_allowlist: &[String],
        port: u16,
        logs: SharedLogRing,
    ) -> Result<Self, SandboxError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SandboxError::Exec("empty dev server command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(cwd);
        cmd.env_clear();
        for key in env_allowlist {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("PORT", port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("failed to spawn dev server: {e}")))?;

        let marker_seen = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(StdMutex::new(None));
        let mut pumps = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            let marker_seen = marker_seen.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stdout).lines());
                while let Some(Ok(line)) = lines.next().await {
                    let lower = line.to_ascii_lowercase();
                    if READY_MARKERS.iter().any(|m| lower.contains(m)) {
                        marker_seen.store(true, Ordering::SeqCst);
                    }
                    logs.lock().await.push_line(line);
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    logs.lock().await.push_line(format!("[stderr] {line}"));
                }
            }));
        }

        Ok(Self {
            child: Mutex::new(Some(child)),
            marker_seen,
            exit_code,
            started_at: Instant::now(),
            pumps,
        })
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Exit code if the process has terminated. Non-blocking; also
    /// records the code so later calls keep reporting it.
    pub async fn exit_code(&self) -> Option<i32> {
        if let Some(code) = *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()) {
            return Some(code);
        }
        let mut child = self.child.lock().await;
        if let Some(c) = child.as_mut() {
            if let Ok(Some(status)) = c.try_wait() {
                let code = status.code().unwrap_or(-1);
                *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
                return Some(code);
            }
        }
        None
    }

    /// Kill the process and stop the pumps. Idempotent.
    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "dev server already gone on kill");
            }
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
