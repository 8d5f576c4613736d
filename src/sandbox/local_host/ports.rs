use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::sandbox::error::SandboxError;

/// In-process port accounting for local dev servers.
///
/// `claim` scans linearly from the base port, skipping ports already
/// claimed by this process and ports something else is bound to at the
/// OS level. Callers must `release` on teardown.
pub struct PortLedger {
    base: u16,
    range: u16,
    claimed: Mutex<HashSet<u16>>,
}

impl PortLedger {
    pub fn new(base: u16, range: u16) -> Self {
        Self {
            base,
            range,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the lowest free port in the pool.
    ///
    /// With `kill_stray` set, a port that fails the OS bind probe gets one
    /// best-effort `fuser -k` against whatever is holding it, then one
    /// more probe. Killing is never fatal; an unprobeable port is skipped.
    pub async fn claim(&self, kill_stray: bool) -> Result<u16, SandboxError> {
        let mut claimed = self.claimed.lock().await;
        for port in self.base..self.base.saturating_add(self.range) {
            if claimed.contains(&port) {
                continue;
            }
            if os_port_free(port).await {
                claimed.insert(port);
                return Ok(port);
            }
            if kill_stray {
                kill_stray_listener(port).await;
                if os_port_free(port).await {
                    claimed.insert(port);
                    return Ok(port);
                }
            }
            tracing::debug!(port, "port busy at OS level, skipping");
        }
        Err(SandboxError::Provision(format!(
            "no free port in {}..{}",
            self.base,
            self.base.saturating_add(self.range)
        )))
    }

    pub async fn release(&self, port: u16) {
        self.claimed.lock().await.remove(&port);
    }

    pub async fn claimed_count(&self) -> usize {
        self.claimed.lock().await.len()
    }
}

/// Probe by binding. The listener is dropped immediately; the dev server
/// re-binds the port itself moments later.
async fn os_port_free(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_ok()
}

/// Best-effort kill of whatever holds `port`. No-op when `fuser` is not
/// on PATH or the kill fails; the follow-up bind probe is the real gate.
async fn kill_stray_listener(port: u16) {
    if which("fuser").is_none() {
        tracing::debug!(port, "fuser not available, cannot free stray listener");
        return;
    }
    tracing::warn!(port, "port busy, killing stray listener");
    match tokio::process::Command::new("fuser")
        .arg("-k")
        .arg(format!("{port}/tcp"))
        .output()
        .await
    {
        Ok(out) if out.status.success() => {
            // fuser delivers SIGKILL; give the OS a beat to release the port
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Ok(_) => tracing::debug!(port, "fuser found nothing to kill"),
        Err(e) => tracing::warn!(port, error = %e, "fuser invocation failed"),
    }
}

fn which(bin: &str) -> Option<std::path::PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}
