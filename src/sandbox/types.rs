use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SandboxError;

// ── Preview identity ────────────────────────────────────────────────

pub type PreviewId = String;

// ── Provider kind ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    E2b,
    Modal,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::E2b => "e2b",
            ProviderKind::Modal => "modal",
        }
    }
}

// ── Provider info ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    /// Whether preview URLs are reachable from outside the host.
    /// When true, a bare-localhost URL from the backend is a placeholder,
    /// not a usable endpoint.
    pub public_urls: bool,
}

// ── Preview spec (input to create) ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

/// One generated source file. `path` is relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
}

/// Everything needed to spin up a preview for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSpec {
    pub project_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub tier: Tier,
    pub files: Vec<ProjectFile>,
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Creating,
    Running,
    Error,
    Stopped,
}

impl PreviewStatus {
    /// Forward-only transitions: `creating` resolves to `running` or
    /// `error`; any non-stopped state may move to `stopped` on destroy.
    pub fn can_become(self, next: PreviewStatus) -> bool {
        use PreviewStatus::*;
        match (self, next) {
            (Creating, Running) | (Creating, Error) => true,
            (Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewStatus::Creating => "creating",
            PreviewStatus::Running => "running",
            PreviewStatus::Error => "error",
            PreviewStatus::Stopped => "stopped",
        }
    }
}

// ── Snapshot (what status reads return) ─────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PreviewSnapshot {
    pub id: PreviewId,
    pub project_id: String,
    pub owner_id: String,
    pub provider: ProviderKind,
    pub status: PreviewStatus,
    pub preview_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

// ── Project file paths ──────────────────────────────────────────────

/// Resolve a project-relative file path under `root`.
///
/// Rejects absolute paths and any `..` component so generated files can
/// never land outside the sandbox workspace. `.` components are dropped.
pub fn resolve_project_path(root: &Path, rel: &str) -> Result<PathBuf, SandboxError> {
    if rel.trim().is_empty() {
        return Err(SandboxError::InvalidPath("(empty)".into()));
    }
    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPath(rel.to_string()));
            }
        }
    }
    Ok(out)
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Parent directory for per-project workspaces.
    pub root_dir: PathBuf,
    /// First port to try for dev servers.
    pub port_base: u16,
    /// Number of ports in the pool, starting at `port_base`.
    pub port_range: u16,
    /// Kill stray listeners on a wanted port before giving up on it.
    pub kill_stray_listeners: bool,
    /// Environment variables to inherit from the host (allowlist).
    pub inherit_env_allowlist: Vec<String>,
    /// Command that starts the dev server; `{port}` is substituted.
    pub dev_server_command: Vec<String>,
    /// Assume the server is up after this long without a ready marker.
    pub assume_ready_after: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(""), // must be set by caller
            port_base: 3100,
            port_range: 100,
            kill_stray_listeners: true,
            inherit_env_allowlist: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "TERM".into(),
            ],
            dev_server_command: vec![
                "npm".into(),
                "run".into(),
                "dev".into(),
                "--".into(),
                "--port".into(),
                "{port}".into(),
                "--host".into(),
                "127.0.0.1".into(),
            ],
            assume_ready_after: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct E2bConfig {
    pub api_base_url: String,
    pub api_key: String,
    /// Template with node + npm preinstalled; previews boot from it.
    pub template_id: String,
    /// Port the dev server listens on inside the sandbox.
    pub dev_server_port: u16,
}

#[derive(Debug, Clone)]
pub struct ModalConfig {
    pub api_base_url: String,
    pub api_token: String,
    /// Container image with node + npm preinstalled.
    pub image: String,
    /// Port the dev server listens on inside the sandbox.
    pub dev_server_port: u16,
}

// ── Runtime config selector ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProviderRuntimeConfig {
    Local(LocalConfig),
    E2b(E2bConfig),
    Modal(ModalConfig),
}

// ── Tests ───────────────────────────────────────────────────────────
