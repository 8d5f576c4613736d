use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sandbox::deps::DependencyCache;
use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::ports::PortLedger;
use crate::sandbox::local_host::process_runner::ProcessRunner;
use crate::sandbox::logs::SharedLogRing;
use crate::sandbox::provider::{PreviewHandle, PreviewProvider, UrlProbe};
use crate::sandbox::types::{
    resolve_project_path, LocalConfig, PreviewSpec, ProjectFile, ProviderInfo, ProviderKind,
};

/// Local preview backend: one workspace directory and one supervised dev
/// server process per preview. Processes run as the current user with a
/// filtered env. NOT a security boundary — for trusted workloads only.
pub struct LocalProvider {
    config: LocalConfig,
    ports: Arc<PortLedger>,
    deps: Arc<DependencyCache>,
}

impl LocalProvider {
    pub fn new(config: LocalConfig, deps: Arc<DependencyCache>) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create previews root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        let ports = Arc::new(PortLedger::new(config.port_base, config.port_range));
        Ok(Self {
            config,
            ports,
            deps,
        })
    }
}

#[async_trait]
impl PreviewProvider for LocalProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::Local,
            public_urls: false,
        }
    }

    async fn create(
        &self,
        spec: &PreviewSpec,
        logs: SharedLogRing,
    ) -> Result<Box<dyn PreviewHandle>, SandboxError> {
        let short = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let id = format!("local-{}-{short}", spec.project_id);
        let workspace = self.config.root_dir.join(format!("{}-{short}", spec.project_id));

        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create workspace {}: {e}",
                workspace.display()
            ))
        })?;

        let port = self.ports.claim(self.config.kill_stray_listeners).await?;

        tracing::info!(
            preview_id = %id,
            workspace = %workspace.display(),
            port,
            "provisioned local preview workspace"
        );
        logs.lock()
            .await
            .push_line(format!("local workspace ready on port {port}"));

        Ok(Box::new(LocalHandle {
            id,
            workspace,
            port,
            config: self.config.clone(),
            ports: self.ports.clone(),
            deps: self.deps.clone(),
            logs,
            runner: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct LocalHandle {
    id: String,
    workspace: PathBuf,
    port: u16,
    config: LocalConfig,
    ports: Arc<PortLedger>,
    deps: Arc<DependencyCache>,
    logs: SharedLogRing,
    runner: Mutex<Option<ProcessRunner>>,
    destroyed: AtomicBool,
}

impl LocalHandle {
    fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[async_trait]
impl PreviewHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn write_files(&self, files: &[ProjectFile]) -> Result<(), SandboxError> {
        for file in files {
            let path = resolve_project_path(&self.workspace, &file.path)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.content).await?;
        }
        tracing::debug!(preview_id = %self.id, count = files.len(), "wrote project files");
        Ok(())
    }

    async fn install_dependencies(&self) -> Result<(), SandboxError> {
        self.logs
            .lock()
            .await
            .push_line("hydrating dependencies from base cache".to_string());
        self.deps.hydrate_into(&self.workspace).await?;
        self.logs
            .lock()
            .await
            .push_line("dependencies ready".to_string());
        Ok(())
    }

    async fn start_server(&self) -> Result<(), SandboxError> {
        let command: Vec<String> = self
            .config
            .dev_server_command
            .iter()
            .map(|arg| arg.replace("{port}", &self.port.to_string()))
            .collect();

        tracing::info!(preview_id = %self.id, command = ?command, "starting dev server");
        let runner = ProcessRunner::spawn(
            &command,
            &self.workspace,
            &self.config.inherit_env_allowlist,
            self.port,
            self.logs.clone(),
        )?;
        *self.runner.lock().await = Some(runner);
        Ok(())
    }

    async fn preview_url(&self) -> Result<UrlProbe, SandboxError> {
        let runner = self.runner.lock().await;
        let Some(runner) = runner.as_ref() else {
            return Ok(UrlProbe::NotReady);
        };

        if let Some(code) = runner.exit_code().await {
            return Err(SandboxError::Exec(format!(
                "dev server exited with code {code}"
            )));
        }

        if runner.marker_seen() {
            return Ok(UrlProbe::Ready(self.endpoint()));
        }

        // Heuristic: some dev-server tooling never prints a reliable ready
        // marker, so after this long a live process is assumed reachable.
        // A wrong guess costs one blank preview load, not a stuck UI.
        if runner.started_at().elapsed() >= self.config.assume_ready_after {
            return Ok(UrlProbe::Ready(self.endpoint()));
        }

        Ok(UrlProbe::NotReady)
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(preview_id = %self.id, "destroying local preview");
        if let Some(runner) = self.runner.lock().await.take() {
            runner.kill().await;
        }
        self.ports.release(self.port).await;

        if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    preview_id = %self.id,
                    workspace = %self.workspace.display(),
                    error = %e,
                    "failed to remove preview workspace"
                );
            }
        }
        Ok(())
    }
}
