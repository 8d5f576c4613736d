//! E2B-style cloud sandbox backend.
//!
//! REST surface: POST /sandboxes, POST /sandboxes/{id}/files,
//! POST /sandboxes/{id}/commands, GET /sandboxes/{id}/host?port=N,
//! DELETE /sandboxes/{id}. Sandboxes boot from a template that already
//! carries the base dependency set, so the install step is folded into
//! the backgrounded start pipeline.

use base64::Engine;
use serde::{Deserialize, Serialize};

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::logs::SharedLogRing;
use crate::sandbox::provider::{PreviewHandle, PreviewProvider, UrlProbe};
use crate::sandbox::types::{E2bConfig, PreviewSpec, ProjectFile, ProviderInfo, ProviderKind};

/// Remote project root inside the sandbox template.
const REMOTE_ROOT: &str = "/home/user/app";

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest {
    template_id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    sandbox_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteFileRequest {
    path: String,
    content_base64: String,
    create_parents: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandRequest {
    command: String,
    background: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct HostResponse {
    #[serde(default)]
    url: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct E2bClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl E2bClient {
    fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, SandboxError> {
        let url = format!("{}/sandboxes", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Provision(format!("e2b create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!(
                "e2b create returned {status}: {body}"
            )));
        }

        resp.json::<CreateSandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse e2b create response: {e}")))
    }

    async fn write_file(&self, sandbox_id: &str, req: &WriteFileRequest) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{sandbox_id}/files", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("e2b file write failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "e2b file write returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        req: &RunCommandRequest,
    ) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{sandbox_id}/commands", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Exec(format!("e2b command failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Exec(format!(
                "e2b command returned {status}: {body}"
            )));
        }
        Ok(())
    }

    /// One tunnel probe. The public URL is provisioned asynchronously, so
    /// 404 and absent values mean "not yet", never failure.
    async fn host_url(&self, sandbox_id: &str, port: u16) -> Result<Option<String>, SandboxError> {
        let url = format!("{}/sandboxes/{sandbox_id}/host?port={port}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("e2b host probe failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "e2b host probe returned {status}: {body}"
            )));
        }

        let host = resp
            .json::<HostResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse e2b host response: {e}")))?;
        Ok(host.url)
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{sandbox_id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("e2b delete failed: {e}")))?;

        match resp.status().as_u16() {
            // Already gone or mid-teardown — success for an idempotent destroy
            404 | 409 => {
                tracing::debug!(sandbox_id, "e2b sandbox already gone");
                Ok(())
            }
            s if (200..300).contains(&s) => Ok(()),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::Backend(format!(
                    "e2b delete returned {s}: {body}"
                )))
            }
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct E2bProvider {
    config: E2bConfig,
    client: E2bClient,
}

impl E2bProvider {
    pub fn new(config: E2bConfig) -> Result<Self, SandboxError> {
        if config.api_key.trim().is_empty() {
            return Err(SandboxError::Provision("e2b api key is not set".into()));
        }
        let client = E2bClient::new(config.api_base_url.clone(), config.api_key.clone());
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PreviewProvider for E2bProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::E2b,
            public_urls: true,
        }
    }

    async fn create(
        &self,
        spec: &PreviewSpec,
        logs: SharedLogRing,
    ) -> Result<Box<dyn PreviewHandle>, SandboxError> {
        let name = qualified_name(&spec.project_id);
        tracing::info!(
            project_id = %spec.project_id,
            template = %self.config.template_id,
            name = %name,
            "creating e2b sandbox"
        );

        let created = self
            .client
            .create_sandbox(&CreateSandboxRequest {
                template_id: self.config.template_id.clone(),
                name,
            })
            .await?;

        logs.lock()
            .await
            .push_line(format!("cloud sandbox {} created", created.sandbox_id));

        Ok(Box::new(E2bHandle {
            sandbox_id: created.sandbox_id,
            port: self.config.dev_server_port,
            client: self.client.clone(),
            logs,
        }))
    }
}

struct E2bHandle {
    sandbox_id: String,
    port: u16,
    client: E2bClient,
    logs: SharedLogRing,
}

#[async_trait]
impl PreviewHandle for E2bHandle {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::E2b
    }

    async fn write_files(&self, files: &[ProjectFile]) -> Result<(), SandboxError> {
        for file in files {
            let req = WriteFileRequest {
                path: remote_path(&file.path)?,
                content_base64: base64::engine::general_purpose::STANDARD
                    .encode(file.content.as_bytes()),
                create_parents: true,
            };
            self.client.write_file(&self.sandbox_id, &req).await?;
        }
        tracing::debug!(sandbox_id = %self.sandbox_id, count = files.len(), "uploaded project files");
        Ok(())
    }

    async fn install_dependencies(&self) -> Result<(), SandboxError> {
        // The template image carries the base dependency set; the project
        // install runs inside the start pipeline instead of a second
        // awaited round trip.
        self.logs
            .lock()
            .await
            .push_line("dependencies served from sandbox template".to_string());
        Ok(())
    }

    async fn start_server(&self) -> Result<(), SandboxError> {
        let command = format!(
            "cd {REMOTE_ROOT} && npm install --prefer-offline && npm run dev -- --port {} --host 0.0.0.0",
            self.port
        );
        self.client
            .run_command(
                &self.sandbox_id,
                &RunCommandRequest {
                    command,
                    background: true,
                },
            )
            .await?;
        self.logs
            .lock()
            .await
            .push_line("install and dev server pipeline started".to_string());
        Ok(())
    }

    async fn preview_url(&self) -> Result<UrlProbe, SandboxError> {
        match self.client.host_url(&self.sandbox_id, self.port).await? {
            Some(url) => Ok(UrlProbe::Ready(url)),
            None => Ok(UrlProbe::NotReady),
        }
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        tracing::info!(sandbox_id = %self.sandbox_id, "destroying e2b sandbox");
        self.client.delete_sandbox(&self.sandbox_id).await
    }
}

/// Uniqueness-qualified sandbox name so a retry after a failed create
/// never collides with the half-born previous attempt.
fn qualified_name(project_id: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("pv-{project_id}-{short}")
}

fn remote_path(rel: &str) -> Result<String, SandboxError> {
    let rel = rel.trim();
    if rel.is_empty() || rel.starts_with('/') || rel.split('/').any(|seg| seg == "..") {
        return Err(SandboxError::InvalidPath(rel.to_string()));
    }
    Ok(format!("{REMOTE_ROOT}/{rel}"))
}
