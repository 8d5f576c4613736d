//! Modal-style cloud container backend.
//!
//! REST surface: POST /containers, PUT /containers/{id}/files?path=...,
//! POST /containers/{id}/exec, GET /containers/{id}/tunnels/{port},
//! DELETE /containers/{id}. File uploads are raw-body PUTs, one per file,
//! with the target path percent-encoded into the query string.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::logs::SharedLogRing;
use crate::sandbox::provider::{PreviewHandle, PreviewProvider, UrlProbe};
use crate::sandbox::types::{ModalConfig, PreviewSpec, ProjectFile, ProviderInfo, ProviderKind};

/// Remote project root inside the container image.
const REMOTE_ROOT: &str = "/workspace/app";

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct CreateContainerRequest {
    image: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateContainerResponse {
    container_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct ExecRequest {
    command: String,
    detach: bool,
}

/// Tunnel probe response. Providers surface placeholder values in `url`
/// while the tunnel provisions; the readiness poller filters those.
#[derive(Debug, Clone, Deserialize)]
struct TunnelResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ModalClient {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
}

impl ModalClient {
    fn new(base_url: String, api_token: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            client: reqwest::Client::new(),
        }
    }

    async fn create_container(
        &self,
        req: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, SandboxError> {
        let url = format!("{}/containers", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Provision(format!("modal create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!(
                "modal create returned {status}: {body}"
            )));
        }

        resp.json::<CreateContainerResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse modal create response: {e}")))
    }

    async fn put_file(
        &self,
        container_id: &str,
        remote_path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let url = format!(
            "{}/containers/{container_id}/files?path={}&create_parents=true",
            self.base_url,
            utf8_percent_encode(remote_path, NON_ALPHANUMERIC)
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_token)
            .body(content.to_string())
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("modal file write failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "modal file write returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn exec(&self, container_id: &str, req: &ExecRequest) -> Result<(), SandboxError> {
        let url = format!("{}/containers/{container_id}/exec", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Exec(format!("modal exec failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Exec(format!(
                "modal exec returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn tunnel(
        &self,
        container_id: &str,
        port: u16,
    ) -> Result<Option<String>, SandboxError> {
        let url = format!("{}/containers/{container_id}/tunnels/{port}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("modal tunnel probe failed: {e}")))?;

        // Tunnel not provisioned yet
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "modal tunnel probe returned {status}: {body}"
            )));
        }

        let tunnel = resp
            .json::<TunnelResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse modal tunnel response: {e}")))?;
        Ok(tunnel.url)
    }

    async fn delete_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let url = format!("{}/containers/{container_id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("modal delete failed: {e}")))?;

        match resp.status().as_u16() {
            // Already gone or mid-teardown — success for an idempotent destroy
            404 | 409 => {
                tracing::debug!(container_id, "modal container already gone");
                Ok(())
            }
            s if (200..300).contains(&s) => Ok(()),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(SandboxError::Backend(format!(
                    "modal delete returned {s}: {body}"
                )))
            }
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ModalProvider {
    config: ModalConfig,
    client: ModalClient,
}

impl ModalProvider {
    pub fn new(config: ModalConfig) -> Result<Self, SandboxError> {
        if config.api_token.trim().is_empty() {
            return Err(SandboxError::Provision("modal api token is not set".into()));
        }
        let client = ModalClient::new(config.api_base_url.clone(), config.api_token.clone());
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PreviewProvider for ModalProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::Modal,
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
            image = %self.config.image,
            name = %name,
            "creating modal container"
        );

        let created = self
            .client
            .create_container(&CreateContainerRequest {
                image: self.config.image.clone(),
                name,
            })
            .await?;

        logs.lock()
            .await
            .push_line(format!("cloud container {} created", created.container_id));

        Ok(Box::new(ModalHandle {
            container_id: created.container_id,
            port: self.config.dev_server_port,
            client: self.client.clone(),
            logs,
        }))
    }
}

struct ModalHandle {
    container_id: String,
    port: u16,
    client: ModalClient,
    logs: SharedLogRing,
}

#[async_trait]
impl PreviewHandle for ModalHandle {
    fn id(&self) -> &str {
        &self.container_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Modal
    }

    async fn write_files(&self, files: &[ProjectFile]) -> Result<(), SandboxError> {
        for file in files {
            let path = remote_path(&file.path)?;
            self.client
                .put_file(&self.container_id, &path, &file.content)
                .await?;
        }
        tracing::debug!(
            container_id = %self.container_id,
            count = files.len(),
            "uploaded project files"
        );
        Ok(())
    }

    async fn install_dependencies(&self) -> Result<(), SandboxError> {
        // The container image carries the base dependency set; the project
        // install runs inside the start pipeline.
        self.logs
            .lock()
            .await
            .push_line("dependencies served from container image".to_string());
        Ok(())
    }

    async fn start_server(&self) -> Result<(), SandboxError> {
        let command = format!(
            "cd {REMOTE_ROOT} && npm install --prefer-offline && npm run dev -- --port {} --host 0.0.0.0",
            self.port
        );
        self.client
            .exec(
                &self.container_id,
                &ExecRequest {
                    command,
                    detach: true,
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
        match self.client.tunnel(&self.container_id, self.port).await? {
            Some(url) => Ok(UrlProbe::Ready(url)),
            None => Ok(UrlProbe::NotReady),
        }
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        tracing::info!(container_id = %self.container_id, "destroying modal container");
        self.client.delete_container(&self.container_id).await
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_serializes_snake_case() {
        let req = CreateContainerRequest {
            image: "node:20-previewd".into(),
            name: "pv-proj-abc12345".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["image"], "node:20-previewd");
        assert_eq!(json["name"], "pv-proj-abc12345");
    }

    #[test]
    fn create_response_deserializes() {
        let resp: CreateContainerResponse =
            serde_json::from_str(r#"{"container_id":"ct-42"}"#).unwrap();
        assert_eq!(resp.container_id, "ct-42");
    }

    #[test]
    fn tunnel_response_variants() {
        let pending: TunnelResponse =
            serde_json::from_str(r#"{"status":"initializing"}"#).unwrap();
        assert!(pending.url.is_none());

        let placeholder: TunnelResponse =
            serde_json::from_str(r#"{"url":"initializing","status":"initializing"}"#).unwrap();
        assert_eq!(placeholder.url.as_deref(), Some("initializing"));

        let ready: TunnelResponse =
            serde_json::from_str(r#"{"url":"https://ct-42.modal.run","status":"ready"}"#).unwrap();
        assert_eq!(ready.url.as_deref(), Some("https://ct-42.modal.run"));
    }

    #[test]
    fn file_path_is_percent_encoded() {
        let encoded =
            utf8_percent_encode("/workspace/app/src/My File.tsx", NON_ALPHANUMERIC).to_string();
        assert!(encoded.contains("%2F"));
        assert!(encoded.contains("%20"));
        assert!(!encoded.contains(' '));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let c = ModalClient::new("https://api.example.dev/v1/".into(), "tok".into());
        assert_eq!(c.base_url, "https://api.example.dev/v1");
    }

    #[test]
    fn remote_path_rejects_escape() {
        assert!(remote_path("../up.txt").is_err());
        assert!(remote_path("/abs.txt").is_err());
        assert_eq!(remote_path("src/main.ts").unwrap(), "/workspace/app/src/main.ts");
    }

    #[test]
    fn provider_requires_token() {
        let err = ModalProvider::new(ModalConfig {
            api_base_url: "https://api.example.dev".into(),
            api_token: "".into(),
            image: "node:20".into(),
            dev_server_port: 3000,
        })
        .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn provider_info_is_public() {
        let p = ModalProvider::new(ModalConfig {
            api_base_url: "https://api.example.dev".into(),
            api_token: "tok".into(),
            image: "node:20".into(),
            dev_server_port: 3000,
        })
        .unwrap();
        let info = p.info();
        assert_eq!(info.kind, ProviderKind::Modal);
        assert!(info.public_urls);
    }
}
