use async_trait::async_trait;

use super::error::SandboxError;
use super::logs::SharedLogRing;
use super::types::{PreviewSpec, ProjectFile, ProviderInfo, ProviderKind};

/// Result of one readiness probe against a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlProbe {
    /// The backend reported an endpoint. The readiness poller still
    /// decides whether the value is usable or a placeholder.
    Ready(String),
    NotReady,
}

/// Factory for preview sandboxes.
///
/// One provider instance per backend kind lives on the manager. Each call
/// to `create()` makes a new isolated environment. Orchestration (single
/// flight, readiness polling, TTL, eviction) stays out of the backends.
#[async_trait]
pub trait PreviewProvider: Send + Sync {
    /// Metadata about this provider (backend kind, URL visibility).
    fn info(&self) -> ProviderInfo;

    /// Create a new sandbox environment for the given project.
    ///
    /// `logs` is the preview's log ring; backends append install and
    /// server output to it so status reads and the SSE stream see it.
    async fn create(
        &self,
        spec: &PreviewSpec,
        logs: SharedLogRing,
    ) -> Result<Box<dyn PreviewHandle>, SandboxError>;
}

/// Handle to one provisioned sandbox environment.
///
/// The manager drives the sequence: `write_files`, `install_dependencies`,
/// `start_server`, then hands the handle to the readiness poller.
#[async_trait]
pub trait PreviewHandle: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ProviderKind;

    /// Write the generated project files into the environment.
    async fn write_files(&self, files: &[ProjectFile]) -> Result<(), SandboxError>;

    /// Install project dependencies. Cloud backends fold the install into
    /// `start_server`'s single pipeline and return Ok here.
    async fn install_dependencies(&self) -> Result<(), SandboxError>;

    /// Launch the dev server. Returns once the server is starting, not
    /// once it is ready; readiness is observed via `preview_url`.
    async fn start_server(&self) -> Result<(), SandboxError>;

    /// One non-blocking readiness probe. The poller owns repetition.
    async fn preview_url(&self) -> Result<UrlProbe, SandboxError>;

    /// Tear the environment down. Idempotent: a second call, or a
    /// not-found from the provider, is success.
    async fn destroy(&self) -> Result<(), SandboxError>;
}
