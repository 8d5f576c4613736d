pub mod backends;
pub mod deps;
pub mod error;
pub mod instance;
pub mod local_host;
pub mod logs;
pub mod manager;
pub mod provider;
pub mod readiness;
pub mod registry;
pub mod types;

pub use error::SandboxError;
pub use manager::{ManagerConfig, PreviewManager, StatusView};
pub use provider::{PreviewHandle, PreviewProvider};
pub use types::*;

use std::sync::Arc;

use backends::e2b::E2bProvider;
use backends::local::LocalProvider;
use backends::modal::ModalProvider;
use deps::DependencyCache;

/// Build a preview provider from runtime config.
pub fn build_provider(
    config: ProviderRuntimeConfig,
    deps: Arc<DependencyCache>,
) -> Result<Arc<dyn PreviewProvider>, SandboxError> {
    match config {
        ProviderRuntimeConfig::Local(c) => {
            tracing::info!(
                root_dir = %c.root_dir.display(),
                port_base = c.port_base,
                "initializing local preview provider"
            );
            Ok(Arc::new(LocalProvider::new(c, deps)?))
        }
        ProviderRuntimeConfig::E2b(c) => {
            tracing::info!(
                api_url = %c.api_base_url,
                template = %c.template_id,
                "initializing e2b preview provider"
            );
            Ok(Arc::new(E2bProvider::new(c)?))
        }
        ProviderRuntimeConfig::Modal(c) => {
            tracing::info!(
                api_url = %c.api_base_url,
                image = %c.image,
                "initializing modal preview provider"
            );
            Ok(Arc::new(ModalProvider::new(c)?))
        }
    }
}
