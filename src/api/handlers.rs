use axum::Json;
use axum::extract::{Path, Query, State};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::sandbox::SandboxError;
use crate::sandbox::types::PreviewSpec;

use super::AppState;

pub type ApiError = (StatusCode, Json<Value>);

/// Map sandbox errors onto HTTP statuses. Provider and IO failures are
/// opaque 500s; the details stay in the logs.
pub(crate) fn error_response(err: SandboxError) -> ApiError {
    let status = match &err {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::InvalidPath(_) | SandboxError::Unsupported(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "preview request failed");
    } else {
        tracing::warn!(error = %err, "preview request rejected");
    }
    (status, Json(json!({ "error": err.to_string() })))
}

/// POST /api/previews — create (or replace) the preview for a project.
///
/// Concurrent requests for the same project coalesce onto one
/// provisioning attempt; this does not return until that attempt
/// resolves either way.
pub(crate) async fn create_preview(
    State(state): State<AppState>,
    Json(spec): Json<PreviewSpec>,
) -> Result<Json<Value>, ApiError> {
    if spec.project_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "project_id must not be empty" })),
        ));
    }
    let snapshot = state.manager.create(spec).await.map_err(error_response)?;
    Ok(Json(json!(snapshot)))
}

/// GET /api/previews — snapshots of every live preview.
pub(crate) async fn list_previews(State(state): State<AppState>) -> Json<Value> {
    let previews = state.manager.list().await;
    Json(json!({ "previews": previews }))
}

/// GET /api/previews/{project_id} — snapshot plus recent log tail.
pub(crate) async fn preview_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state
        .manager
        .status(&project_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(view)))
}

/// DELETE /api/previews/{project_id} — tear the preview down.
/// Destroying an absent preview succeeds with `destroyed: false`.
pub(crate) async fn destroy_preview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = state
        .manager
        .destroy(&project_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "destroyed": existed })))
}

#[derive(Deserialize)]
pub(crate) struct ExtendBody {
    pub minutes: i64,
}

/// POST /api/previews/{project_id}/extend — push expiry forward.
pub(crate) async fn extend_preview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<ExtendBody>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .manager
        .extend_timeout(&project_id, body.minutes)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(snapshot)))
}

#[derive(Deserialize)]
pub(crate) struct LogsQuery {
    pub limit: Option<usize>,
}

/// GET /api/previews/{project_id}/logs — recent log lines, oldest first.
pub(crate) async fn preview_logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(ring) = state.manager.log_ring(&project_id).await else {
        return Err(error_response(SandboxError::NotFound(project_id)));
    };
    let lines = ring.lock().await.tail(query.limit.unwrap_or(100).min(1000));
    Ok(Json(json!({ "lines": lines })))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sandbox::logs::SharedLogRing;
    use crate::sandbox::manager::{ManagerConfig, PreviewManager};
    use crate::sandbox::provider::{PreviewHandle, PreviewProvider, UrlProbe};
    use crate::sandbox::types::{ProjectFile, ProviderInfo, ProviderKind, Tier};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) struct StubProvider;

    #[async_trait]
    impl PreviewProvider for StubProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                kind: ProviderKind::Local,
                public_urls: false,
            }
        }

        async fn create(
            &self,
            spec: &PreviewSpec,
            _logs: SharedLogRing,
        ) -> Result<Box<dyn PreviewHandle>, SandboxError> {
            Ok(Box::new(StubHandle {
                id: format!("stub-{}", spec.project_id),
            }))
        }
    }

    pub(crate) struct StubHandle {
        id: String,
    }

    #[async_trait]
    impl PreviewHandle for StubHandle {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }
        async fn write_files(&self, _files: &[ProjectFile]) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn install_dependencies(&self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn start_server(&self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn preview_url(&self) -> Result<UrlProbe, SandboxError> {
            Ok(UrlProbe::NotReady)
        }
        async fn destroy(&self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    pub(crate) fn test_state() -> AppState {
        let config = ManagerConfig {
            sweep_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(3600),
            poll_max_attempts: 1,
            ..ManagerConfig::default()
        };
        AppState {
            manager: PreviewManager::new(Arc::new(StubProvider), config),
        }
    }

    pub(crate) fn spec(project_id: &str) -> PreviewSpec {
        PreviewSpec {
            project_id: project_id.into(),
            owner_id: "owner-1".into(),
            tier: Tier::Free,
            files: vec![ProjectFile {
                path: "index.html".into(),
                content: "<h1>hi</h1>".into(),
            }],
        }
    }
}
