use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::logs::{shared_ring, SharedLogRing};
use super::provider::PreviewHandle;
use super::types::{PreviewSnapshot, PreviewSpec, PreviewStatus, ProviderKind};

/// Live registry record for one preview.
///
/// Inserted with status `creating` before the provider call so concurrent
/// status reads see the creation in progress. `handle` is filled in once
/// provisioning returns; `poll_task` once the readiness poller is spawned.
pub struct PreviewInstance {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub provider: ProviderKind,
    pub status: PreviewStatus,
    pub preview_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub logs: SharedLogRing,
    pub handle: Option<Arc<dyn PreviewHandle>>,
    /// Readiness poll task; aborted when the preview is torn down.
    pub poll_task: Option<JoinHandle<()>>,
}

impl PreviewInstance {
    pub fn new(spec: &PreviewSpec, provider: ProviderKind, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(30));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: spec.project_id.clone(),
            owner_id: spec.owner_id.clone(),
            provider,
            status: PreviewStatus::Creating,
            preview_url: None,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            logs: shared_ring(),
            handle: None,
            poll_task: None,
        }
    }

    /// Apply a status transition if the state machine allows it.
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: PreviewStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                preview_id = %self.id,
                from = self.status.as_str(),
                to = next.as_str(),
                "ignoring backward status transition"
            );
            false
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        PreviewSnapshot {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            owner_id: self.owner_id.clone(),
            provider: self.provider,
            status: self.status,
            preview_url: self.preview_url.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: self.last_accessed,
        }
    }
}
