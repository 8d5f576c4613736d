use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::instance::PreviewInstance;
use super::logs::SharedLogRing;
use super::types::PreviewSnapshot;

/// In-memory map of project id → live preview.
///
/// At most one entry per project. Mutations that originate from background
/// tasks go through the `*_if_current` / `with_current` gates: they carry
/// the instance id they were spawned for and become no-ops once the
/// project has been replaced or destroyed.
pub struct PreviewRegistry {
    entries: RwLock<HashMap<String, PreviewInstance>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, instance: PreviewInstance) {
        let mut entries = self.entries.write().await;
        entries.insert(instance.project_id.clone(), instance);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Status read. Counts as an access for LRU purposes.
    pub async fn snapshot(&self, project_id: &str) -> Option<PreviewSnapshot> {
        let mut entries = self.entries.write().await;
        let instance = entries.get_mut(project_id)?;
        instance.touch();
        Some(instance.snapshot())
    }

    /// Registry-wide snapshot for the list endpoint. Does not touch LRU.
    pub async fn snapshot_all(&self) -> Vec<PreviewSnapshot> {
        let entries = self.entries.read().await;
        let mut snaps: Vec<PreviewSnapshot> =
            entries.values().map(|i| i.snapshot()).collect();
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snaps
    }

    pub async fn logs(&self, project_id: &str) -> Option<SharedLogRing> {
        let entries = self.entries.read().await;
        entries.get(project_id).map(|i| i.logs.clone())
    }

    pub async fn is_current(&self, project_id: &str, instance_id: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(project_id)
            .map(|i| i.id == instance_id)
            .unwrap_or(false)
    }

    /// Run a mutation against the instance, but only if it is still the
    /// current one for the project. Returns None when it is not.
    pub async fn with_current<F, R>(&self, project_id: &str, instance_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut PreviewInstance) -> R,
    {
        let mut entries = self.entries.write().await;
        match entries.get_mut(project_id) {
            Some(instance) if instance.id == instance_id => Some(f(instance)),
            _ => None,
        }
    }

    /// Remove the project's preview unconditionally (explicit destroy).
    pub async fn remove(&self, project_id: &str) -> Option<PreviewInstance> {
        let mut entries = self.entries.write().await;
        entries.remove(project_id)
    }

    /// Remove the project's preview only if the instance id still matches.
    /// Used by the sweeper and evictor so they never tear down a preview
    /// that replaced the one they decided on.
    pub async fn remove_if_current(
        &self,
        project_id: &str,
        instance_id: &str,
    ) -> Option<PreviewInstance> {
        let mut entries = self.entries.write().await;
        match entries.get(project_id) {
            Some(instance) if instance.id == instance_id => entries.remove(project_id),
            _ => None,
        }
    }

    /// Least-recently-accessed preview, as (project_id, instance_id).
    pub async fn lru_candidate(&self) -> Option<(String, String)> {
        let entries = self.entries.read().await;
        entries
            .values()
            .min_by_key(|i| i.last_accessed)
            .map(|i| (i.project_id.clone(), i.id.clone()))
    }

    /// Previews whose TTL has passed, as (project_id, instance_id).
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|i| i.expired(now))
            .map(|i| (i.project_id.clone(), i.id.clone()))
            .collect()
    }

    /// Push the project's expiry forward. None when no preview exists.
    pub async fn push_expiry(
        &self,
        project_id: &str,
        extra: chrono::Duration,
    ) -> Option<PreviewSnapshot> {
        let mut entries = self.entries.write().await;
        let instance = entries.get_mut(project_id)?;
        instance.expires_at += extra;
        Some(instance.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::{PreviewSpec, PreviewStatus, ProviderKind, Tier};
    use std::time::Duration;

    fn make_instance(project_id: &str) -> PreviewInstance {
        let spec = PreviewSpec {
            project_id: project_id.into(),
            owner_id: "owner-1".into(),
            tier: Tier::Free,
            files: vec![],
        };
        PreviewInstance::new(&spec, ProviderKind::Local, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn insert_and_snapshot() {
        let registry = PreviewRegistry::new();
        registry.insert(make_instance("p1")).await;

        assert_eq!(registry.len().await, 1);
        let snap = registry.snapshot("p1").await.unwrap();
        assert_eq!(snap.project_id, "p1");
        assert_eq!(snap.status, PreviewStatus::Creating);
        assert!(registry.snapshot("nope").await.is_none());
    }

    #[tokio::test]
    async fn insert_replaces_same_project() {
        let registry = PreviewRegistry::new();
        let first = make_instance("p1");
        let first_id = first.id.clone();
        registry.insert(first).await;
        registry.insert(make_instance("p1")).await;

        assert_eq!(registry.len().await, 1);
        let snap = registry.snapshot("p1").await.unwrap();
        assert_ne!(snap.id, first_id);
    }

    #[tokio::test]
    async fn snapshot_touches_last_accessed() {
        let registry = PreviewRegistry::new();
        registry.insert(make_instance("p1")).await;

        let first = registry.snapshot("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.snapshot("p1").await.unwrap();
        assert!(second.last_accessed > first.last_accessed);
    }

    #[tokio::test]
    async fn with_current_rejects_stale_instance_id() {
        let registry = PreviewRegistry::new();
        let instance = make_instance("p1");
        let live_id = instance.id.clone();
        registry.insert(instance).await;

        let applied = registry
            .with_current("p1", &live_id, |i| {
                i.preview_url = Some("http://127.0.0.1:3100".into());
            })
            .await;
        assert!(applied.is_some());

        let stale = registry
            .with_current("p1", "some-old-instance", |i| {
                i.preview_url = None;
            })
            .await;
        assert!(stale.is_none());

        let snap = registry.snapshot("p1").await.unwrap();
        assert_eq!(snap.preview_url.as_deref(), Some("http://127.0.0.1:3100"));
    }

    #[tokio::test]
    async fn remove_if_current_is_a_noop_after_replace() {
        let registry = PreviewRegistry::new();
        let old = make_instance("p1");
        let old_id = old.id.clone();
        registry.insert(old).await;
        registry.insert(make_instance("p1")).await;

        assert!(registry.remove_if_current("p1", &old_id).await.is_none());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove("p1").await.is_some());
        assert_eq!(registry.len().await, 0);
        assert!(registry.remove("p1").await.is_none());
    }

    #[tokio::test]
    async fn lru_candidate_is_least_recently_accessed() {
        let registry = PreviewRegistry::new();
        registry.insert(make_instance("a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.insert(make_instance("b")).await;

        // "a" is older, so it is the candidate
        let (victim, _) = registry.lru_candidate().await.unwrap();
        assert_eq!(victim, "a");

        // Touching "a" makes "b" the candidate
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.snapshot("a").await.unwrap();
        let (victim, _) = registry.lru_candidate().await.unwrap();
        assert_eq!(victim, "b");
    }

    #[tokio::test]
    async fn expired_returns_only_past_ttl() {
        let registry = PreviewRegistry::new();
        let spec = PreviewSpec {
            project_id: "short".into(),
            owner_id: "o".into(),
            tier: Tier::Free,
            files: vec![],
        };
        registry
            .insert(PreviewInstance::new(
                &spec,
                ProviderKind::Local,
                Duration::from_millis(0),
            ))
            .await;
        registry.insert(make_instance("long")).await;

        let expired = registry.expired(Utc::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "short");
    }

    #[tokio::test]
    async fn push_expiry_extends() {
        let registry = PreviewRegistry::new();
        registry.insert(make_instance("p1")).await;

        let before = registry.snapshot("p1").await.unwrap().expires_at;
        let after = registry
            .push_expiry("p1", chrono::Duration::minutes(15))
            .await
            .unwrap()
            .expires_at;
        assert_eq!(after - before, chrono::Duration::minutes(15));

        assert!(registry
            .push_expiry("absent", chrono::Duration::minutes(15))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn snapshot_all_sorted_by_creation() {
        let registry = PreviewRegistry::new();
        registry.insert(make_instance("a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.insert(make_instance("b")).await;

        let all = registry.snapshot_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].project_id, "a");
        assert_eq!(all[1].project_id, "b");
    }
}
