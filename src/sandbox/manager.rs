use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use super::error::SandboxError;
use super::instance::PreviewInstance;
use super::logs::SharedLogRing;
use super::provider::{PreviewHandle, PreviewProvider};
use super::readiness;
use super::registry::PreviewRegistry;
use super::types::{PreviewSnapshot, PreviewSpec, PreviewStatus, ProviderInfo, Tier};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hard cap on concurrent previews; exceeding it evicts the LRU one.
    pub max_instances: usize,
    pub ttl_free: Duration,
    pub ttl_paid: Duration,
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_instances: 20,
            ttl_free: Duration::from_secs(15 * 60),
            ttl_paid: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            poll_max_attempts: 40,
        }
    }
}

/// What status queries return: the instance snapshot plus recent output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub snapshot: PreviewSnapshot,
    pub log_tail: Vec<String>,
}

/// Published once per creation flow; `None` while still provisioning.
type CreateOutcome = Option<Result<PreviewSnapshot, String>>;

/// Orchestrates the preview lifecycle over one backend provider.
///
/// Owns the registry, the per-project single-flight creation map, and the
/// TTL sweep task. Constructed once at startup and injected where needed;
/// all state dies with the process, which is deliberate for ephemeral
/// previews.
pub struct PreviewManager {
    provider: Arc<dyn PreviewProvider>,
    registry: Arc<PreviewRegistry>,
    config: ManagerConfig,
    inflight: Mutex<HashMap<String, watch::Receiver<CreateOutcome>>>,
}

impl PreviewManager {
    pub fn new(provider: Arc<dyn PreviewProvider>, config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            provider,
            registry: Arc::new(PreviewRegistry::new()),
            config,
            inflight: Mutex::new(HashMap::new()),
        });

        // TTL sweep. Holds only a weak reference so dropping the last
        // manager handle ends the task.
        let weak = Arc::downgrade(&manager);
        let interval = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_once().await;
            }
        });

        manager
    }

    pub fn provider_info(&self) -> ProviderInfo {
        self.provider.info()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_instances
    }

    pub async fn active(&self) -> usize {
        self.registry.len().await
    }

    /// Create (or join the in-flight creation of) a preview for a project.
    ///
    /// At most one provisioning flow runs per project: the first caller
    /// becomes the leader and spawns the flow as a task, so it survives
    /// the caller disconnecting; later callers await the same outcome and
    /// observe the same instance id. The returned snapshot is usually
    /// still `creating` — callers poll status until the readiness poller
    /// resolves it.
    pub async fn create(self: &Arc<Self>, spec: PreviewSpec) -> Result<PreviewSnapshot, SandboxError> {
        let project_id = spec.project_id.clone();
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&project_id) {
                Some(rx) => {
                    tracing::debug!(project_id = %project_id, "joining in-flight preview creation");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(project_id.clone(), rx.clone());

                    let manager = self.clone();
                    let key = project_id.clone();
                    tokio::spawn(async move {
                        let result = manager.provision(spec).await;
                        let outcome = match &result {
                            Ok(snap) => Ok(snap.clone()),
                            Err(e) => Err(e.to_string()),
                        };
                        // Publish before releasing the slot so everyone
                        // holding the receiver sees a value.
                        let _ = tx.send(Some(outcome));
                        manager.inflight.lock().await.remove(&key);
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(SandboxError::Provision);
            }
            if rx.changed().await.is_err() {
                return Err(SandboxError::Provision(
                    "preview creation task ended without a result".into(),
                ));
            }
        }
    }

    /// The single provisioning flow for one project. Runs with the
    /// in-flight slot held, so nothing else creates for this project.
    async fn provision(&self, spec: PreviewSpec) -> Result<PreviewSnapshot, SandboxError> {
        let project_id = spec.project_id.clone();

        // Environments are never reused between generations: an existing
        // preview is torn down before the new one is built.
        match self.destroy(&project_id).await {
            Ok(true) => tracing::info!(project_id = %project_id, "replaced existing preview"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "teardown of previous preview failed, continuing");
            }
        }

        // Stay under the cap by evicting least-recently-accessed previews.
        while self.registry.len().await >= self.config.max_instances {
            let Some((victim, victim_id)) = self.registry.lru_candidate().await else {
                return Err(SandboxError::CapacityExhausted(format!(
                    "{} previews active and none evictable",
                    self.config.max_instances
                )));
            };
            tracing::info!(project_id = %victim, "evicting least-recently-accessed preview");
            self.teardown_if_current(&victim, &victim_id).await;
        }

        let ttl = match spec.tier {
            Tier::Free => self.config.ttl_free,
            Tier::Paid => self.config.ttl_paid,
        };
        let instance = PreviewInstance::new(&spec, self.provider.info().kind, ttl);
        let instance_id = instance.id.clone();
        let logs = instance.logs.clone();
        let snapshot = instance.snapshot();
        self.registry.insert(instance).await;

        let handle = match self.provision_steps(&spec, logs.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "preview creation failed");
                logs.lock().await.push_line(format!("creation failed: {e}"));
                self.registry
                    .with_current(&project_id, &instance_id, |inst| {
                        inst.transition(PreviewStatus::Error);
                    })
                    .await;
                return Err(e);
            }
        };

        let handle: Arc<dyn PreviewHandle> = Arc::from(handle);
        let stored = self
            .registry
            .with_current(&project_id, &instance_id, |inst| {
                inst.handle = Some(handle.clone());
            })
            .await;
        if stored.is_none() {
            // Destroyed while provisioning: discard the fresh environment.
            tracing::info!(project_id = %project_id, "preview destroyed during creation, discarding environment");
            if let Err(e) = handle.destroy().await {
                tracing::warn!(project_id = %project_id, error = %e, "failed to discard orphaned environment");
            }
            return Err(SandboxError::NotFound(project_id));
        }

        let info = self.provider.info();
        let poll = readiness::spawn(
            self.registry.clone(),
            project_id.clone(),
            instance_id.clone(),
            handle,
            logs,
            info.public_urls,
            self.config.poll_interval,
            self.config.poll_max_attempts,
        );
        // If the instance vanished in the meantime the poller notices on
        // its first currency check and exits by itself.
        self.registry
            .with_current(&project_id, &instance_id, |inst| {
                inst.poll_task = Some(poll);
            })
            .await;

        Ok(snapshot)
    }

    /// create → write → install → start, tearing down the partial
    /// environment when any step after create fails.
    async fn provision_steps(
        &self,
        spec: &PreviewSpec,
        logs: SharedLogRing,
    ) -> Result<Box<dyn PreviewHandle>, SandboxError> {
        let handle = self.provider.create(spec, logs).await?;

        let steps = async {
            handle.write_files(&spec.files).await?;
            handle.install_dependencies().await?;
            handle.start_server().await
        };
        if let Err(e) = steps.await {
            if let Err(de) = handle.destroy().await {
                tracing::warn!(
                    preview_id = %handle.id(),
                    error = %de,
                    "failed to tear down partially created environment"
                );
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Status read; counts as an access for LRU purposes.
    pub async fn status(&self, project_id: &str) -> Result<StatusView, SandboxError> {
        let snapshot = self
            .registry
            .snapshot(project_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(project_id.to_string()))?;
        let log_tail = match self.registry.logs(project_id).await {
            Some(ring) => ring.lock().await.tail(50),
            None => Vec::new(),
        };
        Ok(StatusView { snapshot, log_tail })
    }

    pub async fn list(&self) -> Vec<PreviewSnapshot> {
        self.registry.snapshot_all().await
    }

    pub async fn log_ring(&self, project_id: &str) -> Option<SharedLogRing> {
        self.registry.logs(project_id).await
    }

    /// Explicit destroy. Idempotent: destroying an absent preview is
    /// `Ok(false)`, not an error.
    pub async fn destroy(&self, project_id: &str) -> Result<bool, SandboxError> {
        let Some(mut instance) = self.registry.remove(project_id).await else {
            return Ok(false);
        };
        if let Some(task) = instance.poll_task.take() {
            task.abort();
        }
        instance.transition(PreviewStatus::Stopped);
        instance
            .logs
            .lock()
            .await
            .push_line("preview destroyed".to_string());
        if let Some(handle) = instance.handle.take() {
            handle.destroy().await?;
        }
        tracing::info!(project_id = %project_id, preview_id = %instance.id, "preview destroyed");
        Ok(true)
    }

    /// Teardown used by the sweeper and evictor: only fires if the
    /// instance id still matches, so a preview replaced since the
    /// decision is left alone. Provider errors are logged, not surfaced.
    async fn teardown_if_current(&self, project_id: &str, instance_id: &str) {
        let Some(mut instance) = self.registry.remove_if_current(project_id, instance_id).await
        else {
            return;
        };
        if let Some(task) = instance.poll_task.take() {
            task.abort();
        }
        instance.transition(PreviewStatus::Stopped);
        if let Some(handle) = instance.handle.take() {
            if let Err(e) = handle.destroy().await {
                tracing::warn!(
                    project_id = %project_id,
                    preview_id = %instance.id,
                    error = %e,
                    "provider teardown failed"
                );
            }
        }
    }

    /// One TTL pass. Runs on the sweep interval; also callable directly.
    pub async fn sweep_once(&self) {
        for (project_id, instance_id) in self.registry.expired(Utc::now()).await {
            tracing::info!(project_id = %project_id, "preview ttl expired");
            self.teardown_if_current(&project_id, &instance_id).await;
        }
    }

    /// Push a preview's expiry forward. Never shortens.
    pub async fn extend_timeout(
        &self,
        project_id: &str,
        minutes: i64,
    ) -> Result<PreviewSnapshot, SandboxError> {
        if minutes <= 0 {
            return Err(SandboxError::Unsupported(
                "extend_timeout requires a positive number of minutes",
            ));
        }
        self.registry
            .push_expiry(project_id, chrono::Duration::minutes(minutes))
            .await
            .ok_or_else(|| SandboxError::NotFound(project_id.to_string()))
    }

    /// Best-effort teardown of every live preview; used on shutdown so
    /// cloud sandboxes are not leaked past the process.
    pub async fn destroy_all(&self) {
        for snap in self.registry.snapshot_all().await {
            if let Err(e) = self.destroy(&snap.project_id).await {
                tracing::warn!(project_id = %snap.project_id, error = %e, "shutdown teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::logs::SharedLogRing;
    use crate::sandbox::provider::UrlProbe;
    use crate::sandbox::types::{ProjectFile, ProviderKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockProvider {
        create_calls: AtomicUsize,
        create_delay: Duration,
        fail_create: AtomicBool,
        fail_start: AtomicBool,
        destroys: Arc<AtomicUsize>,
        url: Option<String>,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                create_calls: AtomicUsize::new(0),
                create_delay: Duration::from_millis(0),
                fail_create: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                destroys: Arc::new(AtomicUsize::new(0)),
                url: None,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            let mut p = Self::new();
            Arc::get_mut(&mut p).unwrap().create_delay = delay;
            p
        }

        fn with_url(url: &str) -> Arc<Self> {
            let mut p = Self::new();
            Arc::get_mut(&mut p).unwrap().url = Some(url.into());
            p
        }
    }

    #[async_trait]
    impl PreviewProvider for MockProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                kind: ProviderKind::E2b,
                public_urls: true,
            }
        }

        async fn create(
            &self,
            spec: &PreviewSpec,
            _logs: SharedLogRing,
        ) -> Result<Box<dyn PreviewHandle>, SandboxError> {
            tokio::time::sleep(self.create_delay).await;
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(SandboxError::Provision("mock create refused".into()));
            }
            let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockHandle {
                id: format!("mock-{}-{n}", spec.project_id),
                fail_start: self.fail_start.load(Ordering::SeqCst),
                destroys: self.destroys.clone(),
                url: self.url.clone(),
            }))
        }
    }

    struct MockHandle {
        id: String,
        fail_start: bool,
        destroys: Arc<AtomicUsize>,
        url: Option<String>,
    }

    #[async_trait]
    impl PreviewHandle for MockHandle {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::E2b
        }
        async fn write_files(&self, _files: &[ProjectFile]) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn install_dependencies(&self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn start_server(&self) -> Result<(), SandboxError> {
            if self.fail_start {
                return Err(SandboxError::Exec("mock start failed".into()));
            }
            Ok(())
        }
        async fn preview_url(&self) -> Result<UrlProbe, SandboxError> {
            Ok(match &self.url {
                Some(url) => UrlProbe::Ready(url.clone()),
                None => UrlProbe::NotReady,
            })
        }
        async fn destroy(&self) -> Result<(), SandboxError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spec(project_id: &str) -> PreviewSpec {
        PreviewSpec {
            project_id: project_id.into(),
            owner_id: "owner-1".into(),
            tier: Tier::Free,
            files: vec![ProjectFile {
                path: "package.json".into(),
                content: "{}".into(),
            }],
        }
    }

    fn quiet_config() -> ManagerConfig {
        ManagerConfig {
            // Long everything so background machinery stays out of the way
            sweep_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(3600),
            poll_max_attempts: 1,
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn concurrent_creates_share_one_provisioning_flow() {
        let provider = MockProvider::with_delay(Duration::from_millis(100));
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        let (a, b) = tokio::join!(manager.create(spec("p1")), manager.create(spec("p1")));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active().await, 1);
    }

    #[tokio::test]
    async fn sequential_create_replaces_and_destroys_old() {
        let provider = MockProvider::new();
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        let first = manager.create(spec("p1")).await.unwrap();
        let second = manager.create(spec("p1")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(manager.active().await, 1);
        // The first environment was torn down before the second was built
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_create_surfaces_error_and_allows_retry() {
        let provider = MockProvider::new();
        provider.fail_create.store(true, Ordering::SeqCst);
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        let err = manager.create(spec("p1")).await.unwrap_err();
        assert!(err.to_string().contains("mock create refused"));

        let status = manager.status("p1").await.unwrap();
        assert_eq!(status.snapshot.status, PreviewStatus::Error);
        assert!(status.log_tail.iter().any(|l| l.contains("creation failed")));

        // The in-flight slot was released; a retry provisions fresh
        provider.fail_create.store(false, Ordering::SeqCst);
        let snap = manager.create(spec("p1")).await.unwrap();
        assert_eq!(snap.status, PreviewStatus::Creating);
    }

    #[tokio::test]
    async fn failed_start_tears_down_partial_environment() {
        let provider = MockProvider::new();
        provider.fail_start.store(true, Ordering::SeqCst);
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        let err = manager.create(spec("p1")).await.unwrap_err();
        assert!(err.to_string().contains("mock start failed"));
        // The half-built environment was destroyed, not leaked
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.status("p1").await.unwrap().snapshot.status,
            PreviewStatus::Error
        );
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let provider = MockProvider::new();
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        manager.create(spec("p1")).await.unwrap();
        assert!(manager.destroy("p1").await.unwrap());
        assert!(!manager.destroy("p1").await.unwrap());
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.status("p1").await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ttl_sweep_destroys_expired_exactly_once() {
        let provider = MockProvider::new();
        let config = ManagerConfig {
            ttl_free: Duration::from_millis(0),
            ..quiet_config()
        };
        let manager = PreviewManager::new(provider.clone(), config);

        manager.create(spec("p1")).await.unwrap();
        manager.sweep_once().await;
        manager.sweep_once().await;

        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.status("p1").await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn paid_tier_gets_longer_ttl() {
        let provider = MockProvider::new();
        let config = ManagerConfig {
            ttl_free: Duration::from_secs(60),
            ttl_paid: Duration::from_secs(3600),
            ..quiet_config()
        };
        let manager = PreviewManager::new(provider, config);

        let free = manager.create(spec("free-p")).await.unwrap();
        let mut paid_spec = spec("paid-p");
        paid_spec.tier = Tier::Paid;
        let paid = manager.create(paid_spec).await.unwrap();

        let free_ttl = free.expires_at - free.created_at;
        let paid_ttl = paid.expires_at - paid.created_at;
        assert!(paid_ttl > free_ttl);
    }

    #[tokio::test]
    async fn cap_evicts_exactly_the_lru_preview() {
        let provider = MockProvider::new();
        let config = ManagerConfig {
            max_instances: 2,
            ..quiet_config()
        };
        let manager = PreviewManager::new(provider.clone(), config);

        manager.create(spec("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.create(spec("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Access B so A is the least recently accessed
        manager.status("b").await.unwrap();

        manager.create(spec("c")).await.unwrap();

        assert_eq!(manager.active().await, 2);
        assert!(matches!(
            manager.status("a").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(manager.status("b").await.is_ok());
        assert!(manager.status("c").await.is_ok());
        // A's environment destroyed exactly once
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn readiness_resolves_status_to_running() {
        let provider = MockProvider::with_url("https://p1.preview.dev");
        let config = ManagerConfig {
            poll_interval: Duration::from_millis(10),
            poll_max_attempts: 20,
            ..quiet_config()
        };
        let manager = PreviewManager::new(provider, config);

        let snap = manager.create(spec("p1")).await.unwrap();
        assert_eq!(snap.status, PreviewStatus::Creating);

        let mut running = None;
        for _ in 0..100 {
            let status = manager.status("p1").await.unwrap();
            if status.snapshot.status == PreviewStatus::Running {
                running = Some(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = running.expect("preview never became running");
        assert_eq!(
            status.snapshot.preview_url.as_deref(),
            Some("https://p1.preview.dev")
        );
        assert!(status.log_tail.iter().any(|l| l.contains("preview ready")));
    }

    #[tokio::test]
    async fn extend_timeout_pushes_forward_and_validates() {
        let provider = MockProvider::new();
        let manager = PreviewManager::new(provider, quiet_config());

        let before = manager.create(spec("p1")).await.unwrap().expires_at;
        let after = manager.extend_timeout("p1", 30).await.unwrap().expires_at;
        assert_eq!(after - before, chrono::Duration::minutes(30));

        assert!(matches!(
            manager.extend_timeout("absent", 30).await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            manager.extend_timeout("p1", 0).await,
            Err(SandboxError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn destroy_all_empties_registry() {
        let provider = MockProvider::new();
        let manager = PreviewManager::new(provider.clone(), quiet_config());

        manager.create(spec("a")).await.unwrap();
        manager.create(spec("b")).await.unwrap();
        manager.destroy_all().await;

        assert_eq!(manager.active().await, 0);
        assert_eq!(provider.destroys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_reflects_live_previews() {
        let provider = MockProvider::new();
        let manager = PreviewManager::new(provider, quiet_config());

        manager.create(spec("a")).await.unwrap();
        manager.create(spec("b")).await.unwrap();

        let all = manager.list().await;
        assert_eq!(all.len(), 2);
        let projects: Vec<_> = all.iter().map(|s| s.project_id.as_str()).collect();
        assert!(projects.contains(&"a"));
        assert!(projects.contains(&"b"));
    }
}
