//! Multi-tenant container pool.
//!
//! One isolated container per tenant, created on demand, bounded by the
//! deployment profile's capacity, and reclaimed by an idle sweep. Every pool
//! change resynchronizes the edge proxy so tenant preview URLs always match
//! the live container set.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use execution::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

use super::{
    config::SandboxConfig,
    events::{EventKind, EventService},
    proxy::{ProxyController, ProxyRoute},
};

const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(
        "container pool is at capacity ({active}/{max}); remove idle sandboxes or raise SBX_MAX_CONTAINERS"
    )]
    Capacity { active: usize, max: usize },
    #[error("no usable sandbox image; tried {tried:?}")]
    ImageUnavailable { tried: Vec<String> },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Environment errors need operator action, not a retry.
    pub fn is_environment(&self) -> bool {
        matches!(self, PoolError::Runtime(e) if e.is_environment())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub tenant: String,
    pub container_id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub project_dir: std::path::PathBuf,
    pub proxy_path: String,
    pub preview_url: String,
}

/// Layered diagnostics. Each layer is only probed when the previous one
/// passed; a failure short-circuits the rest as false.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub runtime_installed: bool,
    pub daemon_running: bool,
    pub container_running: bool,
    pub network_reachable: bool,
}

/// Derive the runtime container name for a tenant key. Tenant keys come from
/// request parameters, so anything outside the safe character set is mapped
/// away.
pub fn container_name(tenant: &str) -> String {
    let safe: String = tenant
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("sbx_{safe}")
}

pub struct ContainerPool {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventService,
    proxy: ProxyController,
    records: DashMap<String, ContainerRecord>,
    // Serializes check-then-create per tenant; different tenants never
    // contend.
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    // Makes the capacity check and the slot reservation one step, so
    // concurrent creations for different tenants cannot both pass the gate.
    capacity_gate: Mutex<()>,
}

impl ContainerPool {
    pub fn new(
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        events: EventService,
    ) -> Self {
        let proxy = ProxyController::new(config.proxy_conf.clone());
        Self {
            config,
            runtime,
            events,
            proxy,
            records: DashMap::new(),
            creation_locks: DashMap::new(),
            capacity_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn creation_lock(&self, tenant: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent ensure-exists: a tenant with a running container gets the
    /// existing record back; otherwise a container is created. Concurrent
    /// calls for the same tenant serialize on a per-tenant lock, so exactly
    /// one creation happens.
    pub async fn ensure(&self, tenant: &str) -> Result<ContainerRecord, PoolError> {
        self.ensure_with_dir(tenant, None).await
    }

    /// Like [`Self::ensure`], with an explicit host project directory. When
    /// the tenant already has a running container the override is ignored.
    pub async fn ensure_with_dir(
        &self,
        tenant: &str,
        project_dir: Option<std::path::PathBuf>,
    ) -> Result<ContainerRecord, PoolError> {
        let lock = self.creation_lock(tenant);
        let _guard = lock.lock().await;

        if let Some(existing) = self.records.get(tenant).map(|r| r.clone()) {
            if self.runtime.is_running(&existing.name).await? {
                self.touch(tenant);
                return Ok(self
                    .records
                    .get(tenant)
                    .map(|r| r.clone())
                    .unwrap_or(existing));
            }
            // The container died out from under us; recreate below.
            self.records.remove(tenant);
        }

        let name = container_name(tenant);
        let project_dir = project_dir.unwrap_or_else(|| self.config.project_dir(tenant));

        // Reserve a pool slot before the first await of the creation path.
        // The reservation is a `creating` record counted by the capacity
        // check, so two tenants racing through creation cannot both pass the
        // gate; it is dropped on every failure path.
        {
            let _slot = self.capacity_gate.lock().await;
            let active = self.active_count();
            if active >= self.config.max_containers {
                return Err(PoolError::Capacity {
                    active,
                    max: self.config.max_containers,
                });
            }
            let now = Utc::now();
            let proxy_path = format!("/preview/{tenant}/");
            self.records.insert(
                tenant.to_string(),
                ContainerRecord {
                    tenant: tenant.to_string(),
                    container_id: String::new(),
                    name: name.clone(),
                    status: ContainerStatus::Creating,
                    created_at: now,
                    last_active_at: now,
                    project_dir: project_dir.clone(),
                    preview_url: proxy_path.clone(),
                    proxy_path,
                },
            );
        }

        let record = match self.create_container(tenant, &name, project_dir).await {
            Ok(record) => record,
            Err(e) => {
                self.records.remove(tenant);
                return Err(e);
            }
        };
        self.records.insert(tenant.to_string(), record.clone());
        tracing::info!(
            tenant,
            container = record.name,
            "sandbox container created"
        );

        self.events.publish(
            EventKind::ContainerCreated,
            json!({
                "tenant": tenant,
                "containerId": record.container_id,
                "previewUrl": record.preview_url,
            }),
        );
        self.resync_proxy().await;

        Ok(record)
    }

    /// Runtime and image acquisition for one tenant container. Runs after
    /// the pool slot is reserved; the caller owns the record bookkeeping.
    async fn create_container(
        &self,
        tenant: &str,
        name: &str,
        project_dir: std::path::PathBuf,
    ) -> Result<ContainerRecord, PoolError> {
        if !self.runtime.installed() {
            return Err(RuntimeError::NotInstalled.into());
        }
        self.runtime.ping().await?;

        // Crash recovery: a previous process may have left a container with
        // this name behind.
        self.runtime.force_remove(name).await?;

        tokio::fs::create_dir_all(&project_dir).await?;

        let image = self.resolve_image().await?;

        let spec = ContainerSpec {
            name: name.to_string(),
            image,
            project_dir: project_dir.clone(),
            mount_target: self.config.mount_target.clone(),
            network: Some(self.config.network.clone()),
            memory_limit_bytes: self.config.profile.memory_limit_bytes(),
            nano_cpus: self.config.profile.nano_cpus(),
            internal_port: self.config.internal_port,
            labels: HashMap::from([("sbx.tenant".to_string(), tenant.to_string())]),
        };

        let container_id = match self.runtime.create_and_start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                // Leave nothing behind that would block a retry.
                if let Err(cleanup) = self.runtime.force_remove(name).await {
                    tracing::debug!("cleanup after failed create of {name}: {cleanup}");
                }
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let proxy_path = format!("/preview/{tenant}/");
        Ok(ContainerRecord {
            tenant: tenant.to_string(),
            container_id,
            name: name.to_string(),
            status: ContainerStatus::Running,
            created_at: now,
            last_active_at: now,
            project_dir,
            preview_url: proxy_path.clone(),
            proxy_path,
        })
    }

    /// Preferred image (built from its Dockerfile when one is configured),
    /// then the public fallback, then anything locally cached from the
    /// fallback family. Build and pull failures along the way are
    /// recoverable; only exhausting every option is an error.
    async fn resolve_image(&self) -> Result<String, PoolError> {
        let candidates = [self.config.image.clone(), self.config.fallback_image.clone()];
        let mut tried = Vec::new();

        for image in candidates {
            if self.runtime.image_present(&image).await? {
                return Ok(image);
            }

            if image == self.config.image
                && let Some(dockerfile) = &self.config.image_dockerfile
            {
                let progress =
                    |line: String| tracing::debug!(image = %self.config.image, "build: {line}");
                match self.runtime.build_image(&image, dockerfile, &progress).await {
                    Ok(()) => {
                        tracing::info!("built sandbox image {image}");
                        return Ok(image);
                    }
                    Err(e) if e.is_environment() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!("build of {image} failed, trying a pull: {e}");
                    }
                }
            }

            self.events
                .publish(EventKind::PullingImage, json!({ "image": image }));
            let events = self.events.clone();
            let image_for_progress = image.clone();
            let progress = move |status: String| {
                events.publish(
                    EventKind::PullingImage,
                    json!({ "image": image_for_progress, "status": status }),
                );
            };

            match self.runtime.pull_image(&image, &progress).await {
                Ok(()) => {
                    self.events
                        .publish(EventKind::ImagePulled, json!({ "image": image }));
                    return Ok(image);
                }
                Err(e) if e.is_environment() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!("pull of {image} failed, trying next option: {e}");
                    tried.push(image);
                }
            }
        }

        let family = self
            .config
            .fallback_image
            .split(':')
            .next()
            .unwrap_or(&self.config.fallback_image);
        if let Some(local) = self.runtime.find_local_image(family).await? {
            tracing::info!("using locally cached image {local}");
            return Ok(local);
        }

        Err(PoolError::ImageUnavailable { tried })
    }

    /// Tear down a tenant's container. The pool record is dropped no matter
    /// what the runtime calls return, so a half-dead container can never
    /// block recreation.
    pub async fn remove(&self, tenant: &str) -> bool {
        let record = self.records.remove(tenant).map(|(_, r)| r);
        let name = record
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| container_name(tenant));

        if let Err(e) = self.runtime.stop(&name).await {
            tracing::debug!("stop of {name} during removal: {e}");
        }
        if let Err(e) = self.runtime.force_remove(&name).await {
            tracing::warn!("force remove of {name} failed: {e}");
        }

        self.events
            .publish(EventKind::ContainerCleaned, json!({ "tenant": tenant }));
        self.resync_proxy().await;

        record.is_some()
    }

    /// Refresh the idle clock for a tenant.
    pub fn touch(&self, tenant: &str) {
        if let Some(mut record) = self.records.get_mut(tenant) {
            record.last_active_at = Utc::now();
        }
    }

    pub fn status_for(&self, tenant: &str) -> Option<ContainerRecord> {
        self.records.get(tenant).map(|r| r.clone())
    }

    /// The tenant's record, but only when its container is confirmed alive.
    /// A record whose container died out-of-band is torn down here, so the
    /// caller sees "no container" instead of a doomed transport attempt.
    pub async fn live_record(&self, tenant: &str) -> Option<ContainerRecord> {
        let record = self.status_for(tenant)?;
        if record.status != ContainerStatus::Running {
            return None;
        }
        if self.runtime.is_running(&record.name).await.unwrap_or(false) {
            Some(record)
        } else {
            self.remove(tenant).await;
            None
        }
    }

    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// Containers counted against capacity: running ones plus in-flight
    /// creations holding a reserved slot.
    fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ContainerStatus::Creating | ContainerStatus::Running
                )
            })
            .count()
    }

    pub async fn health_check(&self, tenant: &str) -> HealthReport {
        let mut report = HealthReport {
            runtime_installed: false,
            daemon_running: false,
            container_running: false,
            network_reachable: false,
        };

        report.runtime_installed = self.runtime.installed();
        if !report.runtime_installed {
            return report;
        }

        report.daemon_running = self.runtime.ping().await.is_ok();
        if !report.daemon_running {
            return report;
        }

        let name = container_name(tenant);
        report.container_running = self.runtime.is_running(&name).await.unwrap_or(false);
        if !report.container_running {
            return report;
        }

        report.network_reachable = self.probe_network(&name).await;
        report
    }

    /// Quick in-container reachability check against the package registry
    /// the sandbox images install from.
    async fn probe_network(&self, container: &str) -> bool {
        let probe = "wget -q --spider --timeout=5 http://registry.npmjs.org";
        let handle = match self.runtime.exec_stream(container, probe, "/").await {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        let exec_id = handle.exec_id;
        let mut output = handle.output;

        let drained = tokio::time::timeout(NETWORK_PROBE_TIMEOUT, async {
            while output.next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            return false;
        }

        for _ in 0..5 {
            match self.runtime.exec_exit_code(&exec_id).await {
                Ok(Some(code)) => return code == 0,
                Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(_) => return false,
            }
        }
        false
    }

    /// Remove every container idle for the full TTL. Uses the same removal
    /// path as explicit teardown, so the proxy stays consistent.
    pub async fn evict_idle(&self) {
        let ttl = chrono::Duration::from_std(self.config.idle_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - ttl;

        let idle: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.last_active_at <= cutoff)
            .map(|r| r.tenant.clone())
            .collect();

        for tenant in idle {
            tracing::info!(tenant, "evicting idle sandbox container");
            self.remove(&tenant).await;
        }
    }

    pub fn spawn_eviction_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.evict_idle().await;
            }
        })
    }

    /// Regenerate and apply the proxy routing table from current pool state.
    /// The rendered config is a cache of the pool; failures here are logged
    /// and retried on the next pool change rather than failing the caller.
    pub async fn resync_proxy(&self) {
        let routes: Vec<ProxyRoute> = self
            .records
            .iter()
            .filter(|r| r.status == ContainerStatus::Running)
            .map(|r| ProxyRoute {
                tenant: r.tenant.clone(),
                upstream: r.name.clone(),
                port: self.config.internal_port,
            })
            .collect();

        if let Err(e) = self.proxy.sync(&routes).await {
            tracing::warn!("proxy resync failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use execution::test_support::FakeRuntime;

    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> SandboxConfig {
        SandboxConfig {
            sandbox_root: dir.path().join("projects"),
            proxy_conf: dir.path().join("sbx-routes.conf"),
            ..SandboxConfig::default()
        }
    }

    fn pool_with(runtime: Arc<FakeRuntime>, config: SandboxConfig) -> Arc<ContainerPool> {
        runtime.add_image(&config.image);
        Arc::new(ContainerPool::new(config, runtime, EventService::new()))
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = pool_with(runtime.clone(), test_config(&dir));

        let first = pool.ensure("u1").await.unwrap();
        let second = pool.ensure("u1").await.unwrap();
        assert_eq!(first.container_id, second.container_id);
        assert_eq!(runtime.created_containers(), vec!["sbx_u1"]);
    }

    #[tokio::test]
    async fn concurrent_ensure_creates_exactly_one_container() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = pool_with(runtime.clone(), test_config(&dir));

        let (a, b) = tokio::join!(pool.ensure("u2"), pool.ensure("u2"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(runtime.created_containers().len(), 1);
    }

    #[tokio::test]
    async fn capacity_rejection_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            max_containers: 1,
            ..test_config(&dir)
        };
        let pool = pool_with(runtime.clone(), config);

        pool.ensure("u1").await.unwrap();
        let err = pool.ensure("u2").await.unwrap_err();
        assert!(matches!(err, PoolError::Capacity { active: 1, max: 1 }));
        assert_eq!(runtime.created_containers().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_tenants_cannot_oversubscribe_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            max_containers: 1,
            ..test_config(&dir)
        };
        let pool = pool_with(runtime.clone(), config);

        // Two different tenants race through creation; the reserved slot
        // must make exactly one of them win.
        let (a, b) = tokio::join!(pool.ensure("u1"), pool.ensure("u2"));
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(PoolError::Capacity { .. })))
        );
        assert_eq!(runtime.created_containers().len(), 1);
    }

    #[tokio::test]
    async fn stale_container_is_force_removed_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_stale_container("sbx_u1");
        let pool = pool_with(runtime.clone(), test_config(&dir));

        pool.ensure("u1").await.unwrap();
        assert!(runtime.removed_containers().contains(&"sbx_u1".to_string()));
        assert_eq!(runtime.running_containers(), vec!["sbx_u1"]);
    }

    #[tokio::test]
    async fn preferred_image_is_built_when_a_dockerfile_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            image_dockerfile: Some(dir.path().join("Dockerfile")),
            ..test_config(&dir)
        };
        runtime.allow_build(&config.image);
        let pool = Arc::new(ContainerPool::new(
            config.clone(),
            runtime.clone(),
            EventService::new(),
        ));

        pool.ensure("u1").await.unwrap();
        assert_eq!(runtime.built_images(), vec![config.image]);
        assert_eq!(runtime.created_containers(), vec!["sbx_u1"]);
    }

    #[tokio::test]
    async fn failed_build_falls_back_to_the_public_image() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            image_dockerfile: Some(dir.path().join("Dockerfile")),
            ..test_config(&dir)
        };
        // No allow_build: the build fails and the pullable fallback wins.
        runtime.allow_pull(&config.fallback_image);
        let pool = Arc::new(ContainerPool::new(
            config,
            runtime.clone(),
            EventService::new(),
        ));

        pool.ensure("u1").await.unwrap();
        assert!(runtime.built_images().is_empty());
        assert_eq!(runtime.created_containers(), vec!["sbx_u1"]);
    }

    #[tokio::test]
    async fn image_falls_back_when_preferred_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.allow_pull("node:20-alpine");
        let config = test_config(&dir);
        let events = EventService::new();
        let mut sub = events.subscribe();
        let pool = ContainerPool::new(config, runtime.clone(), events);

        pool.ensure("u1").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::PullingImage));
        assert!(kinds.contains(&EventKind::ImagePulled));
        assert!(kinds.contains(&EventKind::ContainerCreated));
    }

    #[tokio::test]
    async fn all_image_options_exhausted_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = Arc::new(ContainerPool::new(
            test_config(&dir),
            runtime.clone(),
            EventService::new(),
        ));

        let err = pool.ensure("u1").await.unwrap_err();
        assert!(matches!(err, PoolError::ImageUnavailable { .. }));
        assert!(runtime.created_containers().is_empty());
        // The reserved slot is released on failure.
        assert!(pool.status_for("u1").is_none());
    }

    #[tokio::test]
    async fn remove_drops_the_record_and_the_proxy_route() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = test_config(&dir);
        let conf_path = config.proxy_conf.clone();
        let pool = pool_with(runtime.clone(), config);

        pool.ensure("u1").await.unwrap();
        assert!(
            std::fs::read_to_string(&conf_path)
                .unwrap()
                .contains("/preview/u1/")
        );

        assert!(pool.remove("u1").await);
        assert!(pool.status_for("u1").is_none());
        assert!(
            !std::fs::read_to_string(&conf_path)
                .unwrap()
                .contains("/preview/u1/")
        );

        // Removing an unknown tenant is still a safe cleanup pass.
        assert!(!pool.remove("u1").await);
    }

    #[tokio::test]
    async fn idle_eviction_respects_the_ttl_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = pool_with(runtime.clone(), test_config(&dir));

        pool.ensure("old").await.unwrap();
        pool.ensure("fresh").await.unwrap();

        let ttl = chrono::Duration::from_std(pool.config.idle_ttl).unwrap();
        if let Some(mut record) = pool.records.get_mut("old") {
            record.last_active_at = Utc::now() - ttl;
        }
        if let Some(mut record) = pool.records.get_mut("fresh") {
            record.last_active_at = Utc::now() - ttl + chrono::Duration::seconds(1);
        }

        pool.evict_idle().await;
        assert!(pool.status_for("old").is_none());
        assert!(pool.status_for("fresh").is_some());
    }

    #[tokio::test]
    async fn daemon_down_is_an_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_daemon_down(true);
        let pool = pool_with(runtime, test_config(&dir));

        let err = pool.ensure("u1").await.unwrap_err();
        assert!(err.is_environment());
    }

    #[tokio::test]
    async fn health_check_short_circuits_by_layer() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let pool = pool_with(runtime.clone(), test_config(&dir));

        // No container yet.
        let report = pool.health_check("u1").await;
        assert!(report.runtime_installed && report.daemon_running);
        assert!(!report.container_running && !report.network_reachable);

        pool.ensure("u1").await.unwrap();
        let report = pool.health_check("u1").await;
        assert!(report.container_running);
        assert!(report.network_reachable);

        runtime.set_not_installed(true);
        let report = pool.health_check("u1").await;
        assert!(!report.runtime_installed);
        assert!(!report.daemon_running && !report.container_running);
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("u1"), "sbx_u1");
        assert_eq!(container_name("user:project"), "sbx_user_project");
        assert_eq!(container_name("a/b c"), "sbx_a_b_c");
    }
}
