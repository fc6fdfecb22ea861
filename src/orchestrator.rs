//! Orchestrator Facade (C12, §4.12): the one protocol-independent surface
//! every transport-specific front door (stdio `server.rs`, the optional
//! HTTP upstream) drives. Assembles C1–C11 and owns the background sweepers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cache::embeddings::EmbeddingCache;
use crate::cache::metadata::MetadataCache;
use crate::config::{Config, ConfigDiff, watch_config};
use crate::discovery::{self, DiscoveryError};
use crate::embeddings::EmbeddingEngine;
use crate::error::{OrchestratorError, RouterError};
use crate::finder::{FindOptions, FindResult, Finder};
use crate::health::{HealthMonitor, HealthState};
use crate::patcher::Patcher;
use crate::pool::Pool;
use crate::profile::{self, LaunchSpec, ProfileStore};
use crate::router::Router;

pub struct DiscoveryReport {
    pub backend: String,
    pub tool_count: usize,
}

pub struct Orchestrator {
    config: Arc<ArcSwap<Config>>,
    profile: Arc<ProfileStore>,
    patcher: Arc<Patcher>,
    pool: Arc<Pool>,
    health: Arc<HealthMonitor>,
    finder: Arc<Finder>,
    router: Arc<Router>,
    shutdown: Arc<Notify>,
}

impl Orchestrator {
    /// `start(profile)` (§4.12): load L1/L2, reconcile against the profile if
    /// hashes disagree, then start the idle-eviction and health sweepers.
    pub async fn start(config: Config, config_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let base_dir = config.resolved_base_dir();
        let profile_path = profile::default_profile_path(&base_dir, &config.profile_name);
        let profile = Arc::new(ProfileStore::new(profile_path));

        for (name, spec) in &config.backends {
            profile.upsert(name, spec.clone()).await.ok();
        }

        let profile_hash = profile.profile_hash().await?;
        let now = now_iso8601();

        let metadata = MetadataCache::load(
            crate::cache::metadata::default_path(&base_dir),
            profile_hash.clone(),
            now.clone(),
        )
        .await;

        let engine = Arc::new(EmbeddingEngine::new(&config.semantic.model_id)?);

        let embeddings = EmbeddingCache::load(
            crate::cache::embeddings::default_vectors_path(&base_dir),
            crate::cache::embeddings::default_meta_path(&base_dir),
            profile_hash.clone(),
            now.clone(),
            engine.model_id(),
            engine.dimension(),
        )
        .await;

        let patcher = Arc::new(Patcher::new(metadata, embeddings, Arc::clone(&engine)));

        let health = Arc::new(HealthMonitor::new(
            config.health.quarantine_threshold,
            config.health.quarantine_cooloff,
        ));
        let pool = Arc::new(Pool::new(
            config.pool.max_open_connections,
            config.pool.max_reuse_per_connection,
        ));
        let finder = Arc::new(Finder::new(Arc::clone(&engine), Arc::clone(&patcher), Arc::clone(&health)));
        let router = Arc::new(Router::new(
            Arc::clone(&profile),
            Arc::clone(&patcher),
            Arc::clone(&pool),
            Arc::clone(&health),
            Duration::from_secs(config.run_deadline_seconds),
        ));

        let shutdown = Arc::new(Notify::new());
        let config_handle = Arc::new(ArcSwap::from_pointee(config.clone()));

        let orchestrator = Arc::new(Self {
            config: config_handle,
            profile,
            patcher,
            pool,
            health,
            finder,
            router,
            shutdown,
        });

        if orchestrator.patcher.current_profile_hash().await != profile_hash {
            orchestrator.reconcile(config.discovery_deadline_seconds).await;
        }

        orchestrator.spawn_sweepers(&config);
        orchestrator.spawn_config_watcher(config_path, config.discovery_deadline_seconds);

        Ok(orchestrator)
    }

    async fn reconcile(&self, discovery_deadline_seconds: u64) {
        let doc = match self.profile.load().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "failed to load profile for reconcile");
                return;
            }
        };

        // A redeployed backend can keep the same launch spec (same config
        // hash) while reporting a new `serverInfo.version`; catch that by
        // probing only the backends already discovered, before diffing.
        let deadline = Duration::from_secs(discovery_deadline_seconds);
        let known: Vec<(String, LaunchSpec)> = {
            let metadata = self.patcher.metadata_snapshot().await;
            doc.backends
                .iter()
                .filter(|(name, _)| metadata.get(name).is_some())
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect()
        };
        let observed_versions =
            discovery::probe_versions(known, deadline, discovery::DEFAULT_PARALLELISM).await;

        let plan = self.patcher.reconcile_plan(&doc, &observed_versions).await;

        for backend in &plan.stale_removed {
            let hash = self.profile.profile_hash().await.unwrap_or_default();
            self.patcher.patch_remove(backend, hash, now_iso8601()).await;
            self.health.remove(backend);
        }

        if plan.needs_discovery.is_empty() {
            return;
        }

        let backends: Vec<(String, LaunchSpec)> = plan
            .needs_discovery
            .iter()
            .filter_map(|name| doc.backends.get(name).map(|spec| (name.clone(), spec.clone())))
            .collect();

        let results = discovery::discover_many(backends, deadline, discovery::DEFAULT_PARALLELISM).await;

        for result in results {
            self.apply_discovery_result(&doc, result).await;
        }
    }

    async fn apply_discovery_result(
        &self,
        doc: &profile::ProfileDocument,
        result: discovery::DiscoveryResult,
    ) {
        let hash = self.profile.profile_hash().await.unwrap_or_default();
        match result.outcome {
            Ok((server_info, tools)) => {
                let Some(spec) = doc.backends.get(&result.backend) else {
                    return;
                };
                let backend_description = server_info.name.clone();
                self.patcher
                    .patch_add(
                        &result.backend,
                        &spec.category,
                        &backend_description,
                        server_info,
                        tools,
                        profile::config_hash(spec),
                        hash,
                        now_iso8601(),
                    )
                    .await;
                self.health.record_success(&result.backend, Duration::from_millis(0)).await;
            }
            Err(DiscoveryError::Transport(e)) => {
                warn!(backend = result.backend, error = %e, "discovery failed");
                self.health.record_failure(&result.backend, e.failure_kind()).await;
            }
            Err(DiscoveryError::Config(e)) => {
                warn!(backend = result.backend, error = %e, "discovery blocked by config error");
                self.health
                    .record_failure(&result.backend, crate::error::FailureKind::Permanent)
                    .await;
            }
        }
    }

    fn spawn_sweepers(self: &Arc<Self>, config: &Config) {
        let pool = Arc::clone(&self.pool);
        let idle_eviction = config.pool.idle_eviction;
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(idle_eviction) => { pool.evict_idle(idle_eviction).await; }
                    _ = shutdown.notified() => return,
                }
            }
        });

        let health = Arc::clone(&self.health);
        let sweep_shutdown = Arc::clone(&self.shutdown);
        let sweep_pool = Arc::clone(&self.pool);
        let sweep_profile = Arc::clone(&self.profile);
        tokio::spawn(async move {
            health
                .run_sweep(Duration::from_secs(60), sweep_shutdown, sweep_pool, sweep_profile)
                .await;
        });
    }

    fn spawn_config_watcher(self: &Arc<Self>, config_path: PathBuf, discovery_deadline_seconds: u64) {
        let config_handle = Arc::clone(&self.config);
        let shutdown = Arc::clone(&self.shutdown);
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            watch_config(config_path, config_handle, shutdown, move |diff: ConfigDiff| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator.apply_config_diff(diff, discovery_deadline_seconds).await;
                }
            })
            .await;
        });
    }

    async fn apply_config_diff(&self, diff: ConfigDiff, discovery_deadline_seconds: u64) {
        let doc = match self.profile.load().await {
            Ok(doc) => doc,
            Err(_) => profile::ProfileDocument::default(),
        };
        let mut backends = doc.backends;

        for name in &diff.removed {
            self.profile.remove(name).await.ok();
            let hash = backends_hash(&backends);
            self.patcher.patch_remove(name, hash, now_iso8601()).await;
            self.pool.evict_backend(name).await;
            self.health.remove(name);
            backends.remove(name);
        }

        let deadline = Duration::from_secs(discovery_deadline_seconds);
        for (name, spec) in diff.added.into_iter().chain(diff.changed) {
            self.profile.upsert(&name, spec.clone()).await.ok();
            backends.insert(name.clone(), spec.clone());
            let result = discovery::discover_one(&name, &spec, deadline).await;
            let doc = profile::ProfileDocument { backends: backends.clone() };
            self.apply_discovery_result(&doc, result).await;
        }
    }

    pub async fn find(&self, query: &str, options: &FindOptions) -> Vec<FindResult> {
        self.finder.find(query, options).await
    }

    pub async fn run(&self, qualified_name: &str, args: Value) -> Result<Value, OrchestratorError> {
        self.router
            .run(qualified_name, args)
            .await
            .map_err(OrchestratorError::from)
    }

    /// `addBackend(spec)` (§4.12): upsert in profile, discover, patchAdd.
    pub async fn add_backend(&self, name: &str, spec: LaunchSpec) -> Result<DiscoveryReport, OrchestratorError> {
        self.profile
            .upsert(name, spec.clone())
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))?;

        let deadline = Duration::from_secs(30);
        let result = discovery::discover_one(name, &spec, deadline).await;
        let doc = self.profile.load().await.map_err(|e| OrchestratorError::Other(e.into()))?;

        let tool_count = match &result.outcome {
            Ok((_, tools)) => tools.len(),
            Err(_) => 0,
        };
        self.apply_discovery_result(&doc, result).await;

        if tool_count == 0 {
            return Err(OrchestratorError::Router(RouterError::Transport(
                crate::error::TransportError::ConnectFailed(format!("discovery for '{name}' produced no tools")),
            )));
        }

        Ok(DiscoveryReport { backend: name.to_string(), tool_count })
    }

    /// `removeBackend(name)` (§4.12): patchRemove, close any pooled connection.
    pub async fn remove_backend(&self, name: &str) -> Result<(), OrchestratorError> {
        self.profile
            .remove(name)
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))?;
        let hash = self.profile.profile_hash().await.unwrap_or_default();
        self.patcher.patch_remove(name, hash, now_iso8601()).await;
        self.pool.evict_backend(name).await;
        self.health.remove(name);
        Ok(())
    }

    pub async fn health(&self) -> std::collections::HashMap<String, HealthState> {
        self.health.snapshot_all().await
    }

    /// `shutdown()` (§4.12): stop sweepers, drain the pool. L1/L2 are already
    /// flushed after every patch, so there is no separate "flush if dirty" step.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        self.pool.drain().await;
        info!("orchestrator shut down");
    }
}

fn backends_hash(backends: &std::collections::BTreeMap<String, LaunchSpec>) -> String {
    profile::hash_profile_value(backends)
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso8601_produces_a_timestamp() {
        let ts = now_iso8601();
        assert!(ts.contains('T'));
    }
}
