//! Ambient configuration layer (§2a): one YAML document, environment
//! interpolation, `secretref:` resolution, validation, hot-reload.
//!
//! Grounded directly in the teacher's `config.rs` load/diff/watch pipeline;
//! `BackendConfig` is replaced by `crate::profile::LaunchSpec` and the
//! sandbox/admin-dashboard sections are dropped in favor of the fields this
//! system actually needs (health thresholds, pool bounds, upstream
//! transport).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::profile::LaunchSpec;
use crate::secrets::SecretResolver;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once. Call early in
/// `main()`, before any concurrent tasks are spawned.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: runs at most once (Once), before any task touches the env.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub backends: BTreeMap<String, LaunchSpec>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub finder: FinderConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub semantic: SemanticConfig,

    /// Base directory for all persisted state (`<base>/profiles`,
    /// `<base>/cache`, `<base>/health`, `<base>/logs`). Default: `~/.mcpmux`.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    #[serde(default = "default_profile_name")]
    pub profile_name: String,

    #[serde(default = "default_discovery_deadline")]
    pub discovery_deadline_seconds: u64,

    #[serde(default = "default_run_deadline")]
    pub run_deadline_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub strict: bool,

    #[serde(default)]
    pub providers: SecretProvidersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretProvidersConfig {
    #[serde(default)]
    pub bws: BwsProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BwsProviderConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Falls back to the `BWS_ACCESS_TOKEN` env var.
    pub access_token: Option<String>,

    /// Falls back to the `BWS_ORG_ID` env var.
    pub organization_id: Option<String>,
}

/// Health Monitor thresholds (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive transient failures before a backend is quarantined.
    #[serde(default = "default_failure_threshold")]
    pub quarantine_threshold: u32,

    /// Cool-off window before a quarantined backend auto-resets to degraded.
    #[serde(default = "default_quarantine_cooloff", with = "humantime_duration")]
    pub quarantine_cooloff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: default_failure_threshold(),
            quarantine_cooloff: default_quarantine_cooloff(),
        }
    }
}

/// Connection Pool bounds (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_open")]
    pub max_open_connections: usize,

    #[serde(default = "default_max_reuse")]
    pub max_reuse_per_connection: u32,

    #[serde(default = "default_idle_eviction", with = "humantime_duration")]
    pub idle_eviction: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_connections: default_max_open(),
            max_reuse_per_connection: default_max_reuse(),
            idle_eviction: default_idle_eviction(),
        }
    }
}

/// Semantic Finder defaults (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Upstream JSON-RPC transport (§6): stdio is always available; the
/// `http-upstream` feature additionally exposes an HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub http_enabled: bool,

    #[serde(default = "default_upstream_listen")]
    pub listen: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            http_enabled: false,
            listen: default_upstream_listen(),
        }
    }
}

/// Embedding Engine model selection (§4.5), used only when the `semantic`
/// feature is compiled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_profile_name() -> String {
    "default".to_string()
}
fn default_discovery_deadline() -> u64 {
    30
}
fn default_run_deadline() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_quarantine_cooloff() -> Duration {
    Duration::from_secs(600)
}
fn default_max_open() -> usize {
    50
}
fn default_max_reuse() -> u32 {
    1000
}
fn default_idle_eviction() -> Duration {
    Duration::from_secs(300)
}
fn default_limit() -> usize {
    5
}
fn default_min_confidence() -> f32 {
    0.30
}
fn default_upstream_listen() -> String {
    "127.0.0.1:7337".to_string()
}
fn default_model_id() -> String {
    "minishlab/potion-base-8M".to_string()
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        let parsed = if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>().map(Duration::from_secs)
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        };
        parsed.map_err(|e| serde::de::Error::custom(format!("invalid duration '{s}': {e}")))
    }
}

fn env_override<T: FromStr>(key: &str, current: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(current)
}

impl Config {
    /// Pipeline: read file → shellexpand `${VAR}` → parse YAML → apply
    /// recognized env-var overrides (§6) → validate. Secret resolution is a
    /// separate, async step (`resolve_secrets_async`) run once the tokio
    /// runtime is available.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let mut config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("base_dir_override") {
            self.base_dir = Some(PathBuf::from(dir));
        }
        self.profile_name = std::env::var("profile_name").unwrap_or(self.profile_name.clone());
        self.pool.max_open_connections =
            env_override("max_open_connections", self.pool.max_open_connections);
        self.pool.max_reuse_per_connection =
            env_override("max_reuse_per_connection", self.pool.max_reuse_per_connection);
        let idle_secs = env_override(
            "idle_eviction_seconds",
            self.pool.idle_eviction.as_secs(),
        );
        self.pool.idle_eviction = Duration::from_secs(idle_secs);
        self.run_deadline_seconds =
            env_override("run_deadline_seconds", self.run_deadline_seconds);
        self.discovery_deadline_seconds =
            env_override("discovery_deadline_seconds", self.discovery_deadline_seconds);
        self.finder.min_confidence = env_override("min_confidence", self.finder.min_confidence);
        self.debug_logging = env_override("debug_logging", self.debug_logging);
    }

    /// Resolve `secretref:` patterns across every backend's launch-affecting
    /// string fields. Must run after `load()` once the BWS provider (if
    /// enabled) has been constructed, since that requires an async SDK call.
    pub async fn resolve_secrets_async(&mut self) -> Result<()> {
        let mut resolver = SecretResolver::new(self.secrets.strict);

        #[cfg(feature = "bws")]
        {
            if self.secrets.providers.bws.enabled {
                let bws_config = &self.secrets.providers.bws;
                let access_token = match &bws_config.access_token {
                    Some(t) if !t.is_empty() => t.clone(),
                    _ => std::env::var("BWS_ACCESS_TOKEN").context(
                        "BWS enabled but access_token not in config and BWS_ACCESS_TOKEN env var not found",
                    )?,
                };
                let provider = crate::secrets::bws::BwsSdkProvider::new(
                    access_token,
                    bws_config.organization_id.clone(),
                )
                .await
                .context("failed to initialize BWS provider")?;
                resolver.register(Box::new(provider));
            }
        }

        resolver.register(Box::new(crate::secrets::EnvFallbackProvider));

        self.resolve_secrets(&resolver)
    }

    /// Resolve all secretref patterns in backend launch specs using the
    /// given resolver. Split out from `resolve_secrets_async` so tests can
    /// exercise it with a stub resolver synchronously.
    pub fn resolve_secrets(&mut self, resolver: &SecretResolver) -> Result<()> {
        for (name, backend) in self.backends.iter_mut() {
            resolver
                .resolve_option(&mut backend.command)
                .with_context(|| format!("backend '{name}' command"))?;
            for arg in backend.args.iter_mut() {
                *arg = resolver
                    .resolve_value(arg)
                    .with_context(|| format!("backend '{name}' args"))?;
            }
            resolver
                .resolve_map(&mut backend.env)
                .with_context(|| format!("backend '{name}' env"))?;
            resolver
                .resolve_option(&mut backend.url)
                .with_context(|| format!("backend '{name}' url"))?;
            resolver
                .resolve_map(&mut backend.headers)
                .with_context(|| format!("backend '{name}' headers"))?;
            if let Some(auth) = &mut backend.auth {
                auth.material = resolver
                    .resolve_value(&auth.material)
                    .with_context(|| format!("backend '{name}' auth material"))?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        use crate::profile::Transport;

        if self.pool.max_open_connections == 0 {
            anyhow::bail!("pool.max_open_connections must be >= 1");
        }
        for (name, backend) in &self.backends {
            match backend.transport {
                Transport::Stdio => {
                    if backend.command.is_none() {
                        anyhow::bail!("backend '{name}': stdio transport requires 'command'");
                    }
                }
                Transport::HttpStreaming | Transport::Sse => {
                    if backend.url.is_none() {
                        anyhow::bail!("backend '{name}': http/sse transport requires 'url'");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mcpmux")
        })
    }
}

/// Diff between the running config and a freshly reloaded one, scoped to
/// backends (the only part hot-reload acts on).
pub struct ConfigDiff {
    pub added: Vec<(String, LaunchSpec)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, LaunchSpec)>,
}

impl Config {
    pub fn diff_backends(&self, new: &Config) -> ConfigDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (name, new_spec) in &new.backends {
            match self.backends.get(name) {
                None => added.push((name.clone(), new_spec.clone())),
                Some(old_spec) if old_spec != new_spec => {
                    changed.push((name.clone(), new_spec.clone()))
                }
                _ => {}
            }
        }
        for name in self.backends.keys() {
            if !new.backends.contains_key(name) {
                removed.push(name.clone());
            }
        }

        ConfigDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Watch the config file for changes, diff backends against the live
/// `ArcSwap<Config>`, and hand the diff to the supplied callback — which, in
/// the assembled orchestrator, drives `addBackend`/`removeBackend` (§4.12).
/// Runs until `shutdown` is notified.
pub async fn watch_config<F, Fut>(
    config_path: PathBuf,
    current_config: Arc<arc_swap::ArcSwap<Config>>,
    shutdown: Arc<tokio::sync::Notify>,
    on_diff: F,
) where
    F: Fn(ConfigDiff) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        error!(path = %config_path.display(), error = %e, "failed to watch config file");
        return;
    }

    info!(path = %config_path.display(), "config file watcher started");

    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("config file changed, reloading");

                let mut new_config = match Config::load(&config_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse new config, keeping current");
                        continue;
                    }
                };

                if let Err(e) = new_config.resolve_secrets_async().await {
                    error!(error = %e, "failed to resolve secrets in new config, keeping current");
                    continue;
                }

                let old_config = current_config.load();
                let diff = old_config.diff_backends(&new_config);
                let has_changes = !diff.added.is_empty() || !diff.removed.is_empty() || !diff.changed.is_empty();

                current_config.store(Arc::new(new_config));

                if has_changes {
                    on_diff(diff).await;
                } else {
                    info!("config reloaded, no backend changes detected");
                }
            }
            _ = shutdown.notified() => {
                info!("config watcher shutting down");
                return;
            }
        }
    }
}
