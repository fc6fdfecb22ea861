//! Discovery Worker (C4, §4.4): stateless open-handshake-list-close per
//! backend, bounded by a hard deadline. Output feeds the Cache Patcher; the
//! worker itself never touches L1/L2.
//!
//! Concurrent discovery (initial import, `reconcile`) fans out through a
//! bounded `JoinSet`, matching the teacher's `BackendManager::start_all`
//! concurrent-backend-startup idiom.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{ConfigError, TransportError};
use crate::profile::LaunchSpec;
use crate::tool::{ServerInfo, ToolDescriptor};
use crate::transport;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_PARALLELISM: usize = 5;

#[derive(Debug)]
pub enum DiscoveryError {
    Config(ConfigError),
    Transport(TransportError),
}

pub struct DiscoveryResult {
    pub backend: String,
    pub outcome: Result<(ServerInfo, Vec<ToolDescriptor>), DiscoveryError>,
}

/// Discover one backend: open, initialize, list_tools, close — all within
/// `deadline`. A timeout forcibly drops the channel and returns
/// `TransportError::Timeout` rather than leaking the in-flight connection.
pub async fn discover_one(name: &str, spec: &LaunchSpec, deadline: Duration) -> DiscoveryResult {
    let outcome = tokio::time::timeout(deadline, run_handshake(name, spec)).await;

    let outcome = match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!(backend = name, "discovery deadline exceeded");
            Err(DiscoveryError::Transport(TransportError::Timeout))
        }
    };

    DiscoveryResult {
        backend: name.to_string(),
        outcome,
    }
}

async fn run_handshake(
    name: &str,
    spec: &LaunchSpec,
) -> Result<(ServerInfo, Vec<ToolDescriptor>), DiscoveryError> {
    let mut channel = transport::open(name, spec).await.map_err(classify)?;

    let server_info = channel.initialize().await.map_err(classify)?;
    let tools = channel.list_tools().await.map_err(classify)?;
    let _ = channel.close().await;

    info!(backend = name, tools = tools.len(), "discovered backend");
    Ok((server_info, tools))
}

/// A stdio backend that prints a recognized "missing config" pattern to
/// stderr before its handshake fails surfaces as `TransportError::Config`
/// (see `transport::stdio::spawn_stderr_capture`); route that through as a
/// permanent `ConfigError` rather than a generic transient transport fault.
fn classify(e: TransportError) -> DiscoveryError {
    match e {
        TransportError::Config(config_error) => DiscoveryError::Config(config_error),
        other => DiscoveryError::Transport(other),
    }
}

/// Open a transport, read `serverInfo`, close — skips `list_tools` entirely.
/// Used by reconcile to catch a backend that redeployed with a new version
/// behind an otherwise-unchanged launch spec, without paying for a full tool
/// listing the way a real rediscovery would.
pub async fn probe_version(name: &str, spec: &LaunchSpec, deadline: Duration) -> Option<String> {
    tokio::time::timeout(deadline, async {
        let mut channel = transport::open(name, spec).await.ok()?;
        let server_info = channel.initialize().await.ok()?;
        let _ = channel.close().await;
        Some(server_info.version)
    })
    .await
    .ok()
    .flatten()
}

/// Discover every named backend concurrently, capped at `parallelism` live
/// workers at a time (§4.4: "bounded `JoinSet` fan-out").
pub async fn discover_many(
    backends: Vec<(String, LaunchSpec)>,
    deadline: Duration,
    parallelism: usize,
) -> Vec<DiscoveryResult> {
    let mut pending = backends.into_iter();
    let mut join_set = JoinSet::new();
    let mut results = Vec::new();

    for (name, spec) in pending.by_ref().take(parallelism) {
        join_set.spawn(async move { discover_one(&name, &spec, deadline).await });
    }

    while let Some(finished) = join_set.join_next().await {
        if let Ok(result) = finished {
            results.push(result);
        }
        if let Some((name, spec)) = pending.next() {
            join_set.spawn(async move { discover_one(&name, &spec, deadline).await });
        }
    }

    results
}

/// Probe every named backend's current `serverInfo.version`, bounded the
/// same way `discover_many` is. A backend that fails to probe is simply
/// absent from the result map, which reconcile treats as "nothing new
/// observed" rather than a reason to force rediscovery on its own.
pub async fn probe_versions(
    backends: Vec<(String, LaunchSpec)>,
    deadline: Duration,
    parallelism: usize,
) -> HashMap<String, String> {
    let mut pending = backends.into_iter();
    let mut join_set = JoinSet::new();
    let mut observed = HashMap::new();

    for (name, spec) in pending.by_ref().take(parallelism) {
        join_set.spawn(async move {
            let version = probe_version(&name, &spec, deadline).await;
            (name, version)
        });
    }

    while let Some(finished) = join_set.join_next().await {
        if let Ok((name, Some(version))) = finished {
            observed.insert(name, version);
        }
        if let Some((name, spec)) = pending.next() {
            join_set.spawn(async move {
                let version = probe_version(&name, &spec, deadline).await;
                (name, version)
            });
        }
    }

    observed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Transport;
    use std::collections::BTreeMap;

    fn bogus_spec() -> LaunchSpec {
        LaunchSpec {
            transport: Transport::Stdio,
            category: "general".into(),
            command: Some("/nonexistent/binary-that-does-not-exist".into()),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn discover_one_returns_spawn_error_for_missing_command() {
        let result = discover_one("bad", &bogus_spec(), Duration::from_secs(5)).await;
        assert_eq!(result.backend, "bad");
        assert!(matches!(
            result.outcome,
            Err(DiscoveryError::Transport(TransportError::SpawnFailed(_)))
        ));
    }

    #[tokio::test]
    async fn discover_many_visits_every_backend() {
        let backends = vec![
            ("a".to_string(), bogus_spec()),
            ("b".to_string(), bogus_spec()),
            ("c".to_string(), bogus_spec()),
        ];
        let results = discover_many(backends, Duration::from_secs(5), 2).await;
        let mut names: Vec<String> = results.into_iter().map(|r| r.backend).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn probe_versions_omits_backends_it_could_not_reach() {
        let backends = vec![("bad".to_string(), bogus_spec())];
        let observed = probe_versions(backends, Duration::from_secs(5), 2).await;
        assert!(observed.is_empty());
    }
}
