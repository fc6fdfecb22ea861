//! Invocation Router (C10, §4.10): validates and dispatches one `run()` call,
//! threading the result through the Connection Pool and Health Monitor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;

use crate::cache::metadata::MetadataCache;
use crate::error::{FailureKind, RouterError, TransportError};
use crate::health::HealthMonitor;
use crate::pool::Pool;
use crate::profile::ProfileStore;
use crate::schema;
use crate::tool::split_qualified_id;
use crate::transport::ToolOutcome;

pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(60);

pub struct Router {
    profile: Arc<ProfileStore>,
    patcher: Arc<crate::patcher::Patcher>,
    pool: Arc<Pool>,
    health: Arc<HealthMonitor>,
    call_deadline: Duration,
}

impl Router {
    pub fn new(
        profile: Arc<ProfileStore>,
        patcher: Arc<crate::patcher::Patcher>,
        pool: Arc<Pool>,
        health: Arc<HealthMonitor>,
        call_deadline: Duration,
    ) -> Self {
        Self { profile, patcher, pool, health, call_deadline }
    }

    pub async fn run(&self, qualified_name: &str, args: Value) -> Result<Value, RouterError> {
        let (backend, tool_name) = split_qualified_id(qualified_name)
            .ok_or_else(|| RouterError::InvalidToolId(qualified_name.to_string()))?;

        let tool = {
            let metadata = self.patcher.metadata_snapshot().await;
            metadata
                .tool(backend, tool_name)
                .cloned()
                .ok_or_else(|| RouterError::UnknownTool(qualified_name.to_string()))?
        };

        if self.health.is_quarantined(backend).await {
            return Err(RouterError::BackendQuarantined(backend.to_string()));
        }

        let field_errors = schema::validate(&tool.input_schema, &args);
        if !field_errors.is_empty() {
            let messages: Vec<String> = field_errors.iter().map(|e| e.to_string()).collect();
            return Err(RouterError::InvalidArguments(messages.join("; ")));
        }

        let spec = self
            .profile
            .get(backend)
            .await
            .map_err(|e| RouterError::Transport(TransportError::ConnectFailed(e.to_string())))?;

        let mut conn = match self.pool.acquire(backend, &spec, &self.health).await {
            Ok(conn) => conn,
            Err(e) => {
                self.health.record_failure(backend, FailureKind::Transient).await;
                return Err(RouterError::Transport(e));
            }
        };

        let started = Instant::now();
        let call = tokio::time::timeout(self.call_deadline, conn.channel_mut().call_tool(tool_name, args));

        match call.await {
            Ok(Ok(ToolOutcome::Success(result))) => {
                self.health.record_success(backend, started.elapsed()).await;
                self.pool.release(conn).await;
                Ok(result)
            }
            Ok(Ok(ToolOutcome::ToolError(value))) => {
                // The backend handled the call and reported its own error;
                // the connection is fine and the failure isn't ours to count.
                self.health.record_success(backend, started.elapsed()).await;
                self.pool.release(conn).await;
                Err(RouterError::ToolError(value))
            }
            Ok(Err(e)) => {
                self.health.record_failure(backend, e.failure_kind()).await;
                self.pool.discard(conn).await;
                Err(RouterError::Transport(e))
            }
            Err(_) => {
                warn!(backend, tool = tool_name, "call_tool timed out");
                self.health.record_failure(backend, FailureKind::Transient).await;
                self.pool.discard(conn).await;
                Err(RouterError::Transport(TransportError::Timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::embeddings::{EmbeddingCache, default_meta_path, default_vectors_path};
    use crate::cache::metadata::{BackendBlock, default_path as default_metadata_path};
    use crate::embeddings::EmbeddingEngine;
    use crate::profile::{LaunchSpec, Transport};
    use crate::schema::SchemaNode;
    use crate::tool::{ServerInfo, ToolDescriptor};
    use std::collections::BTreeMap;

    fn tool() -> ToolDescriptor {
        ToolDescriptor {
            name: "read_file".into(),
            description: "reads a file".into(),
            input_schema: SchemaNode::Object {
                required: vec!["path".into()],
                properties: BTreeMap::from([(
                    "path".to_string(),
                    SchemaNode::String { pattern: None, enum_values: None },
                )]),
            },
        }
    }

    async fn build_router(dir: &std::path::Path) -> Router {
        let mut metadata = MetadataCache::empty(default_metadata_path(dir), "p".into(), "now".into());
        metadata.insert(
            "fs".into(),
            BackendBlock {
                config_hash: "h".into(),
                discovered_at: "now".into(),
                server_info: ServerInfo { name: "fs".into(), version: "1".into() },
                tools: vec![tool()],
            },
        );
        let embeddings = EmbeddingCache::empty(
            default_vectors_path(dir),
            default_meta_path(dir),
            "p".into(),
            "now".into(),
            "unused".into(),
            0,
        );
        let engine = Arc::new(EmbeddingEngine::new("unused").unwrap());
        let patcher = Arc::new(crate::patcher::Patcher::new(metadata, embeddings, engine));

        let profile = Arc::new(ProfileStore::new(dir.join("profile.json")));
        profile
            .upsert(
                "fs",
                LaunchSpec {
                    transport: Transport::Stdio,
                    category: "general".into(),
                    command: Some("/nonexistent/binary".into()),
                    args: vec![],
                    env: BTreeMap::new(),
                    cwd: None,
                    url: None,
                    headers: BTreeMap::new(),
                    auth: None,
                },
            )
            .await
            .unwrap();

        let pool = Arc::new(Pool::new(50, 1000));
        let health = Arc::new(HealthMonitor::new(3, Duration::from_secs(600)));

        Router::new(profile, patcher, pool, health, DEFAULT_CALL_DEADLINE)
    }

    #[tokio::test]
    async fn invalid_qualified_id_rejected_before_any_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).await;
        let err = router.run("not-qualified", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidToolId(_)));
    }

    #[tokio::test]
    async fn unknown_tool_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).await;
        let err = router.run("fs:nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RouterError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn missing_required_argument_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).await;
        let err = router.run("fs:read_file", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn quarantined_backend_rejected_before_pool_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).await;
        router.health.record_failure("fs", FailureKind::Permanent).await;
        let err = router
            .run("fs:read_file", serde_json::json!({"path": "/tmp/x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::BackendQuarantined(_)));
    }

    #[tokio::test]
    async fn transport_failure_counts_against_health() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(dir.path()).await;
        let err = router
            .run("fs:read_file", serde_json::json!({"path": "/tmp/x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Transport(_)));
        let snapshot = router.health.snapshot("fs").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
    }
}
