//! Semantic Finder (C9, §4.9): pure-cosine nearest-neighbor search over the
//! Embedding Cache, depth-limited results from the Tool Metadata Cache.
//!
//! Read-only and lock-free against cache writers: each call snapshots what
//! it needs under a short lock and does all scoring against owned copies.

use serde::{Deserialize, Serialize};

use crate::cache::metadata::MetadataCache;
use crate::embeddings::{EmbeddingEngine, dot_product};
use crate::health::HealthMonitor;
use crate::patcher::Patcher;
use crate::tool::ToolDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    /// Names only.
    Names,
    /// Names + descriptions.
    Summary,
    /// Full `inputSchema` included.
    Full,
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub limit: usize,
    pub min_confidence: f32,
    pub depth: Depth,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 5,
            min_confidence: 0.30,
            depth: Depth::Summary,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FindResult {
    pub tool_id: String,
    pub score: f32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<crate::schema::SchemaNode>,
}

fn attach_depth(tool_id: String, score: f32, tool: &ToolDescriptor, depth: Depth) -> FindResult {
    FindResult {
        tool_id,
        score,
        name: tool.name.clone(),
        description: (depth != Depth::Names).then(|| tool.description.clone()),
        input_schema: (depth == Depth::Full).then(|| tool.input_schema.clone()),
    }
}

pub struct Finder {
    engine: std::sync::Arc<EmbeddingEngine>,
    patcher: std::sync::Arc<Patcher>,
    health: std::sync::Arc<HealthMonitor>,
}

impl Finder {
    pub fn new(
        engine: std::sync::Arc<EmbeddingEngine>,
        patcher: std::sync::Arc<Patcher>,
        health: std::sync::Arc<HealthMonitor>,
    ) -> Self {
        Self { engine, patcher, health }
    }

    pub async fn find(&self, query: &str, options: &FindOptions) -> Vec<FindResult> {
        if query.trim().is_empty() {
            return self.browse(options).await;
        }

        let q = self.engine.embed(query);
        let mut candidates: Vec<(String, f32)> = {
            let _metadata = self.patcher.metadata_snapshot().await;
            self.scored_candidates(&q).await
        };

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(options.limit * 3);

        let metadata = self.patcher.metadata_snapshot().await;
        let mut results = Vec::new();
        for (tool_id, score) in candidates {
            if score < options.min_confidence {
                continue;
            }
            let Some((backend, tool_name)) = crate::tool::split_qualified_id(&tool_id) else {
                continue;
            };
            if self.health.is_quarantined(backend).await {
                continue;
            }
            let Some(tool) = metadata.tool(backend, tool_name) else {
                continue;
            };
            results.push(attach_depth(tool_id, score, tool, options.depth));
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.tool_id.cmp(&b.tool_id)));
        results.truncate(options.limit);
        results
    }

    async fn scored_candidates(&self, q: &[f32]) -> Vec<(String, f32)> {
        let metadata = self.patcher.metadata_snapshot().await;
        let mut out = Vec::new();
        for (backend, block) in metadata.backends() {
            for tool in &block.tools {
                let tool_id = tool.qualified_id(backend);
                if let Some(vector) = self.patcher.embedding_vector(&tool_id).await {
                    out.push((tool_id, dot_product(q, &vector)));
                }
            }
        }
        out
    }

    /// Empty-query path: alphabetical browse over every non-quarantined tool (§4.9 step 1).
    async fn browse(&self, options: &FindOptions) -> Vec<FindResult> {
        let metadata = self.patcher.metadata_snapshot().await;
        let mut entries: Vec<(String, &ToolDescriptor)> = Vec::new();
        for (backend, block) in metadata.backends() {
            if self.health.is_quarantined(backend).await {
                continue;
            }
            for tool in &block.tools {
                entries.push((tool.qualified_id(backend), tool));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.truncate(options.limit);
        entries
            .into_iter()
            .map(|(tool_id, tool)| attach_depth(tool_id, 0.0, tool, options.depth))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::embeddings::{EmbeddingCache, default_meta_path, default_vectors_path};
    use crate::cache::metadata::{BackendBlock, default_path as default_metadata_path};
    use crate::schema::SchemaNode;
    use crate::tool::ServerInfo;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} description"),
            input_schema: SchemaNode::Object { required: vec![], properties: Default::default() },
        }
    }

    async fn build_finder(dir: &std::path::Path) -> Finder {
        let mut metadata = MetadataCache::empty(default_metadata_path(dir), "p".into(), "now".into());
        metadata.insert(
            "fs".into(),
            BackendBlock {
                config_hash: "h".into(),
                discovered_at: "now".into(),
                server_info: ServerInfo { name: "fs-server".into(), version: "1".into() },
                tools: vec![tool("read_file"), tool("write_file")],
            },
        );

        let mut embeddings = EmbeddingCache::empty(
            default_vectors_path(dir),
            default_meta_path(dir),
            "p".into(),
            "now".into(),
            "unused".into(),
            2,
        );
        embeddings.insert("fs:read_file".into(), "fs".into(), &[1.0, 0.0], "t".into(), "now".into());
        embeddings.insert("fs:write_file".into(), "fs".into(), &[0.0, 1.0], "t".into(), "now".into());

        let engine = std::sync::Arc::new(EmbeddingEngine::new("unused").unwrap());
        let patcher = std::sync::Arc::new(crate::patcher::Patcher::new(metadata, embeddings, engine.clone()));
        let health = std::sync::Arc::new(HealthMonitor::new(3, std::time::Duration::from_secs(600)));

        Finder::new(engine, patcher, health)
    }

    #[tokio::test]
    async fn empty_query_browses_alphabetically() {
        let dir = tempfile::tempdir().unwrap();
        let finder = build_finder(dir.path()).await;
        let results = finder.find("", &FindOptions::default()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "read_file");
        assert_eq!(results[1].name, "write_file");
    }

    #[tokio::test]
    async fn quarantined_backend_excluded_from_browse() {
        let dir = tempfile::tempdir().unwrap();
        let finder = build_finder(dir.path()).await;
        finder.health.record_failure("fs", crate::error::FailureKind::Permanent).await;
        let results = finder.find("", &FindOptions::default()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn depth_names_omits_description() {
        let dir = tempfile::tempdir().unwrap();
        let finder = build_finder(dir.path()).await;
        let options = FindOptions { depth: Depth::Names, ..FindOptions::default() };
        let results = finder.find("", &options).await;
        assert!(results[0].description.is_none());
    }

    #[tokio::test]
    async fn depth_full_includes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let finder = build_finder(dir.path()).await;
        let options = FindOptions { depth: Depth::Full, ..FindOptions::default() };
        let results = finder.find("", &options).await;
        assert!(results[0].input_schema.is_some());
    }

    #[cfg(not(feature = "semantic"))]
    #[tokio::test]
    async fn low_confidence_results_filtered_out() {
        let dir = tempfile::tempdir().unwrap();
        // Without the `semantic` feature, `embed` returns an all-zero vector of
        // dimension 0, so every dot product is 0.0 — below the default 0.30 floor.
        let finder = build_finder(dir.path()).await;
        let results = finder.find("find me a file", &FindOptions::default()).await;
        assert!(results.is_empty());
    }
}
