//! Cache Patcher (C8, §4.8): the only writer of L1/L2. `patchAdd`/
//! `patchRemove`/`patchUpdate`/`reconcile`, each atomic at the per-file
//! level and serialized through one process-wide mutex so concurrent
//! discovery completions never interleave their writes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::cache::embeddings::EmbeddingCache;
use crate::cache::metadata::{BackendBlock, MetadataCache};
use crate::embeddings::{EmbeddingEngine, embed_source_text};
use crate::profile::{self, LaunchSpec, ProfileDocument};
use crate::tool::{ServerInfo, ToolDescriptor};

pub struct Patcher {
    lock: Mutex<()>,
    metadata: Mutex<MetadataCache>,
    embeddings: Mutex<EmbeddingCache>,
    engine: Arc<EmbeddingEngine>,
}

impl Patcher {
    pub fn new(metadata: MetadataCache, embeddings: EmbeddingCache, engine: Arc<EmbeddingEngine>) -> Self {
        Self {
            lock: Mutex::new(()),
            metadata: Mutex::new(metadata),
            embeddings: Mutex::new(embeddings),
            engine,
        }
    }

    pub async fn metadata_snapshot(&self) -> tokio::sync::MutexGuard<'_, MetadataCache> {
        self.metadata.lock().await
    }

    pub async fn embedding_vector(&self, tool_id: &str) -> Option<Vec<f32>> {
        self.embeddings.lock().await.get(tool_id)
    }

    /// Insert or replace a backend's block in L1, embed its tools (reusing
    /// sidecar text when unchanged), write L2, then bump `profileHash` on
    /// both files.
    pub async fn patch_add(
        &self,
        backend: &str,
        backend_category: &str,
        backend_description: &str,
        server_info: ServerInfo,
        tools: Vec<ToolDescriptor>,
        config_hash: String,
        profile_hash: String,
        now: String,
    ) {
        let _guard = self.lock.lock().await;

        let mut metadata = self.metadata.lock().await;
        let mut embeddings = self.embeddings.lock().await;

        self.embed_tools(&mut embeddings, backend, backend_category, backend_description, &tools, &now)
            .await;

        metadata.insert(
            backend.to_string(),
            BackendBlock {
                config_hash,
                discovered_at: now.clone(),
                server_info,
                tools,
            },
        );

        metadata.set_profile_hash(profile_hash.clone(), now.clone());
        embeddings.set_profile_hash(profile_hash, now);

        metadata.save().await.ok();
        embeddings.save().await.ok();
        info!(backend, "patched cache: backend added");
    }

    pub async fn patch_remove(&self, backend: &str, profile_hash: String, now: String) {
        let _guard = self.lock.lock().await;

        let mut metadata = self.metadata.lock().await;
        let mut embeddings = self.embeddings.lock().await;

        metadata.remove(backend);
        embeddings.remove_backend(backend);

        metadata.set_profile_hash(profile_hash.clone(), now.clone());
        embeddings.set_profile_hash(profile_hash, now);

        metadata.save().await.ok();
        embeddings.save().await.ok();
        info!(backend, "patched cache: backend removed");
    }

    /// Remove-then-add, but computed as a diff: tools unchanged in
    /// name+description keep their vectors; new/changed tools re-embed;
    /// dropped tools lose their vectors (§4.8 `patchUpdate`).
    #[allow(clippy::too_many_arguments)]
    pub async fn patch_update(
        &self,
        backend: &str,
        backend_category: &str,
        backend_description: &str,
        server_info: ServerInfo,
        tools: Vec<ToolDescriptor>,
        config_hash: String,
        profile_hash: String,
        now: String,
    ) {
        let _guard = self.lock.lock().await;

        let mut metadata = self.metadata.lock().await;
        let mut embeddings = self.embeddings.lock().await;

        let previous_names: Vec<String> = metadata
            .get(backend)
            .map(|b| b.tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default();
        let current_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        for dropped in previous_names.iter().filter(|n| !current_names.contains(n)) {
            let tool_id = format!("{backend}:{dropped}");
            embeddings.remove_tool(&tool_id);
        }

        self.embed_tools(&mut embeddings, backend, backend_category, backend_description, &tools, &now)
            .await;

        metadata.insert(
            backend.to_string(),
            BackendBlock {
                config_hash,
                discovered_at: now.clone(),
                server_info,
                tools,
            },
        );

        metadata.set_profile_hash(profile_hash.clone(), now.clone());
        embeddings.set_profile_hash(profile_hash, now);

        metadata.save().await.ok();
        embeddings.save().await.ok();
        info!(backend, "patched cache: backend updated");
    }

    /// Embed each tool, reusing the existing vector when the source text is
    /// unchanged from the sidecar's last recorded text.
    async fn embed_tools(
        &self,
        embeddings: &mut EmbeddingCache,
        backend: &str,
        backend_category: &str,
        backend_description: &str,
        tools: &[ToolDescriptor],
        now: &str,
    ) {
        let mut to_embed = Vec::new();
        let mut source_texts = Vec::with_capacity(tools.len());

        for tool in tools {
            let tool_id = tool.qualified_id(backend);
            let source_text = embed_source_text(
                &tool.name,
                &tool.description,
                &tool.param_summary(),
                backend_description,
                backend_category,
            );
            let unchanged = embeddings.sidecar_text(&tool_id) == Some(source_text.as_str());
            source_texts.push((tool_id, source_text, unchanged));
        }

        for (_, text, unchanged) in &source_texts {
            if !unchanged {
                to_embed.push(text.clone());
            }
        }

        let mut vectors = self.engine.embed_batch(&to_embed).into_iter();

        for (tool_id, source_text, unchanged) in source_texts {
            if unchanged {
                continue;
            }
            let vector = vectors.next().expect("one vector per unembedded text");
            embeddings.insert(tool_id, backend.to_string(), &vector, source_text, now.to_string());
        }
    }

    /// Full scan against the current profile: rediscover anything missing,
    /// stale, or whose backend reports a version `observed_versions` didn't
    /// see last time (a redeploy behind an unchanged launch spec), drop
    /// anything no longer configured. Returns the backend names that need
    /// rediscovery so the caller can run the Discovery Worker.
    pub async fn reconcile_plan(
        &self,
        profile: &ProfileDocument,
        observed_versions: &HashMap<String, String>,
    ) -> ReconcilePlan {
        let metadata = self.metadata.lock().await;
        let mut needs_discovery = Vec::new();
        let mut stale_removed = Vec::new();

        for (name, spec) in &profile.backends {
            let expected_hash = profile::config_hash(spec);
            match metadata.get(name) {
                Some(block)
                    if block.config_hash == expected_hash
                        && observed_versions
                            .get(name)
                            .is_none_or(|v| v == &block.server_info.version) => {}
                _ => needs_discovery.push(name.clone()),
            }
        }

        for name in metadata.backend_names() {
            if !profile.backends.contains_key(&name) {
                stale_removed.push(name);
            }
        }

        ReconcilePlan {
            needs_discovery,
            stale_removed,
        }
    }

    pub async fn current_profile_hash(&self) -> String {
        self.metadata.lock().await.profile_hash().to_string()
    }
}

pub struct ReconcilePlan {
    pub needs_discovery: Vec<String>,
    pub stale_removed: Vec<String>,
}
