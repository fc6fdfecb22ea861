//! Tool Metadata Cache (L1, C6, §4.6): `backend -> {configHash, serverInfo,
//! tools[]}`, the source of truth for `find`/`run` schemas — never re-fetched
//! from the backend at query time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Envelope;
use crate::tool::{ServerInfo, ToolDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendBlock {
    pub config_hash: String,
    pub discovered_at: String,
    pub server_info: ServerInfo,
    pub tools: Vec<ToolDescriptor>,
}

pub type Payload = BTreeMap<String, BackendBlock>;

pub struct MetadataCache {
    path: PathBuf,
    envelope: Envelope<Payload>,
}

impl MetadataCache {
    pub fn empty(path: PathBuf, profile_hash: String, now: String) -> Self {
        Self {
            path,
            envelope: Envelope::new(profile_hash, now, Payload::new()),
        }
    }

    /// Load from disk, falling back to an empty cache if none exists or the
    /// file is unreadable (§4.6: "load: synchronous at startup").
    pub async fn load(path: PathBuf, profile_hash: String, now: String) -> Self {
        match super::load_envelope::<Payload>(&path).await {
            Some(envelope) => Self { path, envelope },
            None => Self::empty(path, profile_hash, now),
        }
    }

    pub fn profile_hash(&self) -> &str {
        &self.envelope.profile_hash
    }

    pub fn get(&self, backend: &str) -> Option<&BackendBlock> {
        self.envelope.payload.get(backend)
    }

    pub fn backends(&self) -> impl Iterator<Item = (&String, &BackendBlock)> {
        self.envelope.payload.iter()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.envelope.payload.keys().cloned().collect()
    }

    pub fn tool(&self, backend: &str, tool_name: &str) -> Option<&ToolDescriptor> {
        self.envelope
            .payload
            .get(backend)?
            .tools
            .iter()
            .find(|t| t.name == tool_name)
    }

    pub fn insert(&mut self, backend: String, block: BackendBlock) {
        self.envelope.payload.insert(backend, block);
    }

    pub fn remove(&mut self, backend: &str) -> Option<BackendBlock> {
        self.envelope.payload.remove(backend)
    }

    pub fn set_profile_hash(&mut self, profile_hash: String, now: String) {
        self.envelope.profile_hash = profile_hash;
        self.envelope.last_modified_at = now;
    }

    pub async fn save(&self) -> std::io::Result<()> {
        super::save_envelope(&self.path, &self.envelope).await
    }
}

pub fn default_path(base_dir: &Path) -> PathBuf {
    base_dir.join("cache").join("tool-metadata.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaNode;

    fn sample_block() -> BackendBlock {
        BackendBlock {
            config_hash: "hash1".into(),
            discovered_at: "2026-01-01T00:00:00Z".into(),
            server_info: ServerInfo {
                name: "fs-server".into(),
                version: "1.0.0".into(),
            },
            tools: vec![ToolDescriptor {
                name: "read_file".into(),
                description: "reads a file".into(),
                input_schema: SchemaNode::Object {
                    required: vec![],
                    properties: Default::default(),
                },
            }],
        }
    }

    #[tokio::test]
    async fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());

        let mut cache = MetadataCache::empty(path.clone(), "p1".into(), "2026-01-01T00:00:00Z".into());
        cache.insert("fs".into(), sample_block());
        cache.save().await.unwrap();

        let loaded = MetadataCache::load(path, "unused".into(), "unused".into()).await;
        assert_eq!(loaded.profile_hash(), "p1");
        assert!(loaded.get("fs").is_some());
        assert!(loaded.tool("fs", "read_file").is_some());
    }

    #[tokio::test]
    async fn missing_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        let cache = MetadataCache::load(path, "fresh".into(), "now".into()).await;
        assert_eq!(cache.profile_hash(), "fresh");
        assert!(cache.get("fs").is_none());
    }

    #[test]
    fn remove_drops_backend_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_path(dir.path());
        let mut cache = MetadataCache::empty(path, "p1".into(), "now".into());
        cache.insert("fs".into(), sample_block());
        assert!(cache.remove("fs").is_some());
        assert!(cache.get("fs").is_none());
    }
}
