//! Embedding Cache (L2, C7, §4.7): per-tool vectors plus a text sidecar,
//! keyed by `toolId`, loaded fully into memory. Discarded and rebuilt from
//! L1 whenever the stored model name differs from the engine's current one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::Envelope;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorsPayload {
    pub model_id: String,
    pub dimension: usize,
    /// `toolId -> base64(little-endian f32 vector)`.
    pub vectors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarEntry {
    pub backend: String,
    pub generated_at: String,
    pub source_text: String,
}

pub type SidecarPayload = BTreeMap<String, SidecarEntry>;

pub struct EmbeddingCache {
    vectors_path: PathBuf,
    meta_path: PathBuf,
    vectors: Envelope<VectorsPayload>,
    sidecar: Envelope<SidecarPayload>,
}

impl EmbeddingCache {
    pub fn empty(
        vectors_path: PathBuf,
        meta_path: PathBuf,
        profile_hash: String,
        now: String,
        model_id: String,
        dimension: usize,
    ) -> Self {
        Self {
            vectors_path,
            meta_path,
            vectors: Envelope::new(
                profile_hash.clone(),
                now.clone(),
                VectorsPayload {
                    model_id,
                    dimension,
                    vectors: BTreeMap::new(),
                },
            ),
            sidecar: Envelope::new(profile_hash, now, SidecarPayload::new()),
        }
    }

    /// Load both files. If the on-disk model differs from `engine_model_id`,
    /// the whole cache is discarded (§4.7: rebuilt from L1 on next patch).
    pub async fn load(
        vectors_path: PathBuf,
        meta_path: PathBuf,
        profile_hash: String,
        now: String,
        engine_model_id: &str,
        dimension: usize,
    ) -> Self {
        let vectors = super::load_envelope::<VectorsPayload>(&vectors_path).await;
        let sidecar = super::load_envelope::<SidecarPayload>(&meta_path).await;

        match (vectors, sidecar) {
            (Some(v), Some(s)) if v.payload.model_id == engine_model_id => Self {
                vectors_path,
                meta_path,
                vectors: v,
                sidecar: s,
            },
            _ => Self::empty(
                vectors_path,
                meta_path,
                profile_hash,
                now,
                engine_model_id.to_string(),
                dimension,
            ),
        }
    }

    pub fn profile_hash(&self) -> &str {
        &self.vectors.profile_hash
    }

    pub fn get(&self, tool_id: &str) -> Option<Vec<f32>> {
        let encoded = self.vectors.payload.vectors.get(tool_id)?;
        decode_vector(encoded).ok()
    }

    pub fn sidecar_text(&self, tool_id: &str) -> Option<&str> {
        self.sidecar
            .payload
            .get(tool_id)
            .map(|e| e.source_text.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, Vec<f32>)> + '_ {
        self.vectors
            .payload
            .vectors
            .iter()
            .filter_map(|(id, encoded)| decode_vector(encoded).ok().map(|v| (id, v)))
    }

    pub fn insert(&mut self, tool_id: String, backend: String, vector: &[f32], source_text: String, now: String) {
        self.vectors
            .payload
            .vectors
            .insert(tool_id.clone(), encode_vector(vector));
        self.sidecar.payload.insert(
            tool_id,
            SidecarEntry {
                backend,
                generated_at: now,
                source_text,
            },
        );
    }

    /// Drop a single tool's vector and sidecar entry (§4.8 `patchUpdate`,
    /// for tools dropped from an otherwise-kept backend).
    pub fn remove_tool(&mut self, tool_id: &str) {
        self.vectors.payload.vectors.remove(tool_id);
        self.sidecar.payload.remove(tool_id);
    }

    /// Drop every vector/sidecar entry belonging to `backend` (§4.8 `patchRemove`).
    pub fn remove_backend(&mut self, backend: &str) {
        let dead: Vec<String> = self
            .sidecar
            .payload
            .iter()
            .filter(|(_, entry)| entry.backend == backend)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            self.vectors.payload.vectors.remove(&id);
            self.sidecar.payload.remove(&id);
        }
    }

    pub fn set_profile_hash(&mut self, profile_hash: String, now: String) {
        self.vectors.profile_hash = profile_hash.clone();
        self.vectors.last_modified_at = now.clone();
        self.sidecar.profile_hash = profile_hash;
        self.sidecar.last_modified_at = now;
    }

    pub async fn save(&self) -> std::io::Result<()> {
        super::save_envelope(&self.vectors_path, &self.vectors).await?;
        super::save_envelope(&self.meta_path, &self.sidecar).await
    }
}

fn encode_vector(vector: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn decode_vector(encoded: &str) -> Result<Vec<f32>, ()> {
    let bytes = BASE64.decode(encoded).map_err(|_| ())?;
    if bytes.len() % 4 != 0 {
        return Err(());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn default_vectors_path(base_dir: &Path) -> PathBuf {
    base_dir.join("cache").join("embeddings.json")
}

pub fn default_meta_path(base_dir: &Path) -> PathBuf {
    base_dir.join("cache").join("embeddings-meta.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_vector_roundtrip() {
        let vector = vec![0.1f32, -0.2, 3.5];
        let encoded = encode_vector(&vector);
        let decoded = decode_vector(&encoded).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn decode_rejects_non_multiple_of_four_byte_length() {
        // "aGVsbG8=" decodes to 5 bytes ("hello"), not a multiple of 4.
        assert!(decode_vector("aGVsbG8=").is_err());
    }

    #[tokio::test]
    async fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let vectors_path = default_vectors_path(dir.path());
        let meta_path = default_meta_path(dir.path());

        let mut cache = EmbeddingCache::empty(
            vectors_path.clone(),
            meta_path.clone(),
            "p1".into(),
            "now".into(),
            "minishlab/potion-base-8M".into(),
            3,
        );
        cache.insert(
            "fs:read_file".into(),
            "fs".into(),
            &[0.1, 0.2, 0.3],
            "read_file. reads a file.".into(),
            "now".into(),
        );
        cache.save().await.unwrap();

        let loaded = EmbeddingCache::load(
            vectors_path,
            meta_path,
            "unused".into(),
            "unused".into(),
            "minishlab/potion-base-8M",
            3,
        )
        .await;
        assert_eq!(loaded.profile_hash(), "p1");
        let vector = loaded.get("fs:read_file").unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        assert_eq!(loaded.sidecar_text("fs:read_file"), Some("read_file. reads a file."));
    }

    #[tokio::test]
    async fn model_mismatch_discards_cache() {
        let dir = tempfile::tempdir().unwrap();
        let vectors_path = default_vectors_path(dir.path());
        let meta_path = default_meta_path(dir.path());

        let mut cache = EmbeddingCache::empty(
            vectors_path.clone(),
            meta_path.clone(),
            "p1".into(),
            "now".into(),
            "old-model".into(),
            3,
        );
        cache.insert("fs:read_file".into(), "fs".into(), &[0.1, 0.2, 0.3], "text".into(), "now".into());
        cache.save().await.unwrap();

        let loaded = EmbeddingCache::load(
            vectors_path,
            meta_path,
            "fresh".into(),
            "now2".into(),
            "new-model",
            3,
        )
        .await;
        assert!(loaded.get("fs:read_file").is_none());
        assert_eq!(loaded.profile_hash(), "fresh");
    }

    #[test]
    fn remove_backend_drops_its_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EmbeddingCache::empty(
            default_vectors_path(dir.path()),
            default_meta_path(dir.path()),
            "p1".into(),
            "now".into(),
            "model".into(),
            2,
        );
        cache.insert("fs:read_file".into(), "fs".into(), &[0.1, 0.2], "t".into(), "now".into());
        cache.insert("gh:search".into(), "gh".into(), &[0.3, 0.4], "t".into(), "now".into());
        cache.remove_backend("fs");
        assert!(cache.get("fs:read_file").is_none());
        assert!(cache.get("gh:search").is_some());
    }
}
