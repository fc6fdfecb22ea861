//! On-disk cache layer: L1 tool metadata (§4.6) and L2 embeddings (§4.7),
//! each wrapped in the same envelope and written the same atomic way.
//!
//! Grounded in the teacher's `cache.rs` (version field, atomic tmp+rename
//! write, warn-and-skip-on-corruption load), split into two files per
//! backend here instead of the teacher's single bundled document, since the
//! two layers are invalidated and rebuilt independently (L2 can be dropped
//! and rebuilt from L1 alone on a model change; L1 never depends on L2).

pub mod embeddings;
pub mod metadata;

use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

pub const SCHEMA_VERSION: u32 = 1;

/// Shared envelope for both cache layers (§4.6 P2: `profileHash` consistency
/// across L1 and L2).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope<T> {
    pub schema_version: u32,
    pub profile_hash: String,
    pub last_modified_at: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(profile_hash: String, last_modified_at: String, payload: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            profile_hash,
            last_modified_at,
            payload,
        }
    }
}

/// Load a JSON envelope from disk. Missing file or corrupt/incompatible
/// contents are both treated as "no cache yet" rather than a hard error,
/// matching the teacher's `load()` behavior of warning and returning empty.
pub(crate) async fn load_envelope<T: DeserializeOwned>(path: &Path) -> Option<Envelope<T>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(_) => return None,
    };
    match serde_json::from_str::<Envelope<T>>(&data) {
        Ok(envelope) if envelope.schema_version <= SCHEMA_VERSION => Some(envelope),
        Ok(envelope) => {
            warn!(version = envelope.schema_version, path = %path.display(), "cache schema newer than supported, ignoring");
            None
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "invalid cache file, ignoring");
            None
        }
    }
}

/// Atomic write: serialize, write to `<path>.tmp`, rename over `path`.
pub(crate) async fn save_envelope<T: Serialize + Sync>(
    path: &Path,
    envelope: &Envelope<T>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(envelope)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/cache.json");
        let envelope = Envelope::new("abc".to_string(), "2026-01-01T00:00:00Z".to_string(), json!({"k": "v"}));
        save_envelope(&path, &envelope).await.unwrap();
        assert!(path.exists());
        let loaded: Envelope<serde_json::Value> = load_envelope(&path).await.unwrap();
        assert_eq!(loaded.profile_hash, "abc");
        assert_eq!(loaded.payload["k"], "v");
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let loaded: Option<Envelope<serde_json::Value>> =
            load_envelope(Path::new("/nonexistent/cache.json")).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let loaded: Option<Envelope<serde_json::Value>> = load_envelope(&path).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn future_schema_version_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let future = json!({
            "schema_version": SCHEMA_VERSION + 1,
            "profile_hash": "x",
            "last_modified_at": "x",
            "payload": {},
        });
        tokio::fs::write(&path, future.to_string()).await.unwrap();
        let loaded: Option<Envelope<serde_json::Value>> = load_envelope(&path).await;
        assert!(loaded.is_none());
    }
}
