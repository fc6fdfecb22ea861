//! Profile Store (C1): the set of configured backends, persisted as one
//! document, with content-hash functions gating cache invalidation.
//!
//! Grounded in the teacher's `config.rs` `BackendConfig`/`Transport` shape,
//! generalized to the spec's `LaunchSpec` vocabulary and extended with the
//! SHA-256 `configHash`/`profileHash` functions the teacher's `PartialEq`-based
//! diffing doesn't provide.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    HttpStreaming,
    Sse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Bearer,
    Basic,
    ApiKey,
    Oauth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    pub kind: AuthKind,
    /// Either a literal value or a `secretref:<provider>:<key>` handle resolved
    /// by the ambient config pipeline before this spec reaches the Profile Store.
    pub material: String,
}

/// Everything needed to launch a connection to one backend. Launch-affecting
/// fields are exactly the ones folded into `configHash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub transport: Transport,
    /// Free-text capability hint used to look up domain augmentation phrases (§4.5).
    #[serde(default = "default_category")]
    pub category: String,

    // stdio fields
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,

    // http/sse fields
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("backend '{0}' not found in profile")]
    NotFound(String),
    #[error("backend '{0}' already exists in profile")]
    AlreadyExists(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// The persisted document: `backendName -> LaunchSpec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDocument {
    pub backends: BTreeMap<String, LaunchSpec>,
}

/// File-backed Profile Store. Reads/writes are read-modify-write guarded by
/// an in-process mutex; the on-disk write is an atomic tmp+rename so
/// concurrent CLI/server processes never observe a half-written document.
pub struct ProfileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<ProfileDocument, ProfileError> {
        let _guard = self.lock.lock().await;
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<ProfileDocument, ProfileError> {
        if !self.path.exists() {
            return Ok(ProfileDocument::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save_unlocked(&self, doc: &ProfileDocument) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(doc)?;
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(data.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<LaunchSpec, ProfileError> {
        let doc = self.load().await?;
        doc.backends
            .get(name)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<BTreeMap<String, LaunchSpec>, ProfileError> {
        Ok(self.load().await?.backends)
    }

    pub async fn upsert(&self, name: &str, spec: LaunchSpec) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_unlocked()?;
        doc.backends.insert(name.to_string(), spec);
        self.save_unlocked(&doc)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_unlocked()?;
        if doc.backends.remove(name).is_none() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        self.save_unlocked(&doc)
    }

    pub async fn profile_hash(&self) -> Result<String, ProfileError> {
        Ok(hash_profile(&self.load().await?))
    }
}

/// Canonical serialization of one `LaunchSpec`: a `serde_json::Value` with
/// object keys already sorted (serde_json's default map is a `BTreeMap`
/// under `preserve_order` being off, which this crate does not enable),
/// printed compactly with no insignificant whitespace.
fn canonical(spec: &LaunchSpec) -> String {
    let value = serde_json::to_value(spec).expect("LaunchSpec always serializes");
    value.to_string()
}

/// `configHash`: SHA-256 hex digest of one backend's canonical serialization.
pub fn config_hash(spec: &LaunchSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(spec).as_bytes());
    hex(&hasher.finalize())
}

/// `profileHash`: SHA-256 hex digest over the sorted list of
/// `(backend_name, configHash)` pairs — not the full profile — so unrelated
/// field churn or reordering never invalidates L1/L2.
pub fn hash_profile(doc: &ProfileDocument) -> String {
    let mut pairs: Vec<(String, String)> = doc
        .backends
        .iter()
        .map(|(name, spec)| (name.clone(), config_hash(spec)))
        .collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (name, hash) in &pairs {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b";");
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Load a `ProfileDocument` straight from a value already in memory, used by
/// the config hot-reload path which parses the profile out of the main YAML
/// config document rather than a dedicated file.
pub fn hash_profile_value(backends: &BTreeMap<String, LaunchSpec>) -> String {
    hash_profile(&ProfileDocument {
        backends: backends.clone(),
    })
}

pub fn default_profile_path(base_dir: &Path, profile_name: &str) -> PathBuf {
    base_dir.join("profiles").join(format!("{profile_name}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            transport: Transport::Stdio,
            category: "general".into(),
            command: Some(command.into()),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profile.json"));
        store.upsert("fs", spec("fs-server")).await.unwrap();
        let got = store.get("fs").await.unwrap();
        assert_eq!(got.command.as_deref(), Some("fs-server"));
    }

    #[tokio::test]
    async fn remove_missing_backend_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profile.json"));
        let err = store.remove("nope").await.unwrap_err();
        assert!(matches!(err, ProfileError::NotFound(_)));
    }

    #[test]
    fn config_hash_is_stable_and_order_independent() {
        let a = spec("fs-server");
        let h1 = config_hash(&a);
        let h2 = config_hash(&a);
        assert_eq!(h1, h2);
    }

    #[test]
    fn config_hash_changes_with_command() {
        assert_ne!(config_hash(&spec("a")), config_hash(&spec("b")));
    }

    #[test]
    fn profile_hash_ignores_insertion_order() {
        let mut doc1 = ProfileDocument::default();
        doc1.backends.insert("a".into(), spec("a-cmd"));
        doc1.backends.insert("b".into(), spec("b-cmd"));

        let mut doc2 = ProfileDocument::default();
        doc2.backends.insert("b".into(), spec("b-cmd"));
        doc2.backends.insert("a".into(), spec("a-cmd"));

        assert_eq!(hash_profile(&doc1), hash_profile(&doc2));
    }

    #[test]
    fn profile_hash_changes_when_backend_removed() {
        let mut doc = ProfileDocument::default();
        doc.backends.insert("a".into(), spec("a-cmd"));
        let h1 = hash_profile(&doc);
        doc.backends.remove("a");
        let h2 = hash_profile(&doc);
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn profile_hash_via_store_matches_direct() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profile.json"));
        store.upsert("fs", spec("fs-server")).await.unwrap();
        let doc = store.load().await.unwrap();
        assert_eq!(store.profile_hash().await.unwrap(), hash_profile(&doc));
    }
}
