//! Credential provider abstraction (§9 design notes).
//!
//! By the time a `LaunchSpec` reaches here, any `secretref:` handle in its
//! `auth.material` has already been resolved to a literal by the config-load
//! secret-resolution pass (see `crate::secrets`) — that pass runs once,
//! before the Profile Store is populated. `CredentialProvider` is therefore a
//! thinner runtime-facing cache in front of the Profile Store: the Transport
//! Factory looks up a provider once per backend and caches the result,
//! without needing to know whether the material came from a literal config
//! value or a resolved secret. `invalidate` drops the cache entry so a
//! changed or rotated credential is picked up from the store on next use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::profile::{AuthKind, ProfileStore};

#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: AuthKind,
    pub material: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_for_backend(&self, backend: &str) -> anyhow::Result<Option<Credential>>;
    fn invalidate(&self, backend: &str);
}

/// Resolves `secretref:env:<VAR>` handles (and bare literals) from the
/// process environment. This is the always-available default; it requires
/// no external service.
pub struct EnvCredentialProvider {
    cache: DashMap<String, Credential>,
    overrides: HashMap<String, Credential>,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Register an explicit credential for a backend, bypassing env lookup.
    /// Used in tests and for auth specs whose material is already a literal.
    pub fn with_override(mut self, backend: &str, cred: Credential) -> Self {
        self.overrides.insert(backend.to_string(), cred);
        self
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_for_backend(&self, backend: &str) -> anyhow::Result<Option<Credential>> {
        if let Some(cred) = self.cache.get(backend) {
            return Ok(Some(cred.clone()));
        }
        if let Some(cred) = self.overrides.get(backend) {
            self.cache.insert(backend.to_string(), cred.clone());
            return Ok(Some(cred.clone()));
        }
        let var = format!("{}_TOKEN", backend.to_uppercase().replace('-', "_"));
        match std::env::var(&var) {
            Ok(material) => {
                let cred = Credential {
                    kind: AuthKind::Bearer,
                    material,
                };
                self.cache.insert(backend.to_string(), cred.clone());
                Ok(Some(cred))
            }
            Err(_) => Ok(None),
        }
    }

    fn invalidate(&self, backend: &str) {
        self.cache.remove(backend);
    }
}

/// Resolve a `secretref:<provider>:<key>` string through whichever provider
/// handles that scheme. Values that don't match the pattern pass through
/// unchanged (they are already literal material). Kept here only for call
/// sites that need a quick presence check; actual resolution happens once,
/// at config load, via `crate::secrets::SecretResolver`.
pub fn is_secret_ref(value: &str) -> bool {
    value.starts_with("secretref:")
}

pub fn parse_secret_ref(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix("secretref:")?;
    rest.split_once(':')
}

/// The header name/value a `Credential` attaches to an outgoing request,
/// following the same kind-to-header mapping whichever provider resolved it.
pub fn to_header(cred: &Credential) -> (String, String) {
    match cred.kind {
        AuthKind::Bearer | AuthKind::Oauth => ("Authorization".to_string(), format!("Bearer {}", cred.material)),
        AuthKind::Basic => ("Authorization".to_string(), format!("Basic {}", cred.material)),
        AuthKind::ApiKey => ("X-API-Key".to_string(), cred.material.clone()),
    }
}

pub type SharedCredentialProvider = Arc<dyn CredentialProvider>;

/// Default production provider: reads already-resolved `AuthSpec` material
/// straight out of the Profile Store and caches it per backend. Backed by
/// whatever the config pipeline put there — a literal config value, an env
/// var, or a secret resolved through `crate::secrets` at load time.
pub struct ProfileCredentialProvider {
    store: Arc<ProfileStore>,
    cache: DashMap<String, Credential>,
}

impl ProfileCredentialProvider {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for ProfileCredentialProvider {
    async fn get_for_backend(&self, backend: &str) -> anyhow::Result<Option<Credential>> {
        if let Some(cred) = self.cache.get(backend) {
            return Ok(Some(cred.clone()));
        }
        let spec = match self.store.get(backend).await {
            Ok(spec) => spec,
            Err(crate::profile::ProfileError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(auth) = spec.auth else {
            return Ok(None);
        };
        let cred = Credential {
            kind: auth.kind,
            material: auth.material,
        };
        self.cache.insert(backend.to_string(), cred.clone());
        Ok(Some(cred))
    }

    fn invalidate(&self, backend: &str) {
        self.cache.remove(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_ref_parsing() {
        assert!(is_secret_ref("secretref:bws:GH_TOKEN"));
        assert!(!is_secret_ref("plain-value"));
        assert_eq!(
            parse_secret_ref("secretref:bws:GH_TOKEN"),
            Some(("bws", "GH_TOKEN"))
        );
        assert_eq!(parse_secret_ref("not-a-ref"), None);
    }

    #[tokio::test]
    async fn env_provider_resolves_override_before_env() {
        let provider = EnvCredentialProvider::new().with_override(
            "fs",
            Credential {
                kind: AuthKind::Bearer,
                material: "literal-token".into(),
            },
        );
        let cred = provider.get_for_backend("fs").await.unwrap().unwrap();
        assert_eq!(cred.material, "literal-token");
    }

    #[tokio::test]
    async fn env_provider_returns_none_when_unset() {
        let provider = EnvCredentialProvider::new();
        let cred = provider
            .get_for_backend("definitely-unset-backend-xyz")
            .await
            .unwrap();
        assert!(cred.is_none());
    }

    #[tokio::test]
    async fn invalidate_clears_cache() {
        let provider = EnvCredentialProvider::new().with_override(
            "fs",
            Credential {
                kind: AuthKind::Bearer,
                material: "t".into(),
            },
        );
        provider.get_for_backend("fs").await.unwrap();
        provider.invalidate("fs");
        // Override map still has it, so it resolves again through cache-miss path.
        assert!(provider.get_for_backend("fs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn profile_provider_reads_resolved_auth_material() {
        use crate::profile::{AuthSpec, LaunchSpec, Transport};
        use std::collections::BTreeMap;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path().join("profile.json")));
        store
            .upsert(
                "gh",
                LaunchSpec {
                    transport: Transport::HttpStreaming,
                    category: "vcs".into(),
                    command: None,
                    args: vec![],
                    env: BTreeMap::new(),
                    cwd: None,
                    url: Some("https://example.invalid/mcp".into()),
                    headers: BTreeMap::new(),
                    auth: Some(AuthSpec {
                        kind: AuthKind::Bearer,
                        material: "already-resolved-token".into(),
                    }),
                },
            )
            .await
            .unwrap();

        let provider = ProfileCredentialProvider::new(store);
        let cred = provider.get_for_backend("gh").await.unwrap().unwrap();
        assert_eq!(cred.material, "already-resolved-token");

        provider.invalidate("gh");
        let cred2 = provider.get_for_backend("gh").await.unwrap().unwrap();
        assert_eq!(cred2.material, "already-resolved-token");
    }

    #[test]
    fn to_header_maps_each_auth_kind() {
        let bearer = Credential { kind: AuthKind::Bearer, material: "tok".into() };
        assert_eq!(to_header(&bearer), ("Authorization".to_string(), "Bearer tok".to_string()));

        let basic = Credential { kind: AuthKind::Basic, material: "dXNlcjpwYXNz".into() };
        assert_eq!(to_header(&basic), ("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string()));

        let api_key = Credential { kind: AuthKind::ApiKey, material: "k".into() };
        assert_eq!(to_header(&api_key), ("X-API-Key".to_string(), "k".to_string()));
    }

    #[tokio::test]
    async fn profile_provider_returns_none_for_unknown_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::new(dir.path().join("profile.json")));
        let provider = ProfileCredentialProvider::new(store);
        assert!(provider.get_for_backend("nope").await.unwrap().is_none());
    }
}
