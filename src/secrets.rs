//! `secretref:<provider>:<reference>` resolution, applied to a parsed config
//! document before it reaches the Profile Store. Grounded directly in the
//! teacher's `secrets::resolver` module; the regex-based inline-replacement
//! scheme and the env-var fallback provider are carried over almost verbatim,
//! generalized only in naming.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, bail};
use regex::Regex;

/// A provider that can resolve secret references for a given scheme.
pub trait SecretProvider: Send + Sync {
    /// Provider name (e.g., "bws").
    fn name(&self) -> &str;

    /// Resolve a reference string (e.g., "project/dotenv/key/API_KEY") to its value.
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Fallback provider for `secretref:bws:...` patterns when the `bws` feature
/// is disabled (or no BWS credentials are configured). Extracts the last
/// path segment (the key name) from the reference and resolves it via
/// `std::env::var`, so configs written for BWS still work when the same key
/// names are set as plain environment variables.
pub struct EnvFallbackProvider;

impl SecretProvider for EnvFallbackProvider {
    fn name(&self) -> &str {
        "bws"
    }

    fn resolve(&self, reference: &str) -> Result<String> {
        let key = reference
            .rsplit('/')
            .next()
            .context("cannot extract key name from secretref reference")?;
        std::env::var(key).with_context(|| {
            format!(
                "secretref:bws:{reference} — BWS is disabled and env var '{key}' not found. \
                 Set {key} in your environment."
            )
        })
    }
}

/// Resolves `secretref:<provider>:<reference>` patterns in config values.
pub struct SecretResolver {
    providers: HashMap<String, Box<dyn SecretProvider>>,
    pattern: Regex,
    strict: bool,
}

impl SecretResolver {
    /// When `strict` is true, empty resolved values are treated as errors.
    pub fn new(strict: bool) -> Self {
        Self {
            providers: HashMap::new(),
            pattern: Regex::new(r"secretref:([^:\s]+):([\w/.\-]+)").unwrap(),
            strict,
        }
    }

    pub fn register(&mut self, provider: Box<dyn SecretProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Resolve all secretref patterns in a single string value. If the whole
    /// value is one secretref, returns the resolved value directly;
    /// otherwise performs inline right-to-left replacement.
    pub fn resolve_value(&self, value: &str) -> Result<String> {
        if !value.contains("secretref:") {
            return Ok(value.to_string());
        }

        let captures: Vec<_> = self.pattern.captures_iter(value).collect();
        if captures.len() == 1 {
            let cap = &captures[0];
            let full_match = cap.get(0).unwrap();
            if full_match.start() == 0 && full_match.end() == value.len() {
                return self.resolve_single(&cap[1], &cap[2]);
            }
        }

        let mut result = value.to_string();
        let matches: Vec<_> = self
            .pattern
            .captures_iter(value)
            .map(|cap| {
                let full = cap.get(0).unwrap();
                (
                    full.start(),
                    full.end(),
                    cap[1].to_string(),
                    cap[2].to_string(),
                )
            })
            .collect();

        for (start, end, provider_name, reference) in matches.into_iter().rev() {
            let resolved = self.resolve_single(&provider_name, &reference)?;
            result.replace_range(start..end, &resolved);
        }

        Ok(result)
    }

    pub fn resolve_map(&self, map: &mut BTreeMap<String, String>) -> Result<()> {
        for (key, value) in map.iter_mut() {
            let resolved = self
                .resolve_value(value)
                .with_context(|| format!("resolving key '{key}'"))?;
            *value = resolved;
        }
        Ok(())
    }

    pub fn resolve_option(&self, opt: &mut Option<String>) -> Result<()> {
        if let Some(value) = opt {
            *value = self.resolve_value(value)?;
        }
        Ok(())
    }

    fn resolve_single(&self, provider_name: &str, reference: &str) -> Result<String> {
        let provider = self
            .providers
            .get(provider_name)
            .with_context(|| format!("unknown secret provider: '{provider_name}'"))?;

        let resolved = provider.resolve(reference).with_context(|| {
            format!("provider '{provider_name}' failed to resolve '{reference}'")
        })?;

        if self.strict && resolved.is_empty() {
            bail!(
                "secret provider '{provider_name}' returned empty value for '{reference}' (strict mode)"
            );
        }

        Ok(resolved)
    }
}

#[cfg(feature = "bws")]
pub mod bws {
    //! Bitwarden Secrets Manager-backed provider, grounded in the teacher's
    //! `secrets::bws::BwsSdkProvider`: authenticate once, list all projects
    //! and secrets, cache everything in memory, and resolve
    //! `project/<name>/key/<key>` references against that cache.

    use super::SecretProvider;
    use anyhow::{Context, Result, bail};
    use bitwarden::Client;
    use bitwarden::auth::login::AccessTokenLoginRequest;
    use bitwarden::secrets_manager::projects::ProjectsListRequest;
    use bitwarden::secrets_manager::secrets::{SecretIdentifiersRequest, SecretsGetRequest};
    use bitwarden::secrets_manager::{ClientProjectsExt, ClientSecretsExt};
    use std::collections::HashMap;
    use uuid::Uuid;

    pub struct BwsSdkProvider {
        project_by_name: HashMap<String, Uuid>,
        secret_cache: HashMap<(Uuid, String), String>,
    }

    impl BwsSdkProvider {
        pub async fn new(access_token: String, org_id: Option<String>) -> Result<Self> {
            let org_id_str = match org_id {
                Some(id) if !id.is_empty() => id,
                _ => std::env::var("BWS_ORG_ID")
                    .context("organization_id not set in config and BWS_ORG_ID env var not found")?,
            };
            let organization_id =
                Uuid::parse_str(&org_id_str).context("invalid organization_id UUID")?;

            let client = Client::new(None);
            client
                .auth()
                .login_access_token(&AccessTokenLoginRequest {
                    access_token,
                    state_file: None,
                })
                .await
                .context("BWS authentication failed")?;

            let projects_resp = client
                .projects()
                .list(&ProjectsListRequest { organization_id })
                .await
                .context("failed to list BWS projects")?;

            let mut project_by_name = HashMap::new();
            for project in &projects_resp.data {
                project_by_name.insert(project.name.clone(), project.id);
            }

            let identifiers_resp = client
                .secrets()
                .list(&SecretIdentifiersRequest { organization_id })
                .await
                .context("failed to list BWS secret identifiers")?;

            let ids: Vec<Uuid> = identifiers_resp.data.iter().map(|s| s.id).collect();

            let mut secret_cache = HashMap::new();
            if !ids.is_empty() {
                let secrets_resp = client
                    .secrets()
                    .get_by_ids(SecretsGetRequest { ids })
                    .await
                    .context("failed to fetch BWS secrets")?;

                for secret in &secrets_resp.data {
                    if let Some(project_id) = secret.project_id {
                        secret_cache
                            .insert((project_id, secret.key.clone()), secret.value.clone());
                    }
                }
            }

            Ok(Self {
                project_by_name,
                secret_cache,
            })
        }
    }

    impl SecretProvider for BwsSdkProvider {
        fn name(&self) -> &str {
            "bws"
        }

        fn resolve(&self, reference: &str) -> Result<String> {
            let parts: Vec<&str> = reference.splitn(4, '/').collect();
            if parts.len() != 4 || parts[0] != "project" || parts[2] != "key" {
                bail!(
                    "invalid BWS reference format: '{reference}' (expected 'project/<name>/key/<key>')"
                );
            }
            let project_name = parts[1];
            let key = parts[3];

            let project_id = self
                .project_by_name
                .get(project_name)
                .with_context(|| format!("BWS project not found: '{project_name}'"))?;

            self.secret_cache
                .get(&(*project_id, key.to_string()))
                .cloned()
                .with_context(|| format!("BWS secret not found: project='{project_name}', key='{key}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        secrets: HashMap<String, String>,
    }

    impl StubProvider {
        fn new(secrets: Vec<(&str, &str)>) -> Self {
            Self {
                secrets: secrets
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }
    }

    impl SecretProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn resolve(&self, reference: &str) -> Result<String> {
            self.secrets
                .get(reference)
                .cloned()
                .with_context(|| format!("secret not found: {reference}"))
        }
    }

    fn make_resolver(strict: bool) -> SecretResolver {
        let mut resolver = SecretResolver::new(strict);
        resolver.register(Box::new(StubProvider::new(vec![
            ("project/dotenv/key/API_KEY", "sk-12345"),
            ("project/dotenv/key/TOKEN", "tok-abc"),
            ("project/dotenv/key/EMPTY", ""),
        ])));
        resolver
    }

    #[test]
    fn resolves_full_value() {
        let resolver = make_resolver(false);
        let result = resolver
            .resolve_value("secretref:stub:project/dotenv/key/API_KEY")
            .unwrap();
        assert_eq!(result, "sk-12345");
    }

    #[test]
    fn resolves_inline() {
        let resolver = make_resolver(false);
        let result = resolver
            .resolve_value("Bearer secretref:stub:project/dotenv/key/TOKEN")
            .unwrap();
        assert_eq!(result, "Bearer tok-abc");
    }

    #[test]
    fn passthrough_without_secretref() {
        let resolver = make_resolver(false);
        assert_eq!(resolver.resolve_value("plain-value").unwrap(), "plain-value");
    }

    #[test]
    fn unknown_provider_errors() {
        let resolver = make_resolver(false);
        let err = resolver
            .resolve_value("secretref:unknown:some/ref")
            .unwrap_err();
        assert!(err.to_string().contains("unknown secret provider"));
    }

    #[test]
    fn strict_mode_rejects_empty() {
        let resolver = make_resolver(true);
        let err = resolver
            .resolve_value("secretref:stub:project/dotenv/key/EMPTY")
            .unwrap_err();
        assert!(err.to_string().contains("empty value"));
    }

    #[test]
    fn env_fallback_resolves_from_environment() {
        unsafe { std::env::set_var("MCPMUX_TEST_SECRET_1", "my-secret-value") };
        let provider = EnvFallbackProvider;
        let result = provider
            .resolve("project/dotenv/key/MCPMUX_TEST_SECRET_1")
            .unwrap();
        assert_eq!(result, "my-secret-value");
        unsafe { std::env::remove_var("MCPMUX_TEST_SECRET_1") };
    }

    #[test]
    fn env_fallback_missing_var_errors() {
        unsafe { std::env::remove_var("MCPMUX_TEST_NONEXISTENT") };
        let provider = EnvFallbackProvider;
        let err = provider
            .resolve("project/dotenv/key/MCPMUX_TEST_NONEXISTENT")
            .unwrap_err();
        assert!(err.to_string().contains("BWS is disabled"));
    }
}
