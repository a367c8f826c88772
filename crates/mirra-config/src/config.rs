use std::{
    fs,
    path::Path,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ConfigError, ErrorContext, Result},
    registry::Registry,
};

/// How the mirror decides whether to pick up a changed package at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Sync any package the routing rules accept.
    #[default]
    All,
    /// Only sync packages that already exist locally (do-not-create-new).
    Exist,
}

/// What to do when upstream reports a package as removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDeleteMode {
    /// Leave the local copy untouched.
    #[default]
    Ignore,
    /// Keep version records but flag the package as blocked.
    Block,
    /// Fully remove the local copy.
    Delete,
}

/// Synchronization policy knobs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncPolicy {
    /// Whether change-feed subscriptions are active.
    /// Default: true
    pub enable_changes_stream: Option<bool>,

    /// Package acceptance mode.
    /// Default: "all"
    pub mode: Option<SyncMode>,

    /// Upstream-removal handling.
    /// Default: "ignore"
    pub delete_mode: Option<SyncDeleteMode>,

    /// Queue depth above which duplicate-task re-pushes and dependency
    /// fan-out are skipped.
    /// Default: 100
    pub high_water_mark: Option<usize>,

    /// Pause between change-feed pages, in milliseconds.
    /// Default: 10000
    pub changes_poll_interval_ms: Option<u64>,

    /// Worker threads per task kind.
    /// Default: 2
    pub workers_per_kind: Option<usize>,

    /// Global HTTP timeout in seconds.
    /// Default: 60
    pub http_timeout_secs: Option<u64>,
}

impl SyncPolicy {
    pub fn enable_changes_stream(&self) -> bool {
        self.enable_changes_stream.unwrap_or(true)
    }

    pub fn mode(&self) -> SyncMode {
        self.mode.unwrap_or_default()
    }

    pub fn delete_mode(&self) -> SyncDeleteMode {
        self.delete_mode.unwrap_or_default()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(100)
    }

    pub fn changes_poll_interval_ms(&self) -> u64 {
        self.changes_poll_interval_ms.unwrap_or(10_000)
    }

    pub fn workers_per_kind(&self) -> usize {
        self.workers_per_kind.unwrap_or(2)
    }

    pub fn http_timeout_secs(&self) -> u64 {
        self.http_timeout_secs.unwrap_or(60)
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Name this deployment publishes under. Packages recorded as hosted
    /// here are never pulled from upstream.
    pub self_registry: Option<String>,

    /// Configured upstream registries.
    #[serde(default)]
    pub registries: Vec<Registry>,

    /// Synchronization policy.
    #[serde(default)]
    pub sync: SyncPolicy,
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validates scope bindings: every scope starts with `@` and maps to at
    /// most one registry.
    pub fn validate(&self) -> Result<()> {
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for registry in &self.registries {
            for scope in &registry.scopes {
                if !scope.starts_with('@') {
                    return Err(ConfigError::InvalidScope(scope.clone()));
                }
                if let Some((_, first)) = seen.iter().find(|(s, _)| s == scope) {
                    return Err(ConfigError::DuplicateScope {
                        scope: scope.clone(),
                        first: (*first).to_string(),
                        second: registry.name.clone(),
                    });
                }
                seen.push((scope, &registry.name));
            }
        }
        Ok(())
    }

    pub fn registry(&self, name: &str) -> Option<&Registry> {
        self.registries.iter().find(|r| r.name == name)
    }

    /// The registry a scope is explicitly bound to, if any.
    pub fn registry_for_scope(&self, scope: &str) -> Option<&Registry> {
        self.registries.iter().find(|r| r.owns_scope(scope))
    }

    /// The generic catch-all registry: the first one with no scope bindings.
    pub fn default_registry(&self) -> Result<&Registry> {
        self.registries
            .iter()
            .find(|r| r.is_catch_all())
            .ok_or(ConfigError::NoDefaultRegistry)
    }

    pub fn self_registry(&self) -> &str {
        self.self_registry.as_deref().unwrap_or("mirra")
    }
}

/// Hands out immutable configuration snapshots and accepts replacements.
///
/// Loops take one snapshot per iteration; a replacement becomes visible on
/// the next iteration, never mid-record.
#[derive(Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, config: Config) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryKind;

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            self_registry = "corp-mirror"

            [[registries]]
            name = "npmjs"
            host = "https://registry.npmjs.org"
            changes_url = "https://replicate.npmjs.com"
            kind = "npm"

            [[registries]]
            name = "internal"
            host = "https://npm.internal.example"
            changes_url = "https://npm.internal.example/-/changes"
            kind = "cnpmcore"
            scopes = ["@internal", "@tools"]

            [sync]
            delete_mode = "block"
            high_water_mark = 50
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_lookup() {
        let config = sample_config();
        config.validate().unwrap();

        assert_eq!(config.self_registry(), "corp-mirror");
        assert_eq!(config.registry("npmjs").unwrap().kind, RegistryKind::Npm);
        assert_eq!(
            config.registry_for_scope("@tools").unwrap().name,
            "internal"
        );
        assert!(config.registry_for_scope("@unknown").is_none());
        assert_eq!(config.default_registry().unwrap().name, "npmjs");
    }

    #[test]
    fn test_policy_defaults() {
        let config = sample_config();
        assert!(config.sync.enable_changes_stream());
        assert_eq!(config.sync.mode(), SyncMode::All);
        assert_eq!(config.sync.delete_mode(), SyncDeleteMode::Block);
        assert_eq!(config.sync.high_water_mark(), 50);
        assert_eq!(config.sync.changes_poll_interval_ms(), 10_000);
    }

    #[test]
    fn test_duplicate_scope_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[registries]]
            name = "a"
            host = "https://a.example"
            changes_url = "https://a.example/changes"
            kind = "cnpmcore"
            scopes = ["@x"]

            [[registries]]
            name = "b"
            host = "https://b.example"
            changes_url = "https://b.example/changes"
            kind = "cnpmcore"
            scopes = ["@x"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateScope { .. })
        ));
    }

    #[test]
    fn test_snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(sample_config());
        let before = handle.snapshot();

        let mut updated = sample_config();
        updated.sync.enable_changes_stream = Some(false);
        handle.replace(updated);

        assert!(before.sync.enable_changes_stream());
        assert!(!handle.snapshot().sync.enable_changes_stream());
    }
}
