use serde::{Deserialize, Serialize};

/// Which change-feed protocol family an upstream registry speaks.
///
/// The kind only affects cursor representation and page shape; the
/// consumption contract is identical across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// CouchDB-style `_changes` endpoint streaming newline-delimited JSON,
    /// integer sequence cursor.
    Npm,
    /// Pre-parsed JSON page of `{ seq, fullname }` results, integer
    /// sequence cursor.
    Cnpmcore,
    /// Timestamp-paginated JSON page, wall-clock millisecond cursor.
    Cnpmjson,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryKind::Npm => "npm",
            RegistryKind::Cnpmcore => "cnpmcore",
            RegistryKind::Cnpmjson => "cnpmjson",
        };
        f.write_str(s)
    }
}

/// Defines one upstream registry this deployment mirrors from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Registry {
    /// Unique name of the registry, used as its identity everywhere
    /// (task payloads, package ownership records).
    pub name: String,

    /// Manifest API base, e.g. `https://registry.npmjs.org`.
    pub host: String,

    /// Change-feed endpoint base, e.g. `https://replicate.npmjs.com`.
    pub changes_url: String,

    /// Which change-feed adapter to use.
    pub kind: RegistryKind,

    /// Prefix applied to synced user identities, e.g. `npm:`.
    /// Default: "{name}:"
    pub user_prefix: Option<String>,

    /// Optional bearer token for authenticated upstreams.
    pub auth_token: Option<String>,

    /// Scopes routed to this registry. A registry with no scopes acts as
    /// the generic catch-all upstream for unscoped traffic.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Registry {
    pub fn user_prefix(&self) -> String {
        self.user_prefix
            .clone()
            .unwrap_or_else(|| format!("{}:", self.name))
    }

    /// Whether this registry is the generic catch-all (owns no scopes).
    pub fn is_catch_all(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn owns_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Extracts the scope from a package fullname, e.g. `@org/pkg` -> `@org`.
pub fn scope_of(fullname: &str) -> Option<&str> {
    if !fullname.starts_with('@') {
        return None;
    }
    fullname.split_once('/').map(|(scope, _)| scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_of() {
        assert_eq!(scope_of("@org/pkg"), Some("@org"));
        assert_eq!(scope_of("plain-pkg"), None);
        assert_eq!(scope_of("@broken"), None);
    }

    #[test]
    fn test_user_prefix_default() {
        let registry = Registry {
            name: "npmjs".to_string(),
            host: "https://registry.npmjs.org".to_string(),
            changes_url: "https://replicate.npmjs.com".to_string(),
            kind: RegistryKind::Npm,
            user_prefix: None,
            auth_token: None,
            scopes: vec![],
        };
        assert_eq!(registry.user_prefix(), "npmjs:");
        assert!(registry.is_catch_all());
    }

    #[test]
    fn test_kind_deserialization() {
        let toml = r#"
            name = "internal"
            host = "https://npm.internal.example"
            changes_url = "https://npm.internal.example/-/changes"
            kind = "cnpmcore"
            scopes = ["@internal"]
        "#;
        let registry: Registry = toml::from_str(toml).unwrap();
        assert_eq!(registry.kind, RegistryKind::Cnpmcore);
        assert!(registry.owns_scope("@internal"));
        assert!(!registry.is_catch_all());
    }
}
