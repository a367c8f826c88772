//! Tolerant data model for upstream package manifests.
//!
//! Real registries disagree on which fields exist; everything here is
//! optional or defaulted so that one odd manifest cannot poison a whole
//! subscription. Only the fields reconciliation reads are modeled.

use std::collections::BTreeMap;

use mirra_core::VersionMeta;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamManifest {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub versions: BTreeMap<String, UpstreamVersion>,

    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,

    #[serde(default)]
    pub maintainers: Vec<UpstreamUser>,

    /// Publish timestamps plus registry markers such as `unpublished`.
    #[serde(default)]
    pub time: BTreeMap<String, serde_json::Value>,

    pub readme: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamVersion {
    #[serde(default)]
    pub version: String,

    pub dist: Option<UpstreamDist>,

    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(rename = "_npmUser")]
    pub npm_user: Option<UpstreamUser>,

    pub os: Option<Vec<String>>,
    pub cpu: Option<Vec<String>>,
    pub libc: Option<Vec<String>>,

    #[serde(default, rename = "hasInstallScript")]
    pub has_install_script: bool,

    pub deprecated: Option<String>,
    pub funding: Option<serde_json::Value>,

    #[serde(rename = "peerDependenciesMeta")]
    pub peer_dependencies_meta: Option<serde_json::Value>,

    pub readme: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamDist {
    pub tarball: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Synthetic maintainer npm assigns to packages taken over after a
/// security removal.
pub const SECURITY_HOLDER: &str = "security-holder";

impl UpstreamManifest {
    /// Heuristics for "upstream no longer serves this package": an
    /// explicit unpublish marker, a manifest stripped of both versions
    /// and maintainers, or every maintainer replaced by the security
    /// holder.
    pub fn looks_removed(&self) -> bool {
        if self.time.contains_key("unpublished") {
            return true;
        }
        if self.versions.is_empty() && self.maintainers.is_empty() {
            return true;
        }
        !self.maintainers.is_empty()
            && self.maintainers.iter().all(|m| m.name == SECURITY_HOLDER)
    }

    /// The version `latest` points at, falling back to the highest key.
    pub fn latest_version(&self) -> Option<&UpstreamVersion> {
        if let Some(tagged) = self
            .dist_tags
            .get("latest")
            .and_then(|v| self.versions.get(v))
        {
            return Some(tagged);
        }
        self.versions.values().next_back()
    }
}

impl UpstreamVersion {
    /// Projects the mutable metadata reconciliation is allowed to patch.
    pub fn meta(&self) -> VersionMeta {
        VersionMeta {
            os: self.os.clone(),
            cpu: self.cpu.clone(),
            libc: self.libc.clone(),
            has_install_script: self.has_install_script,
            deprecated: self.deprecated.clone(),
            publisher: self.npm_user.as_ref().map(|u| u.name.clone()),
            funding: self.funding.clone(),
            peer_dependencies_meta: self.peer_dependencies_meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: serde_json::Value) -> UpstreamManifest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_parse_tolerates_missing_fields() {
        let m = manifest(serde_json::json!({ "name": "bare" }));
        assert_eq!(m.name, "bare");
        assert!(m.versions.is_empty());
        assert!(m.dist_tags.is_empty());
    }

    #[test]
    fn test_unpublished_marker_means_removed() {
        let m = manifest(serde_json::json!({
            "name": "gone",
            "time": { "unpublished": { "time": "2024-01-01T00:00:00Z" } }
        }));
        assert!(m.looks_removed());
    }

    #[test]
    fn test_security_holder_takeover_means_removed() {
        let m = manifest(serde_json::json!({
            "name": "taken",
            "versions": { "1.0.0": { "version": "1.0.0" } },
            "maintainers": [{ "name": "security-holder", "email": "" }]
        }));
        assert!(m.looks_removed());
    }

    #[test]
    fn test_live_package_is_not_removed() {
        let m = manifest(serde_json::json!({
            "name": "alive",
            "versions": { "1.0.0": { "version": "1.0.0" } },
            "maintainers": [{ "name": "alice", "email": "a@example.com" }]
        }));
        assert!(!m.looks_removed());
    }

    #[test]
    fn test_version_meta_projection() {
        let m = manifest(serde_json::json!({
            "name": "pkg",
            "versions": {
                "1.0.0": {
                    "version": "1.0.0",
                    "os": ["linux"],
                    "hasInstallScript": true,
                    "deprecated": "use 2.x",
                    "_npmUser": { "name": "alice", "email": "a@example.com" }
                }
            }
        }));
        let meta = m.versions["1.0.0"].meta();
        assert_eq!(meta.os.as_deref(), Some(&["linux".to_string()][..]));
        assert!(meta.has_install_script);
        assert_eq!(meta.deprecated.as_deref(), Some("use 2.x"));
        assert_eq!(meta.publisher.as_deref(), Some("alice"));
    }

    #[test]
    fn test_latest_version_prefers_dist_tag() {
        let m = manifest(serde_json::json!({
            "name": "pkg",
            "dist-tags": { "latest": "1.0.0" },
            "versions": {
                "1.0.0": { "version": "1.0.0" },
                "2.0.0-beta.1": { "version": "2.0.0-beta.1" }
            }
        }));
        assert_eq!(m.latest_version().unwrap().version, "1.0.0");
    }
}
