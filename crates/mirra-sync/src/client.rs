//! Upstream registry access for reconciliation.
//!
//! The [`UpstreamClient`] trait is the seam between the reconciliation
//! algorithm and the network; tests drive the algorithm with a scripted
//! implementation.

use std::path::PathBuf;

use mirra_config::Registry;
use mirra_fetch::{classify, TarballFetch, SHARED_AGENT};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

use crate::{
    error::{Result, SyncError},
    manifest::UpstreamManifest,
};

/// Path-segment escaping for package fullnames; scoped names keep their
/// `@` but the slash must be encoded (`@scope%2Fpkg`).
const FULLNAME_SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b'?').add(b'#');

/// Outcome of a manifest fetch, with absence states made explicit.
#[derive(Debug)]
pub enum ManifestFetch {
    Found(Box<UpstreamManifest>),
    /// 404: the upstream has never heard of the package.
    Missing,
    /// 451: removed for legal reasons.
    Removed,
}

pub trait UpstreamClient: Send + Sync {
    fn fetch_manifest(&self, registry: &Registry, fullname: &str) -> Result<ManifestFetch>;

    /// Downloads one version tarball to a fresh temp file; the caller
    /// discards the file once the version is published.
    fn download_tarball(&self, registry: &Registry, tarball_url: &str) -> Result<PathBuf>;
}

/// The production client, built on the process-wide shared HTTP agent.
#[derive(Default)]
pub struct HttpClient;

impl HttpClient {
    pub fn new() -> Self {
        Self
    }

    fn manifest_url(registry: &Registry, fullname: &str) -> String {
        format!(
            "{}/{}",
            registry.host.trim_end_matches('/'),
            utf8_percent_encode(fullname, FULLNAME_SEGMENT)
        )
    }
}

impl UpstreamClient for HttpClient {
    fn fetch_manifest(&self, registry: &Registry, fullname: &str) -> Result<ManifestFetch> {
        let url = Self::manifest_url(registry, fullname);
        debug!("Fetching manifest {url}");
        let mut req = SHARED_AGENT.get(&url);
        if let Some(token) = &registry.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }

        let resp = match req.call() {
            Ok(resp) => resp,
            Err(ureq::Error::StatusCode(404)) => return Ok(ManifestFetch::Missing),
            Err(ureq::Error::StatusCode(451)) => return Ok(ManifestFetch::Removed),
            Err(err) => return Err(classify(err, &url).into()),
        };

        let manifest: UpstreamManifest =
            resp.into_body()
                .read_json()
                .map_err(|err| SyncError::MalformedManifest {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
        Ok(ManifestFetch::Found(Box::new(manifest)))
    }

    fn download_tarball(&self, registry: &Registry, tarball_url: &str) -> Result<PathBuf> {
        let output = tempfile::Builder::new()
            .prefix("mirra-tarball-")
            .suffix(".tgz")
            .tempfile()
            .map_err(mirra_fetch::FetchError::from)?
            .into_temp_path()
            .keep()
            .map_err(|err| mirra_fetch::FetchError::from(err.error))?;

        let path = TarballFetch::new(tarball_url, output)
            .auth_token(registry.auth_token.clone())
            .execute()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use mirra_config::RegistryKind;

    use super::*;

    #[test]
    fn test_manifest_url_encodes_scoped_names() {
        let registry = Registry {
            name: "npmjs".to_string(),
            host: "https://registry.npmjs.org/".to_string(),
            changes_url: "https://replicate.npmjs.com".to_string(),
            kind: RegistryKind::Npm,
            user_prefix: None,
            auth_token: None,
            scopes: vec![],
        };
        assert_eq!(
            HttpClient::manifest_url(&registry, "@scope/pkg"),
            "https://registry.npmjs.org/@scope%2Fpkg"
        );
        assert_eq!(
            HttpClient::manifest_url(&registry, "lodash"),
            "https://registry.npmjs.org/lodash"
        );
    }
}
