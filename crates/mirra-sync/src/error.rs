//! Error types for manifest reconciliation.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum SyncError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] mirra_fetch::FetchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] mirra_core::CoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] mirra_config::ConfigError),

    #[error(transparent)]
    #[diagnostic(code(mirra_sync::json))]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed manifest from {url}: {reason}")]
    #[diagnostic(
        code(mirra_sync::malformed_manifest),
        help("The upstream response could not be parsed; it will be retried")
    )]
    MalformedManifest { url: String, reason: String },

    #[error("Package {fullname} does not exist upstream")]
    #[diagnostic(
        code(mirra_sync::not_found_upstream),
        help("A 404 manifest is final; the task is not retried")
    )]
    NotFoundUpstream { fullname: String },

    #[error("No registry named '{0}' is configured")]
    #[diagnostic(code(mirra_sync::unknown_registry))]
    UnknownRegistry(String),

    #[error("Package {fullname} is owned by registry '{owner}', not '{requested}'")]
    #[diagnostic(
        code(mirra_sync::registry_conflict),
        help("A package is only ever synced from the registry it is recorded under")
    )]
    RegistryConflict {
        fullname: String,
        owner: String,
        requested: String,
    },

    #[error("All {attempted} candidate versions of {fullname} failed to sync; last: {last_error}")]
    #[diagnostic(code(mirra_sync::all_versions_failed))]
    AllVersionsFailed {
        fullname: String,
        attempted: usize,
        last_error: String,
    },
}

impl SyncError {
    /// Whether a later attempt against the same upstream can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch(err) => err.is_retryable(),
            SyncError::MalformedManifest { .. } | SyncError::AllVersionsFailed { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
