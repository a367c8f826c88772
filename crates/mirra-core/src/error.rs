//! Error types for mirra-core.

use miette::Diagnostic;
use thiserror::Error;

/// Errors from task storage, queues and the log gateway.
#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Storage backend failure: {0}")]
    #[diagnostic(
        code(mirra_core::store),
        help("Check the task store backend is reachable")
    )]
    Store(String),

    #[error("Queue backend failure: {0}")]
    #[diagnostic(code(mirra_core::queue))]
    Queue(String),

    #[error(transparent)]
    #[diagnostic(
        code(mirra_core::json),
        help("The task payload may be corrupted")
    )]
    JsonError(#[from] serde_json::Error),

    #[error("Log position conflict at {path}")]
    #[diagnostic(code(mirra_core::log_position_conflict))]
    LogPositionConflict { path: String },

    #[error("Log object not appendable: {path}")]
    #[diagnostic(code(mirra_core::log_not_appendable))]
    LogNotAppendable { path: String },

    #[error("Package store failure: {0}")]
    #[diagnostic(code(mirra_core::package_store))]
    PackageStore(String),

    #[error("Version {version} of {fullname} failed validation: {reason}")]
    #[diagnostic(code(mirra_core::version_validation))]
    VersionValidation {
        fullname: String,
        version: String,
        reason: String,
    },

    #[error("Package '{fullname}' belongs to registry '{owner}'")]
    #[diagnostic(
        code(mirra_core::registry_conflict),
        help("Registry ownership cannot silently move between upstreams")
    )]
    RegistryConflict { fullname: String, owner: String },
}

impl CoreError {
    /// Whether a log append failure should fall back to a full upload.
    pub fn is_append_fallback(&self) -> bool {
        matches!(
            self,
            CoreError::LogPositionConflict { .. } | CoreError::LogNotAppendable { .. }
        )
    }
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
