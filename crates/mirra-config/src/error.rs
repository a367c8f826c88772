//! Error types for the configuration crate.

use miette::Diagnostic;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Error while {action}: {source}")]
    #[diagnostic(code(mirra_config::io))]
    IoError {
        action: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(
        code(mirra_config::toml),
        help("Check your configuration syntax")
    )]
    TomlError(#[from] toml::de::Error),

    #[error("Unknown registry '{0}'")]
    #[diagnostic(
        code(mirra_config::unknown_registry),
        help("Registries must be declared in the [[registries]] section")
    )]
    UnknownRegistry(String),

    #[error("Scope '{scope}' is bound to both '{first}' and '{second}'")]
    #[diagnostic(
        code(mirra_config::duplicate_scope),
        help("A scope can be routed to at most one upstream registry")
    )]
    DuplicateScope {
        scope: String,
        first: String,
        second: String,
    },

    #[error("Invalid scope '{0}': scopes must start with '@'")]
    #[diagnostic(code(mirra_config::invalid_scope))]
    InvalidScope(String),

    #[error("No catch-all registry configured")]
    #[diagnostic(
        code(mirra_config::no_default_registry),
        help("Declare at least one registry without scope bindings")
    )]
    NoDefaultRegistry,
}

/// A specialized Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Extension trait for adding context to I/O errors.
pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            ConfigError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
