//! Error types for change-feed consumption.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum FeedError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] mirra_fetch::FetchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] mirra_core::CoreError),

    #[error(transparent)]
    #[diagnostic(
        code(mirra_feed::json),
        help("The upstream change page may be malformed")
    )]
    JsonError(#[from] serde_json::Error),

    #[error("Upstream {url} did not report a current sequence")]
    #[diagnostic(
        code(mirra_feed::missing_sequence),
        help("The change-feed endpoint must expose its current position")
    )]
    MissingSequence { url: String },

    #[error("Malformed change page from {url}: {reason}")]
    #[diagnostic(code(mirra_feed::malformed_page))]
    MalformedPage { url: String, reason: String },

    #[error("No registry named '{0}' is configured")]
    #[diagnostic(code(mirra_feed::unknown_registry))]
    UnknownRegistry(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;
