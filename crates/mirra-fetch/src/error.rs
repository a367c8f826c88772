use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum FetchError {
    #[error("Invalid URL: {url}")]
    #[diagnostic(code(mirra_fetch::invalid_url))]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error(transparent)]
    #[diagnostic(
        code(mirra_fetch::network),
        help("Check your internet connection or try again later")
    )]
    Network(#[from] Box<ureq::Error>),

    #[error("Request timed out: {url}")]
    #[diagnostic(code(mirra_fetch::timeout))]
    Timeout { url: String },

    #[error("Not found: {url}")]
    #[diagnostic(code(mirra_fetch::not_found))]
    NotFound { url: String },

    #[error("HTTP {status}: {url}")]
    #[diagnostic(code(mirra_fetch::http_error))]
    HttpError { status: u16, url: String },

    #[error(transparent)]
    #[diagnostic(code(mirra_fetch::io))]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout { .. } | FetchError::Io(_) => true,
            FetchError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

impl From<ureq::Error> for FetchError {
    fn from(e: ureq::Error) -> Self {
        Self::Network(Box::new(e))
    }
}
