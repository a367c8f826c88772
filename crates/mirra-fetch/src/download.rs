use std::{
    fs::{self, File},
    io::{Read as _, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};
use url::Url;

use crate::{error::FetchError, http_client::SHARED_AGENT};

/// Classifies a transport error for one URL.
///
/// Distinguishes "not found" from "bad status" from "network timeout" so
/// callers can decide terminal vs retryable.
pub fn classify(err: ureq::Error, url: &str) -> FetchError {
    match err {
        ureq::Error::StatusCode(404) => FetchError::NotFound {
            url: url.to_string(),
        },
        ureq::Error::StatusCode(status) => FetchError::HttpError {
            status,
            url: url.to_string(),
        },
        ureq::Error::Timeout(_) => FetchError::Timeout {
            url: url.to_string(),
        },
        other => FetchError::Network(Box::new(other)),
    }
}

/// Downloads one tarball to a caller-provided path.
///
/// Retries transient failures a bounded number of times; not-found and
/// client-error statuses fail immediately.
pub struct TarballFetch {
    url: String,
    output: PathBuf,
    retries: u32,
    auth_token: Option<String>,
}

impl TarballFetch {
    pub fn new(url: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output: output.into(),
            retries: 3,
            auth_token: None,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Performs the download, returning the output path.
    pub fn execute(self) -> Result<PathBuf, FetchError> {
        Url::parse(&self.url).map_err(|source| {
            FetchError::InvalidUrl {
                url: self.url.clone(),
                source,
            }
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once() {
                Ok(()) => return Ok(self.output),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    warn!(
                        "Tarball fetch attempt {attempt}/{} failed for {}: {err}",
                        self.retries, self.url
                    );
                    std::thread::sleep(Duration::from_millis(200 * u64::from(attempt)));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn fetch_once(&self) -> Result<(), FetchError> {
        let mut req = SHARED_AGENT.get(&self.url);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }

        let resp = req.call().map_err(|err| classify(err, &self.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpError {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!("Fetching tarball {} -> {}", self.url, self.output.display());

        let mut reader = resp.into_body().into_reader();
        let mut file = File::create(&self.output)?;
        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Best-effort removal of a downloaded temp file.
pub fn discard(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}
