//! Shared HTTP client and tarball fetching.
//!
//! One process-wide `ureq` agent serves every upstream call; the worker
//! binary reconfigures it once at startup (user agent, timeout, auth is
//! per-request). Tarball downloads land in caller-provided paths with a
//! small bounded retry loop and classified failures.

pub mod download;
pub mod error;
pub mod http_client;

pub use download::{classify, discard, TarballFetch};
pub use error::{FetchError, Result};
pub use http_client::{configure_http_client, ClientConfig, SharedAgent, SHARED_AGENT};
