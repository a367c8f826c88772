//! Manifest reconciliation for the mirra registry mirror.
//!
//! Takes one claimed sync task and converges the local copy of a package
//! onto its upstream manifest: missing versions are downloaded and
//! published, drifted metadata patched, maintainers and dist-tags synced,
//! and upstream removals handled per the configured delete mode.

pub mod client;
pub mod error;
pub mod manifest;
pub mod reconciler;
pub mod resolve;

pub use client::{HttpClient, ManifestFetch, UpstreamClient};
pub use error::{Result, SyncError};
pub use manifest::{UpstreamManifest, UpstreamVersion};
pub use reconciler::{Reconciler, SyncContext, SyncOutcome, TaskLogBuffer};
pub use resolve::{resolve_registry, Resolution};
