//! Gateway traits for the external collaborators the sync engine drives.
//!
//! The relational persistence layer, the shared queue and the blob/log
//! store all live outside this system; these traits are the seams. The
//! [`memory`] module provides in-process reference backends used by the
//! worker binary and the test suite.

pub mod memory;

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    task::{Task, TaskKind, TaskState},
};

/// Durable keyed storage for task records.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Finds the active (non-historical) task for a `(target_name, kind)`
    /// pair, optionally restricted to one state.
    fn find_active(
        &self,
        target_name: &str,
        kind: TaskKind,
        state: Option<TaskState>,
    ) -> Result<Option<Task>>;

    fn save(&self, task: &Task) -> Result<()>;

    /// Inserts `task` unless an active task already exists for its
    /// `(target_name, kind)` pair; returns the existing task when one
    /// does. Atomic with respect to concurrent inserts — real backends
    /// enforce the pair with a unique index.
    fn save_if_absent(&self, task: &Task) -> Result<Option<Task>>;

    /// Optimistic conditional save: persists `task` only if the stored
    /// record's state still equals `expected`. Returns whether the write
    /// won. This is the sole serialization point for task claims.
    fn save_if_state(&self, task: &Task, expected: TaskState) -> Result<bool>;

    /// Moves a terminal task out of the active store into history.
    fn move_to_history(&self, task: &Task) -> Result<()>;

    fn find_in_history(&self, task_id: &str) -> Result<Option<Task>>;

    /// Active tasks sitting in `state` for longer than `older_than`,
    /// oldest first, at most `limit`.
    fn find_stale(
        &self,
        state: TaskState,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Task>>;
}

/// FIFO-per-kind push/pop primitive shared across worker processes.
///
/// Delivery is at-least-once; duplicate ids are tolerated by the claim
/// logic in the coordinator.
pub trait TaskQueue: Send + Sync {
    fn push(&self, kind: TaskKind, task_id: &str) -> Result<()>;
    fn pop(&self, kind: TaskKind) -> Result<Option<String>>;
    fn len(&self, kind: TaskKind) -> Result<usize>;
}

/// Append-only log / blob storage keyed by path.
pub trait LogStore: Send + Sync {
    /// Appends bytes at `at_offset`, returning the next offset. Fails with
    /// [`CoreError::LogPositionConflict`](crate::error::CoreError) or
    /// [`CoreError::LogNotAppendable`](crate::error::CoreError) when the
    /// target changed concurrently; callers then fall back to [`upload`].
    ///
    /// [`upload`]: LogStore::upload
    fn append(&self, path: &str, bytes: &[u8], at_offset: u64) -> Result<u64>;

    /// Full overwrite of the object at `path`.
    fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;

    fn download_url(&self, path: &str) -> Result<String>;
}

/// Mutable per-version metadata the reconciler is allowed to patch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct VersionMeta {
    pub os: Option<Vec<String>>,
    pub cpu: Option<Vec<String>>,
    pub libc: Option<Vec<String>>,
    #[serde(default)]
    pub has_install_script: bool,
    pub deprecated: Option<String>,
    /// Upstream publisher identity (`_npmUser`).
    pub publisher: Option<String>,
    pub funding: Option<serde_json::Value>,
    pub peer_dependencies_meta: Option<serde_json::Value>,
}

/// A locally stored package version.
#[derive(Debug, Clone)]
pub struct LocalVersion {
    pub version: String,
    pub meta: VersionMeta,
    /// Whether a per-version readme is stored locally.
    pub has_readme: bool,
}

/// Summary of a locally stored package.
#[derive(Debug, Clone, Default)]
pub struct LocalPackage {
    pub fullname: String,
    /// Upstream registry this package is recorded as owned by.
    pub registry_name: Option<String>,
    /// Published directly on this deployment; never pulled from upstream.
    pub is_private: bool,
    pub blocked: bool,
}

/// A version publish request assembled by the reconciler.
#[derive(Debug, Clone)]
pub struct PublishVersion {
    pub fullname: String,
    pub version: String,
    pub meta: VersionMeta,
    pub readme: Option<String>,
    /// Local temp file holding the downloaded tarball bytes.
    pub tarball_path: std::path::PathBuf,
}

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The exact version already exists; a benign no-op, not an error.
    AlreadyExists,
}

/// A staged update to an existing version.
#[derive(Debug, Clone, Default)]
pub struct VersionPatch {
    pub meta: Option<VersionMeta>,
    /// Delete the locally stored readme upstream no longer sends.
    pub remove_readme: bool,
}

/// Local manifest state: the reconciler's view of the persistence layer.
pub trait PackageStore: Send + Sync {
    fn find_package(&self, fullname: &str) -> Result<Option<LocalPackage>>;
    fn versions(&self, fullname: &str) -> Result<Vec<LocalVersion>>;
    fn dist_tags(&self, fullname: &str) -> Result<BTreeMap<String, String>>;
    fn maintainers(&self, fullname: &str) -> Result<Vec<String>>;

    /// Publishes a version, creating the package record if needed.
    /// An exact-version duplicate yields [`PublishOutcome::AlreadyExists`];
    /// genuine validation failures yield
    /// [`CoreError::VersionValidation`](crate::error::CoreError).
    fn publish(&self, publish: PublishVersion) -> Result<PublishOutcome>;

    fn update_version(&self, fullname: &str, version: &str, patch: &VersionPatch) -> Result<()>;
    fn remove_version(&self, fullname: &str, version: &str) -> Result<()>;
    fn set_dist_tag(&self, fullname: &str, tag: &str, version: &str) -> Result<()>;
    fn remove_dist_tag(&self, fullname: &str, tag: &str) -> Result<()>;

    /// Creates or updates a synced user record.
    fn save_user(&self, name: &str, email: &str) -> Result<()>;
    fn replace_maintainers(&self, fullname: &str, names: &[String]) -> Result<()>;

    fn set_registry(&self, fullname: &str, registry_name: &str) -> Result<()>;
    fn block_package(&self, fullname: &str, reason: &str) -> Result<()>;
    fn unpublish_package(&self, fullname: &str) -> Result<()>;
}

/// Read-through cache invalidation keyed by package fullname.
pub trait ManifestCache: Send + Sync {
    fn invalidate(&self, fullname: &str) -> Result<()>;
}
