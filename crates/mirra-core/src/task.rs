//! The task data model and state machine.
//!
//! A [`Task`] is one unit of background work. Within a kind, the
//! `target_name` is the dedup key: at most one active task exists per
//! `(target_name, kind)` pair. Terminal tasks move to a history store and
//! become read-only audit records.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kinds of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Reconcile one package's manifest against its upstream.
    SyncPackage,
    /// Continuously consume an upstream change feed.
    ChangesStream,
    /// Reconcile a binary-artifact tree (executed elsewhere).
    SyncBinary,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SyncPackage => "sync_package",
            TaskKind::ChangesStream => "changes_stream",
            TaskKind::SyncBinary => "sync_binary",
        }
    }

    /// Whether duplicate create requests may merge payloads into an
    /// existing Waiting task.
    pub fn is_merge_eligible(&self) -> bool {
        matches!(self, TaskKind::SyncPackage)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states.
///
/// `Waiting -> Processing -> {Success, Fail, Timeout}`, plus
/// `Processing -> Waiting` on requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Processing,
    Success,
    Fail,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Fail | TaskState::Timeout
        )
    }
}

/// A unit of background work.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Dedup key within a kind: a package fullname, or a registry name for
    /// changes-stream tasks.
    pub target_name: String,
    /// Opaque kind-specific payload; see [`SyncPackagePayload`] and
    /// [`ChangesStreamPayload`].
    pub data: serde_json::Value,
    pub attempts: u32,
    pub log_path: String,
    /// Append offset into the log object. `None` means the next write
    /// starts a fresh object.
    pub log_store_position: Option<u64>,
    /// Last failure message, for operator visibility.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_task_id() -> String {
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:06x}", Utc::now().timestamp_millis(), seq)
}

impl Task {
    fn new(kind: TaskKind, target_name: impl Into<String>, data: serde_json::Value) -> Self {
        let now = Utc::now();
        let task_id = next_task_id();
        let target_name = target_name.into();
        let log_path = format!(
            "/tasks/{}/{}/{}.log",
            kind.as_str(),
            now.format("%Y/%m/%d"),
            task_id
        );
        Self {
            task_id,
            kind,
            state: TaskState::Waiting,
            target_name,
            data,
            attempts: 0,
            log_path,
            log_store_position: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a package reconciliation task.
    pub fn sync_package(fullname: &str, payload: SyncPackagePayload) -> Result<Self> {
        Ok(Self::new(
            TaskKind::SyncPackage,
            fullname,
            serde_json::to_value(payload)?,
        ))
    }

    /// Creates a change-feed subscription task for one registry.
    pub fn changes_stream(registry_name: &str) -> Result<Self> {
        Ok(Self::new(
            TaskKind::ChangesStream,
            registry_name,
            serde_json::to_value(ChangesStreamPayload::default())?,
        ))
    }

    pub fn sync_payload(&self) -> Result<SyncPackagePayload> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn changes_payload(&self) -> Result<ChangesStreamPayload> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn set_sync_payload(&mut self, payload: &SyncPackagePayload) -> Result<()> {
        self.data = serde_json::to_value(payload)?;
        Ok(())
    }

    pub fn set_changes_payload(&mut self, payload: &ChangesStreamPayload) -> Result<()> {
        self.data = serde_json::to_value(payload)?;
        Ok(())
    }
}

/// Payload for [`TaskKind::SyncPackage`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncPackagePayload {
    /// Only sync these versions. `None` means the whole manifest.
    pub specific_versions: Option<Vec<String>>,
    /// Skip dependency fan-out (load shedding).
    #[serde(default)]
    pub skip_dependencies: bool,
    /// Delete and re-publish the listed versions even if present locally.
    #[serde(default)]
    pub force_sync_history: bool,
    /// Explicit upstream registry for this request.
    pub registry_name: Option<String>,
    /// Free-form note about why the task was created.
    pub tips: Option<String>,
}

impl SyncPackagePayload {
    /// Folds another request into this one.
    ///
    /// Two version-filtered requests union their lists; if either side has
    /// no filter the merged task degrades to a full sync.
    pub fn merge(&mut self, other: &SyncPackagePayload) {
        match (&mut self.specific_versions, &other.specific_versions) {
            (Some(mine), Some(theirs)) => {
                for version in theirs {
                    if !mine.contains(version) {
                        mine.push(version.clone());
                    }
                }
            }
            _ => self.specific_versions = None,
        }
        self.skip_dependencies = self.skip_dependencies && other.skip_dependencies;
        self.force_sync_history = self.force_sync_history || other.force_sync_history;
        if self.tips.is_none() {
            self.tips = other.tips.clone();
        }
    }
}

/// Payload for [`TaskKind::ChangesStream`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangesStreamPayload {
    /// Change-feed cursor; empty until bootstrapped.
    #[serde(default)]
    pub since: String,
    /// Reconciliation tasks spawned over the subscription's lifetime.
    #[serde(default)]
    pub task_count: u64,
    /// Last package name seen, for observability.
    pub last_package: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::sync_package("@x/pkg", SyncPackagePayload::default()).unwrap();
        assert_eq!(task.kind, TaskKind::SyncPackage);
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.target_name, "@x/pkg");
        assert_eq!(task.attempts, 0);
        assert!(task.log_path.contains("sync_package"));
        assert!(task.log_store_position.is_none());
    }

    #[test]
    fn test_task_ids_unique() {
        let a = Task::changes_stream("npmjs").unwrap();
        let b = Task::changes_stream("npmjs").unwrap();
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn test_merge_unions_version_lists() {
        let mut mine = SyncPackagePayload {
            specific_versions: Some(vec!["1.0.0".into(), "1.1.0".into()]),
            ..Default::default()
        };
        let theirs = SyncPackagePayload {
            specific_versions: Some(vec!["1.1.0".into(), "2.0.0".into()]),
            ..Default::default()
        };
        mine.merge(&theirs);
        assert_eq!(
            mine.specific_versions.as_deref().unwrap(),
            ["1.0.0", "1.1.0", "2.0.0"]
        );
    }

    #[test]
    fn test_merge_degrades_to_full_sync() {
        let mut mine = SyncPackagePayload {
            specific_versions: Some(vec!["1.0.0".into()]),
            ..Default::default()
        };
        mine.merge(&SyncPackagePayload::default());
        assert!(mine.specific_versions.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Fail.is_terminal());
        assert!(TaskState::Timeout.is_terminal());
    }

    #[test]
    fn test_payload_round_trip_through_data() {
        let mut task = Task::changes_stream("npmjs").unwrap();
        let mut payload = task.changes_payload().unwrap();
        payload.since = "12345".to_string();
        payload.task_count = 7;
        task.set_changes_payload(&payload).unwrap();

        let read = task.changes_payload().unwrap();
        assert_eq!(read.since, "12345");
        assert_eq!(read.task_count, 7);
    }
}
