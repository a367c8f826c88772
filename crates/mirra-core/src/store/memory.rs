//! In-process reference backends for every gateway trait.
//!
//! Mutex-guarded maps, good enough for a single-process deployment and for
//! the test suite. The package store counts effective mutations so tests
//! can assert reconciliation idempotency directly.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use chrono::{Duration, Utc};

use crate::{
    error::{CoreError, Result},
    store::{
        LocalPackage, LocalVersion, LogStore, ManifestCache, PackageStore, PublishOutcome,
        PublishVersion, TaskQueue, TaskStore, VersionPatch,
    },
    task::{Task, TaskKind, TaskState},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`TaskStore`].
#[derive(Default)]
pub struct MemoryTaskStore {
    active: Mutex<HashMap<String, Task>>,
    history: Mutex<HashMap<String, Task>>,
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.active).get(task_id).cloned())
    }

    fn find_active(
        &self,
        target_name: &str,
        kind: TaskKind,
        state: Option<TaskState>,
    ) -> Result<Option<Task>> {
        Ok(lock(&self.active)
            .values()
            .find(|t| {
                t.target_name == target_name
                    && t.kind == kind
                    && state.map_or(true, |s| t.state == s)
            })
            .cloned())
    }

    fn save(&self, task: &Task) -> Result<()> {
        lock(&self.active).insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn save_if_absent(&self, task: &Task) -> Result<Option<Task>> {
        let mut active = lock(&self.active);
        if let Some(existing) = active
            .values()
            .find(|t| t.target_name == task.target_name && t.kind == task.kind)
        {
            return Ok(Some(existing.clone()));
        }
        active.insert(task.task_id.clone(), task.clone());
        Ok(None)
    }

    fn save_if_state(&self, task: &Task, expected: TaskState) -> Result<bool> {
        let mut active = lock(&self.active);
        match active.get(&task.task_id) {
            Some(stored) if stored.state == expected => {
                active.insert(task.task_id.clone(), task.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn move_to_history(&self, task: &Task) -> Result<()> {
        lock(&self.active).remove(&task.task_id);
        lock(&self.history).insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn find_in_history(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(lock(&self.history).get(task_id).cloned())
    }

    fn find_stale(
        &self,
        state: TaskState,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let cutoff = Utc::now() - older_than;
        let mut stale: Vec<Task> = lock(&self.active)
            .values()
            .filter(|t| t.state == state && t.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

/// In-memory [`TaskQueue`].
#[derive(Default)]
pub struct MemoryTaskQueue {
    queues: Mutex<HashMap<TaskKind, VecDeque<String>>>,
}

impl TaskQueue for MemoryTaskQueue {
    fn push(&self, kind: TaskKind, task_id: &str) -> Result<()> {
        lock(&self.queues)
            .entry(kind)
            .or_default()
            .push_back(task_id.to_string());
        Ok(())
    }

    fn pop(&self, kind: TaskKind) -> Result<Option<String>> {
        Ok(lock(&self.queues)
            .get_mut(&kind)
            .and_then(|q| q.pop_front()))
    }

    fn len(&self, kind: TaskKind) -> Result<usize> {
        Ok(lock(&self.queues).get(&kind).map_or(0, |q| q.len()))
    }
}

/// In-memory [`LogStore`].
#[derive(Default)]
pub struct MemoryLogStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    appendable: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::default(),
            appendable: AtomicBool::new(true),
        }
    }

    /// Makes every append fail with `LogNotAppendable`, to exercise the
    /// upload fallback path.
    pub fn set_appendable(&self, appendable: bool) {
        self.appendable.store(appendable, Ordering::SeqCst);
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(path).cloned()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, path: &str, bytes: &[u8], at_offset: u64) -> Result<u64> {
        if !self.appendable.load(Ordering::SeqCst) {
            return Err(CoreError::LogNotAppendable {
                path: path.to_string(),
            });
        }
        let mut objects = lock(&self.objects);
        let buf = objects.entry(path.to_string()).or_default();
        if buf.len() as u64 != at_offset {
            return Err(CoreError::LogPositionConflict {
                path: path.to_string(),
            });
        }
        buf.extend_from_slice(bytes);
        Ok(buf.len() as u64)
    }

    fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        lock(&self.objects).insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn download_url(&self, path: &str) -> Result<String> {
        Ok(format!("memory://{path}"))
    }
}

#[derive(Default)]
struct PackageRecord {
    package: LocalPackage,
    versions: BTreeMap<String, LocalVersion>,
    tags: BTreeMap<String, String>,
    maintainers: Vec<String>,
    readmes: BTreeMap<String, String>,
}

/// In-memory [`PackageStore`] with an effective-mutation counter.
#[derive(Default)]
pub struct MemoryPackageStore {
    packages: Mutex<HashMap<String, PackageRecord>>,
    users: Mutex<HashMap<String, String>>,
    mutations: AtomicU64,
}

impl MemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating operations that actually changed state.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Seeds a pre-existing private (self-hosted) package.
    pub fn insert_private_package(&self, fullname: &str) {
        let mut packages = lock(&self.packages);
        let record = packages.entry(fullname.to_string()).or_default();
        record.package.fullname = fullname.to_string();
        record.package.is_private = true;
    }

    /// Seeds a package owned by a registry, without going through publish.
    pub fn insert_synced_package(&self, fullname: &str, registry_name: &str) {
        let mut packages = lock(&self.packages);
        let record = packages.entry(fullname.to_string()).or_default();
        record.package.fullname = fullname.to_string();
        record.package.registry_name = Some(registry_name.to_string());
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn with_record<T>(
        &self,
        fullname: &str,
        f: impl FnOnce(&mut PackageRecord) -> Result<T>,
    ) -> Result<T> {
        let mut packages = lock(&self.packages);
        let record = packages
            .get_mut(fullname)
            .ok_or_else(|| CoreError::PackageStore(format!("unknown package {fullname}")))?;
        f(record)
    }
}

impl PackageStore for MemoryPackageStore {
    fn find_package(&self, fullname: &str) -> Result<Option<LocalPackage>> {
        Ok(lock(&self.packages)
            .get(fullname)
            .map(|r| r.package.clone()))
    }

    fn versions(&self, fullname: &str) -> Result<Vec<LocalVersion>> {
        Ok(lock(&self.packages)
            .get(fullname)
            .map(|r| r.versions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn dist_tags(&self, fullname: &str) -> Result<BTreeMap<String, String>> {
        Ok(lock(&self.packages)
            .get(fullname)
            .map(|r| r.tags.clone())
            .unwrap_or_default())
    }

    fn maintainers(&self, fullname: &str) -> Result<Vec<String>> {
        Ok(lock(&self.packages)
            .get(fullname)
            .map(|r| r.maintainers.clone())
            .unwrap_or_default())
    }

    fn publish(&self, publish: PublishVersion) -> Result<PublishOutcome> {
        if publish.version.is_empty() {
            return Err(CoreError::VersionValidation {
                fullname: publish.fullname,
                version: publish.version,
                reason: "empty version".to_string(),
            });
        }
        let mut packages = lock(&self.packages);
        let record = packages.entry(publish.fullname.clone()).or_default();
        record.package.fullname = publish.fullname.clone();
        if record.versions.contains_key(&publish.version) {
            return Ok(PublishOutcome::AlreadyExists);
        }
        let has_readme = publish.readme.is_some();
        if let Some(readme) = publish.readme {
            record.readmes.insert(publish.version.clone(), readme);
        }
        record.versions.insert(
            publish.version.clone(),
            LocalVersion {
                version: publish.version,
                meta: publish.meta,
                has_readme,
            },
        );
        self.mutated();
        Ok(PublishOutcome::Published)
    }

    fn update_version(&self, fullname: &str, version: &str, patch: &VersionPatch) -> Result<()> {
        let changed = self.with_record(fullname, |record| {
            let Some(local) = record.versions.get_mut(version) else {
                return Err(CoreError::PackageStore(format!(
                    "unknown version {fullname}@{version}"
                )));
            };
            let mut changed = false;
            if let Some(meta) = &patch.meta {
                if local.meta != *meta {
                    local.meta = meta.clone();
                    changed = true;
                }
            }
            if patch.remove_readme && local.has_readme {
                local.has_readme = false;
                record.readmes.remove(version);
                changed = true;
            }
            Ok(changed)
        })?;
        if changed {
            self.mutated();
        }
        Ok(())
    }

    fn remove_version(&self, fullname: &str, version: &str) -> Result<()> {
        let removed = self.with_record(fullname, |record| {
            record.readmes.remove(version);
            Ok(record.versions.remove(version).is_some())
        })?;
        if removed {
            self.mutated();
        }
        Ok(())
    }

    fn set_dist_tag(&self, fullname: &str, tag: &str, version: &str) -> Result<()> {
        let changed = self.with_record(fullname, |record| {
            Ok(record.tags.insert(tag.to_string(), version.to_string())
                != Some(version.to_string()))
        })?;
        if changed {
            self.mutated();
        }
        Ok(())
    }

    fn remove_dist_tag(&self, fullname: &str, tag: &str) -> Result<()> {
        let removed = self.with_record(fullname, |record| Ok(record.tags.remove(tag).is_some()))?;
        if removed {
            self.mutated();
        }
        Ok(())
    }

    fn save_user(&self, name: &str, email: &str) -> Result<()> {
        let previous = lock(&self.users).insert(name.to_string(), email.to_string());
        if previous.as_deref() != Some(email) {
            self.mutated();
        }
        Ok(())
    }

    fn replace_maintainers(&self, fullname: &str, names: &[String]) -> Result<()> {
        let changed = self.with_record(fullname, |record| {
            if record.maintainers == names {
                Ok(false)
            } else {
                record.maintainers = names.to_vec();
                Ok(true)
            }
        })?;
        if changed {
            self.mutated();
        }
        Ok(())
    }

    fn set_registry(&self, fullname: &str, registry_name: &str) -> Result<()> {
        let changed = self.with_record(fullname, |record| {
            if record.package.registry_name.as_deref() == Some(registry_name) {
                Ok(false)
            } else {
                record.package.registry_name = Some(registry_name.to_string());
                Ok(true)
            }
        })?;
        if changed {
            self.mutated();
        }
        Ok(())
    }

    fn block_package(&self, fullname: &str, _reason: &str) -> Result<()> {
        let changed = self.with_record(fullname, |record| {
            if record.package.blocked {
                Ok(false)
            } else {
                record.package.blocked = true;
                Ok(true)
            }
        })?;
        if changed {
            self.mutated();
        }
        Ok(())
    }

    fn unpublish_package(&self, fullname: &str) -> Result<()> {
        if lock(&self.packages).remove(fullname).is_some() {
            self.mutated();
        }
        Ok(())
    }
}

/// In-memory [`ManifestCache`] recording invalidated fullnames.
#[derive(Default)]
pub struct MemoryManifestCache {
    invalidated: Mutex<Vec<String>>,
}

impl MemoryManifestCache {
    pub fn invalidated(&self) -> Vec<String> {
        lock(&self.invalidated).clone()
    }
}

impl ManifestCache for MemoryManifestCache {
    fn invalidate(&self, fullname: &str) -> Result<()> {
        lock(&self.invalidated).push(fullname.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VersionMeta;

    #[test]
    fn test_task_store_conditional_save() {
        let store = MemoryTaskStore::default();
        let mut task = Task::changes_stream("npmjs").unwrap();
        store.save(&task).unwrap();

        task.state = TaskState::Processing;
        assert!(store.save_if_state(&task, TaskState::Waiting).unwrap());
        // Second claim against the same expectation loses.
        assert!(!store.save_if_state(&task, TaskState::Waiting).unwrap());
    }

    #[test]
    fn test_move_to_history() {
        let store = MemoryTaskStore::default();
        let mut task = Task::changes_stream("npmjs").unwrap();
        store.save(&task).unwrap();

        task.state = TaskState::Success;
        store.move_to_history(&task).unwrap();

        assert!(store.get(&task.task_id).unwrap().is_none());
        let archived = store.find_in_history(&task.task_id).unwrap().unwrap();
        assert_eq!(archived.state, TaskState::Success);
    }

    #[test]
    fn test_find_stale_filters_by_age() {
        let store = MemoryTaskStore::default();
        let mut fresh = Task::changes_stream("a").unwrap();
        fresh.state = TaskState::Processing;
        store.save(&fresh).unwrap();

        let mut stale = Task::changes_stream("b").unwrap();
        stale.state = TaskState::Processing;
        stale.updated_at = Utc::now() - Duration::minutes(20);
        store.save(&stale).unwrap();

        let found = store
            .find_stale(TaskState::Processing, Duration::minutes(10), 100)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, stale.task_id);
    }

    #[test]
    fn test_queue_fifo_per_kind() {
        let queue = MemoryTaskQueue::default();
        queue.push(TaskKind::SyncPackage, "a").unwrap();
        queue.push(TaskKind::SyncPackage, "b").unwrap();
        queue.push(TaskKind::ChangesStream, "c").unwrap();

        assert_eq!(queue.len(TaskKind::SyncPackage).unwrap(), 2);
        assert_eq!(queue.pop(TaskKind::SyncPackage).unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop(TaskKind::SyncPackage).unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop(TaskKind::SyncPackage).unwrap(), None);
        assert_eq!(queue.pop(TaskKind::ChangesStream).unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn test_log_store_position_conflict() {
        let logs = MemoryLogStore::new();
        let next = logs.append("/t/1.log", b"hello\n", 0).unwrap();
        assert_eq!(next, 6);

        let err = logs.append("/t/1.log", b"again\n", 0).unwrap_err();
        assert!(matches!(err, CoreError::LogPositionConflict { .. }));
        assert!(err.is_append_fallback());

        logs.append("/t/1.log", b"again\n", 6).unwrap();
        assert_eq!(logs.read("/t/1.log").unwrap(), b"hello\nagain\n");
    }

    #[test]
    fn test_log_store_not_appendable() {
        let logs = MemoryLogStore::new();
        logs.set_appendable(false);
        let err = logs.append("/t/2.log", b"x", 0).unwrap_err();
        assert!(matches!(err, CoreError::LogNotAppendable { .. }));

        logs.upload("/t/2.log", b"x").unwrap();
        assert_eq!(logs.read("/t/2.log").unwrap(), b"x");
    }

    #[test]
    fn test_publish_already_exists_is_not_a_mutation() {
        let store = MemoryPackageStore::new();
        let publish = PublishVersion {
            fullname: "pkg".to_string(),
            version: "1.0.0".to_string(),
            meta: VersionMeta::default(),
            readme: None,
            tarball_path: "/tmp/pkg-1.0.0.tgz".into(),
        };
        assert_eq!(
            store.publish(publish.clone()).unwrap(),
            PublishOutcome::Published
        );
        let before = store.mutation_count();
        assert_eq!(
            store.publish(publish).unwrap(),
            PublishOutcome::AlreadyExists
        );
        assert_eq!(store.mutation_count(), before);
    }

    #[test]
    fn test_idempotent_tag_and_maintainer_writes() {
        let store = MemoryPackageStore::new();
        store.insert_synced_package("pkg", "npmjs");
        store.set_dist_tag("pkg", "latest", "1.0.0").unwrap();
        store
            .replace_maintainers("pkg", &["npm:alice".to_string()])
            .unwrap();

        let before = store.mutation_count();
        store.set_dist_tag("pkg", "latest", "1.0.0").unwrap();
        store
            .replace_maintainers("pkg", &["npm:alice".to_string()])
            .unwrap();
        store.set_registry("pkg", "npmjs").unwrap();
        assert_eq!(store.mutation_count(), before);
    }
}
