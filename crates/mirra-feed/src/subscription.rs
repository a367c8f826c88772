//! The change-feed subscription driver.
//!
//! Executes a changes-stream task: bootstraps a cursor when none is
//! stored, then pulls pages, routes every observed package through the
//! deployment's ownership rules and spawns reconciliation tasks for the
//! ones this mirror should pick up. The cursor is persisted after every
//! record, so a crash re-delivers at most one change.

use std::{sync::Arc, thread, time::Duration};

use chrono::Utc;
use mirra_config::{scope_of, Config, ConfigHandle, Registry, SyncMode};
use mirra_core::{
    PackageStore, SyncPackagePayload, Task, TaskCoordinator, TaskStore,
};
use tracing::{info, warn};

use crate::{
    error::{FeedError, Result},
    feed::{feed_for, ChangeFeed},
};

/// Collaborators the driver needs; shared across worker threads.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub coordinator: Arc<TaskCoordinator>,
    pub tasks: Arc<dyn TaskStore>,
    pub packages: Arc<dyn PackageStore>,
    pub config: ConfigHandle,
}

/// How long the driver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Loop forever, pausing the poll interval between pages.
    Continuous,
    /// Stop at the first empty page; used by one-shot runs and tests.
    Bounded,
}

/// Whether a change observed on `registry` should be mirrored here.
///
/// Rejections, in order: packages published directly on this deployment;
/// packages recorded as owned by a different upstream; unknown packages
/// when the policy only refreshes what already exists. Scoped names must
/// come from the registry their scope is bound to; everything else is
/// accepted only from the catch-all registry.
pub fn needs_sync(
    config: &Config,
    packages: &dyn PackageStore,
    registry: &Registry,
    fullname: &str,
) -> Result<bool> {
    let local = packages.find_package(fullname)?;

    if let Some(local) = &local {
        if local.is_private {
            return Ok(false);
        }
        if let Some(owner) = &local.registry_name {
            if owner != &registry.name {
                return Ok(false);
            }
        }
    }

    if config.sync.mode() == SyncMode::Exist && local.is_none() {
        return Ok(false);
    }

    match scope_of(fullname).and_then(|scope| config.registry_for_scope(scope)) {
        Some(owner) => Ok(owner.name == registry.name),
        None => Ok(registry.is_catch_all()),
    }
}

/// Executes one changes-stream task against its registry's feed adapter.
pub fn execute_changes_task(
    ctx: &SubscriptionContext,
    task: &mut Task,
    mode: SubscriptionMode,
) -> Result<()> {
    let config = ctx.config.snapshot();
    let registry = config
        .registry(&task.target_name)
        .ok_or_else(|| FeedError::UnknownRegistry(task.target_name.clone()))?;
    run_subscription(ctx, task, mode, feed_for(registry.kind))
}

/// The driver proper, with the feed adapter injected.
pub(crate) fn run_subscription(
    ctx: &SubscriptionContext,
    task: &mut Task,
    mode: SubscriptionMode,
    feed: &dyn ChangeFeed,
) -> Result<()> {
    let registry_name = task.target_name.clone();
    let mut payload = task.changes_payload()?;

    if payload.since.is_empty() {
        let config = ctx.config.snapshot();
        let registry = config
            .registry(&registry_name)
            .ok_or_else(|| FeedError::UnknownRegistry(registry_name.clone()))?;
        payload.since = feed.initial_since(registry)?;
        info!(
            "Bootstrapped changes cursor for {registry_name} at {}",
            payload.since
        );
        // Durable before the first fetch: a crash must not re-bootstrap.
        task.set_changes_payload(&payload)?;
        task.updated_at = Utc::now();
        ctx.tasks.save(task)?;
    }

    loop {
        let config = ctx.config.snapshot();
        if !config.sync.enable_changes_stream() {
            info!("Changes stream disabled; stopping subscription for {registry_name}");
            break;
        }
        let registry = config
            .registry(&registry_name)
            .ok_or_else(|| FeedError::UnknownRegistry(registry_name.clone()))?;

        let page = match feed.fetch_changes(registry, &payload.since) {
            Ok(page) => page,
            Err(err) => {
                warn!("Change fetch from {registry_name} failed: {err}; suspending");
                ctx.coordinator.retry_task(
                    task,
                    Some(&format!(
                        "[{}] fetch since {} failed: {err}",
                        Utc::now().to_rfc3339(),
                        payload.since
                    )),
                )?;
                return Ok(());
            }
        };

        let mut page_records = 0usize;
        for item in page {
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    warn!("Change stream from {registry_name} broke: {err}; suspending");
                    ctx.coordinator.retry_task(
                        task,
                        Some(&format!(
                            "[{}] stream broke after {}: {err}",
                            Utc::now().to_rfc3339(),
                            payload.since
                        )),
                    )?;
                    return Ok(());
                }
            };
            page_records += 1;

            // One unschedulable package must not stall the feed: routing
            // and scheduling errors are logged and the record skipped.
            let scheduled = needs_sync(&config, ctx.packages.as_ref(), registry, &record.fullname)
                .and_then(|wanted| {
                    if !wanted {
                        return Ok(false);
                    }
                    let sync = Task::sync_package(
                        &record.fullname,
                        SyncPackagePayload {
                            registry_name: Some(registry.name.clone()),
                            tips: Some(format!(
                                "changes stream {registry_name} seq {}",
                                record.sequence
                            )),
                            ..Default::default()
                        },
                    )?;
                    ctx.coordinator.create_task(sync, true)?;
                    Ok(true)
                });
            match scheduled {
                Ok(true) => payload.task_count += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("Could not schedule sync for {}: {err}", record.fullname);
                }
            }

            payload.since = record.sequence.clone();
            payload.last_package = Some(record.fullname);
            task.set_changes_payload(&payload)?;
            task.updated_at = Utc::now();
            ctx.tasks.save(task)?;
        }

        match mode {
            SubscriptionMode::Bounded => {
                if page_records == 0 {
                    break;
                }
            }
            SubscriptionMode::Continuous => {
                thread::sleep(Duration::from_millis(
                    config.sync.changes_poll_interval_ms(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::Mutex,
    };

    use mirra_config::{RegistryKind, SyncPolicy};
    use mirra_core::{
        CoreError, LocalPackage, LocalVersion, MemoryLogStore, MemoryPackageStore,
        MemoryTaskQueue, MemoryTaskStore, PublishOutcome, PublishVersion, TaskKind, TaskQueue,
        TaskState, VersionPatch,
    };

    use super::*;
    use crate::feed::{ChangePage, ChangeRecord};

    fn registry(name: &str, scopes: &[&str]) -> Registry {
        Registry {
            name: name.to_string(),
            host: format!("https://{name}.example"),
            changes_url: format!("https://{name}.example/changes"),
            kind: RegistryKind::Cnpmcore,
            user_prefix: None,
            auth_token: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn test_config() -> Config {
        Config {
            self_registry: None,
            registries: vec![
                registry("npmjs", &[]),
                registry("internal", &["@internal"]),
            ],
            sync: SyncPolicy::default(),
        }
    }

    enum Step {
        Page(Vec<ChangeRecord>),
        Fail,
    }

    /// Replays scripted pages, then empty pages forever.
    struct ScriptedFeed {
        steps: Mutex<VecDeque<Step>>,
    }

    impl ScriptedFeed {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
            }
        }
    }

    impl ChangeFeed for ScriptedFeed {
        fn initial_since(&self, _registry: &Registry) -> Result<String> {
            Ok("100".to_string())
        }

        fn fetch_changes(&self, _registry: &Registry, _since: &str) -> Result<ChangePage> {
            match self.steps.lock().unwrap().pop_front() {
                Some(Step::Page(records)) => {
                    Ok(Box::new(records.into_iter().map(Ok)))
                }
                Some(Step::Fail) => Err(FeedError::MalformedPage {
                    url: "scripted".to_string(),
                    reason: "scripted failure".to_string(),
                }),
                None => Ok(Box::new(std::iter::empty())),
            }
        }
    }

    struct Fixture {
        ctx: SubscriptionContext,
        queue: Arc<MemoryTaskQueue>,
        packages: Arc<MemoryPackageStore>,
    }

    fn fixture(config: Config) -> Fixture {
        let tasks = Arc::new(MemoryTaskStore::default());
        let queue = Arc::new(MemoryTaskQueue::default());
        let packages = Arc::new(MemoryPackageStore::default());
        let handle = ConfigHandle::new(config);
        let coordinator = Arc::new(TaskCoordinator::new(
            tasks.clone(),
            queue.clone(),
            Arc::new(MemoryLogStore::new()),
            handle.clone(),
        ));
        Fixture {
            ctx: SubscriptionContext {
                coordinator,
                tasks,
                packages: packages.clone(),
                config: handle,
            },
            queue,
            packages,
        }
    }

    fn record(seq: &str, fullname: &str) -> ChangeRecord {
        ChangeRecord {
            sequence: seq.to_string(),
            fullname: fullname.to_string(),
        }
    }

    #[test]
    fn test_needs_sync_routing() {
        let config = test_config();
        let packages = MemoryPackageStore::default();
        packages.insert_private_package("my-own");
        packages.insert_synced_package("taken", "internal");
        let npmjs = config.registry("npmjs").unwrap();
        let internal = config.registry("internal").unwrap();

        // Unscoped names belong to the catch-all only.
        assert!(needs_sync(&config, &packages, npmjs, "lodash").unwrap());
        assert!(!needs_sync(&config, &packages, internal, "lodash").unwrap());

        // Scoped names belong to the registry their scope is bound to.
        assert!(needs_sync(&config, &packages, internal, "@internal/tool").unwrap());
        assert!(!needs_sync(&config, &packages, npmjs, "@internal/tool").unwrap());
        // An unbound scope falls back to the catch-all.
        assert!(needs_sync(&config, &packages, npmjs, "@other/pkg").unwrap());

        // Local ownership overrides routing.
        assert!(!needs_sync(&config, &packages, npmjs, "my-own").unwrap());
        assert!(!needs_sync(&config, &packages, npmjs, "taken").unwrap());
    }

    #[test]
    fn test_needs_sync_exist_mode_skips_unknown_packages() {
        let mut config = test_config();
        config.sync.mode = Some(SyncMode::Exist);
        let packages = MemoryPackageStore::default();
        packages.insert_synced_package("known", "npmjs");
        let npmjs = config.registry("npmjs").unwrap();

        assert!(needs_sync(&config, &packages, npmjs, "known").unwrap());
        assert!(!needs_sync(&config, &packages, npmjs, "unknown").unwrap());
    }

    #[test]
    fn test_bootstrap_persists_cursor_before_first_fetch() {
        let f = fixture(test_config());
        let mut task = Task::changes_stream("npmjs").unwrap();
        f.ctx.tasks.save(&task).unwrap();

        let feed = ScriptedFeed::new(vec![]);
        run_subscription(&f.ctx, &mut task, SubscriptionMode::Bounded, &feed).unwrap();

        let stored = f.ctx.tasks.get(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.changes_payload().unwrap().since, "100");
    }

    #[test]
    fn test_records_spawn_tasks_and_advance_cursor() {
        let f = fixture(test_config());
        f.packages.insert_private_package("my-own");
        let mut task = Task::changes_stream("npmjs").unwrap();
        f.ctx.tasks.save(&task).unwrap();

        let feed = ScriptedFeed::new(vec![Step::Page(vec![
            record("101", "lodash"),
            record("102", "@internal/tool"),
            record("103", "my-own"),
        ])]);
        run_subscription(&f.ctx, &mut task, SubscriptionMode::Bounded, &feed).unwrap();

        // Only the catch-all-owned public package got a task.
        assert_eq!(f.queue.len(TaskKind::SyncPackage).unwrap(), 1);
        let spawned = f
            .ctx
            .tasks
            .find_active("lodash", TaskKind::SyncPackage, None)
            .unwrap()
            .unwrap();
        let payload = spawned.sync_payload().unwrap();
        assert_eq!(payload.registry_name.as_deref(), Some("npmjs"));
        assert!(f
            .ctx
            .tasks
            .find_active("@internal/tool", TaskKind::SyncPackage, None)
            .unwrap()
            .is_none());

        // The cursor advanced past every record, tasked or not.
        let stream = task.changes_payload().unwrap();
        assert_eq!(stream.since, "103");
        assert_eq!(stream.task_count, 1);
        assert_eq!(stream.last_package.as_deref(), Some("my-own"));
    }

    #[test]
    fn test_fetch_failure_suspends_instead_of_failing() {
        let f = fixture(test_config());
        let mut task = Task::changes_stream("npmjs").unwrap();
        task.data = serde_json::to_value(mirra_core::ChangesStreamPayload {
            since: "100".to_string(),
            ..Default::default()
        })
        .unwrap();
        f.ctx.tasks.save(&task).unwrap();

        let feed = ScriptedFeed::new(vec![Step::Fail]);
        run_subscription(&f.ctx, &mut task, SubscriptionMode::Continuous, &feed).unwrap();

        // Back to Waiting and requeued for a later attempt.
        let stored = f.ctx.tasks.get(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Waiting);
        assert_eq!(f.queue.len(TaskKind::ChangesStream).unwrap(), 1);
    }

    #[test]
    fn test_disabled_stream_stops_without_fetching() {
        let mut config = test_config();
        config.sync.enable_changes_stream = Some(false);
        let f = fixture(config);
        let mut task = Task::changes_stream("npmjs").unwrap();
        task.data = serde_json::to_value(mirra_core::ChangesStreamPayload {
            since: "100".to_string(),
            ..Default::default()
        })
        .unwrap();
        f.ctx.tasks.save(&task).unwrap();

        let feed = ScriptedFeed::new(vec![Step::Fail]);
        run_subscription(&f.ctx, &mut task, SubscriptionMode::Continuous, &feed).unwrap();

        // The scripted failure page was never requested.
        assert!(!feed.steps.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_registry_is_an_error() {
        let f = fixture(test_config());
        let mut task = Task::changes_stream("nowhere").unwrap();
        let err = execute_changes_task(&f.ctx, &mut task, SubscriptionMode::Bounded).unwrap_err();
        assert!(matches!(err, FeedError::UnknownRegistry(name) if name == "nowhere"));
    }

    #[test]
    fn test_duplicate_changes_spawn_one_merged_task() {
        let f = fixture(test_config());
        let mut task = Task::changes_stream("npmjs").unwrap();
        f.ctx.tasks.save(&task).unwrap();

        let feed = ScriptedFeed::new(vec![Step::Page(vec![
            record("101", "lodash"),
            record("102", "lodash"),
        ])]);
        run_subscription(&f.ctx, &mut task, SubscriptionMode::Bounded, &feed).unwrap();

        // Second change merged into the first Waiting task.
        let active = f
            .ctx
            .tasks
            .find_active("lodash", TaskKind::SyncPackage, None)
            .unwrap()
            .unwrap();
        assert_eq!(active.state, TaskState::Waiting);
        assert_eq!(task.changes_payload().unwrap().task_count, 2);
    }

    /// Errors on one fullname; routing for everything else sees an
    /// empty store.
    struct PoisonedPackages {
        poison: &'static str,
    }

    impl PackageStore for PoisonedPackages {
        fn find_package(&self, fullname: &str) -> mirra_core::Result<Option<LocalPackage>> {
            if fullname == self.poison {
                Err(CoreError::PackageStore("store offline".to_string()))
            } else {
                Ok(None)
            }
        }
        fn versions(&self, _: &str) -> mirra_core::Result<Vec<LocalVersion>> {
            unimplemented!()
        }
        fn dist_tags(&self, _: &str) -> mirra_core::Result<BTreeMap<String, String>> {
            unimplemented!()
        }
        fn maintainers(&self, _: &str) -> mirra_core::Result<Vec<String>> {
            unimplemented!()
        }
        fn publish(&self, _: PublishVersion) -> mirra_core::Result<PublishOutcome> {
            unimplemented!()
        }
        fn update_version(&self, _: &str, _: &str, _: &VersionPatch) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn remove_version(&self, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn set_dist_tag(&self, _: &str, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn remove_dist_tag(&self, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn save_user(&self, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn replace_maintainers(&self, _: &str, _: &[String]) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn set_registry(&self, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn block_package(&self, _: &str, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
        fn unpublish_package(&self, _: &str) -> mirra_core::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_record_routing_error_is_skipped_not_fatal() {
        let tasks = Arc::new(MemoryTaskStore::default());
        let queue = Arc::new(MemoryTaskQueue::default());
        let handle = ConfigHandle::new(test_config());
        let coordinator = Arc::new(TaskCoordinator::new(
            tasks.clone(),
            queue.clone(),
            Arc::new(MemoryLogStore::new()),
            handle.clone(),
        ));
        let ctx = SubscriptionContext {
            coordinator,
            tasks: tasks.clone(),
            packages: Arc::new(PoisonedPackages { poison: "bad-pkg" }),
            config: handle,
        };

        let mut task = Task::changes_stream("npmjs").unwrap();
        ctx.tasks.save(&task).unwrap();
        let feed = ScriptedFeed::new(vec![Step::Page(vec![
            record("101", "bad-pkg"),
            record("102", "lodash"),
        ])]);
        run_subscription(&ctx, &mut task, SubscriptionMode::Bounded, &feed).unwrap();

        // The bad record was skipped; the next one still scheduled, and
        // the cursor moved past both.
        assert!(tasks
            .find_active("lodash", TaskKind::SyncPackage, None)
            .unwrap()
            .is_some());
        let stream = task.changes_payload().unwrap();
        assert_eq!(stream.since, "102");
        assert_eq!(stream.task_count, 1);
        // The subscription itself was not suspended or failed.
        assert_eq!(queue.len(TaskKind::ChangesStream).unwrap(), 0);
    }
}
