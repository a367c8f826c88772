//! Manifest reconciliation: converge one local package onto its
//! upstream manifest.
//!
//! The algorithm is a diff, not a replay: every step compares upstream
//! state to local state and only writes the difference, so running the
//! same reconciliation twice leaves the second run with nothing to do.
//! Per-version failures are recorded and skipped; only a run where every
//! candidate version fails aborts the task.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::Utc;
use mirra_config::{ConfigHandle, Registry, SyncDeleteMode};
use mirra_core::{
    LocalPackage, LocalVersion, ManifestCache, PackageStore, PublishOutcome, PublishVersion,
    SyncPackagePayload, Task, TaskCoordinator, TaskKind, TaskState, VersionPatch,
};
use tracing::{info, warn};

use crate::{
    client::{ManifestFetch, UpstreamClient},
    error::{Result, SyncError},
    manifest::{UpstreamManifest, UpstreamVersion, SECURITY_HOLDER},
    resolve::{resolve_registry, Resolution},
};

/// Attempts after which a retryable reconciliation failure is final.
const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Accumulates the human-readable task log, one timestamped line per
/// reconciliation step.
#[derive(Default)]
pub struct TaskLogBuffer {
    lines: Vec<String>,
}

impl TaskLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: impl AsRef<str>) {
        self.lines
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), msg.as_ref()));
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// What one reconciliation run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed {
        published: usize,
        updated: usize,
        failed: usize,
    },
    /// Upstream no longer serves the package; the configured delete mode
    /// was applied.
    Removed(SyncDeleteMode),
    /// Published directly on this deployment; nothing to pull.
    SkippedPrivate,
}

/// Collaborators the reconciler drives; shared across worker threads.
#[derive(Clone)]
pub struct SyncContext {
    pub coordinator: Arc<TaskCoordinator>,
    pub packages: Arc<dyn PackageStore>,
    pub cache: Arc<dyn ManifestCache>,
    pub config: ConfigHandle,
}

pub struct Reconciler {
    ctx: SyncContext,
    client: Arc<dyn UpstreamClient>,
}

impl Reconciler {
    pub fn new(ctx: SyncContext, client: Arc<dyn UpstreamClient>) -> Self {
        Self { ctx, client }
    }

    /// Worker entry point: reconciles and finalizes the claimed task.
    ///
    /// Retryable failures requeue the task until its attempts are spent;
    /// everything else is terminal.
    pub fn execute_sync_task(&self, task: &mut Task) -> mirra_core::Result<()> {
        let mut log = TaskLogBuffer::new();
        match self.reconcile(task, &mut log) {
            Ok(outcome) => {
                info!("Synced {}: {outcome:?}", task.target_name);
                log.push(format!("done: {outcome:?}"));
                self.ctx
                    .coordinator
                    .finish_task(task, TaskState::Success, Some(&log.render()))
            }
            Err(err) if err.is_retryable() && task.attempts < MAX_SYNC_ATTEMPTS => {
                warn!(
                    "Sync of {} failed on attempt {}: {err}; requeueing",
                    task.target_name, task.attempts
                );
                log.push(format!("attempt {} failed: {err}", task.attempts));
                self.ctx.coordinator.retry_task(task, Some(&log.render()))
            }
            Err(err) => {
                warn!("Sync of {} failed terminally: {err}", task.target_name);
                log.push(format!("failed: {err}"));
                task.error = Some(err.to_string());
                self.ctx
                    .coordinator
                    .finish_task(task, TaskState::Fail, Some(&log.render()))
            }
        }
    }

    /// Runs the reconciliation algorithm for one task.
    pub fn reconcile(&self, task: &Task, log: &mut TaskLogBuffer) -> Result<SyncOutcome> {
        let payload = task.sync_payload()?;
        let fullname = task.target_name.as_str();
        let config = self.ctx.config.snapshot();
        let packages = self.ctx.packages.as_ref();

        let local = packages.find_package(fullname)?;
        let registry = match resolve_registry(&config, local.as_ref(), &payload, fullname)? {
            Resolution::SkippedPrivate => {
                log.push(format!("{fullname} is published locally; nothing to sync"));
                return Ok(SyncOutcome::SkippedPrivate);
            }
            Resolution::Sync(registry) => registry,
        };
        log.push(format!("syncing {fullname} from {}", registry.name));
        if let Some(tips) = &payload.tips {
            log.push(format!("reason: {tips}"));
        }

        let manifest = match self.client.fetch_manifest(registry, fullname)? {
            ManifestFetch::Found(manifest) if !manifest.looks_removed() => manifest,
            ManifestFetch::Missing => {
                // A 404 is a terminal failure, never the deletion path:
                // the package does not exist upstream and local data is
                // left alone.
                return Err(SyncError::NotFoundUpstream {
                    fullname: fullname.to_string(),
                });
            }
            absent => {
                let reason = match absent {
                    ManifestFetch::Removed => "removed upstream for legal reasons",
                    _ => "marked unpublished upstream",
                };
                return self.handle_removed(
                    fullname,
                    local.as_ref(),
                    config.sync.delete_mode(),
                    reason,
                    log,
                );
            }
        };

        let mut local_versions: BTreeMap<String, LocalVersion> = packages
            .versions(fullname)?
            .into_iter()
            .map(|v| (v.version.clone(), v))
            .collect();

        if payload.force_sync_history {
            if let Some(filter) = &payload.specific_versions {
                for version in filter {
                    if local_versions.remove(version).is_some() {
                        packages.remove_version(fullname, version)?;
                        log.push(format!("removed {fullname}@{version} for forced resync"));
                    }
                }
            }
        }

        // Versions upstream no longer serves are retracted. The full
        // manifest decides this, never the specific-versions filter.
        let stale: Vec<String> = local_versions
            .keys()
            .filter(|v| !manifest.versions.contains_key(*v))
            .cloned()
            .collect();
        for version in stale {
            packages.remove_version(fullname, &version)?;
            local_versions.remove(&version);
            log.push(format!("removed {fullname}@{version}: gone upstream"));
        }

        let mut published = 0usize;
        let mut updated = 0usize;
        let mut failed = 0usize;
        let mut already = 0usize;
        let mut last_error = String::new();
        let mut dependencies: BTreeSet<String> = BTreeSet::new();

        for (version, upstream) in &manifest.versions {
            if let Some(filter) = &payload.specific_versions {
                if !filter.contains(version) {
                    continue;
                }
            }

            if let Some(existing) = local_versions.get(version) {
                if let Some(patch) = version_drift(existing, upstream, &manifest) {
                    packages.update_version(fullname, version, &patch)?;
                    updated += 1;
                    log.push(format!("updated metadata for {fullname}@{version}"));
                }
                continue;
            }

            match self.publish_version(registry, fullname, version, upstream) {
                Ok(PublishOutcome::Published) => {
                    published += 1;
                    log.push(format!("published {fullname}@{version}"));
                    dependencies.extend(upstream.dependencies.keys().cloned());
                }
                Ok(PublishOutcome::AlreadyExists) => {
                    already += 1;
                    log.push(format!("{fullname}@{version} already present"));
                }
                Err(err) => {
                    failed += 1;
                    log.push(format!("version {version} failed: {err}"));
                    last_error = err.to_string();
                }
            }
        }

        if packages.find_package(fullname)?.is_none() {
            // Nothing ever published and nothing held: failing here must
            // not leave a half-created package record. For a package that
            // does exist locally, per-version failures are tolerated and
            // the rest of the reconciliation still runs.
            if failed > 0 {
                return Err(SyncError::AllVersionsFailed {
                    fullname: fullname.to_string(),
                    attempted: failed,
                    last_error,
                });
            }
            log.push(format!("no versions of {fullname} to hold; nothing stored"));
            return Ok(SyncOutcome::Completed {
                published,
                updated,
                failed,
            });
        }

        self.sync_maintainers(registry, &manifest, fullname, log)?;
        self.sync_dist_tags(&manifest, fullname, log)?;

        packages.set_registry(fullname, &registry.name)?;
        self.ctx.cache.invalidate(fullname)?;

        if !payload.skip_dependencies && !dependencies.is_empty() {
            self.fanout_dependencies(fullname, &dependencies, config.sync.high_water_mark(), log)?;
        }

        Ok(SyncOutcome::Completed {
            published,
            updated,
            failed,
        })
    }

    fn publish_version(
        &self,
        registry: &Registry,
        fullname: &str,
        version: &str,
        upstream: &UpstreamVersion,
    ) -> Result<PublishOutcome> {
        let tarball_url = upstream
            .dist
            .as_ref()
            .and_then(|d| d.tarball.as_deref())
            .ok_or_else(|| SyncError::MalformedManifest {
                url: registry.host.clone(),
                reason: format!("version {version} has no tarball"),
            })?;

        let tarball_path = self.client.download_tarball(registry, tarball_url)?;
        let outcome = self.ctx.packages.publish(PublishVersion {
            fullname: fullname.to_string(),
            version: version.to_string(),
            meta: upstream.meta(),
            readme: upstream.readme.clone(),
            tarball_path: tarball_path.clone(),
        });
        mirra_fetch::discard(&tarball_path);

        let outcome = outcome?;
        if outcome == PublishOutcome::Published {
            if let Some(user) = &upstream.npm_user {
                self.ctx
                    .packages
                    .save_user(&format!("{}{}", registry.user_prefix(), user.name), &user.email)?;
            }
        }
        Ok(outcome)
    }

    fn sync_maintainers(
        &self,
        registry: &Registry,
        manifest: &UpstreamManifest,
        fullname: &str,
        log: &mut TaskLogBuffer,
    ) -> Result<()> {
        let mut users: Vec<(String, String)> = manifest
            .maintainers
            .iter()
            .map(|m| (m.name.clone(), m.email.clone()))
            .collect();
        if users.is_empty() {
            // Some upstreams strip the maintainer list; fall back to the
            // latest version's publisher, then to the security holder.
            if let Some(publisher) = manifest
                .latest_version()
                .and_then(|v| v.npm_user.as_ref())
            {
                log.push(format!(
                    "no maintainers upstream; using publisher {}",
                    publisher.name
                ));
                users.push((publisher.name.clone(), publisher.email.clone()));
            } else {
                log.push("no maintainers upstream; assigning security holder".to_string());
                users.push((SECURITY_HOLDER.to_string(), String::new()));
            }
        }

        let prefix = registry.user_prefix();
        let mut names = Vec::with_capacity(users.len());
        for (name, email) in users {
            let prefixed = format!("{prefix}{name}");
            self.ctx.packages.save_user(&prefixed, &email)?;
            names.push(prefixed);
        }
        self.ctx.packages.replace_maintainers(fullname, &names)?;
        Ok(())
    }

    fn sync_dist_tags(
        &self,
        manifest: &UpstreamManifest,
        fullname: &str,
        log: &mut TaskLogBuffer,
    ) -> Result<()> {
        let packages = self.ctx.packages.as_ref();
        let have: BTreeSet<String> = packages
            .versions(fullname)?
            .into_iter()
            .map(|v| v.version)
            .collect();
        let local_tags = packages.dist_tags(fullname)?;

        for (tag, version) in &manifest.dist_tags {
            if !have.contains(version) {
                // A tag pointing at a version we do not hold must not be
                // written; it would dangle.
                log.push(format!("skipping tag {tag} -> {version}: version not held"));
                continue;
            }
            packages.set_dist_tag(fullname, tag, version)?;
        }
        for tag in local_tags.keys() {
            if !manifest.dist_tags.contains_key(tag) {
                packages.remove_dist_tag(fullname, tag)?;
                log.push(format!("removed stale tag {tag}"));
            }
        }
        Ok(())
    }

    /// Queues sync tasks for dependencies introduced by newly published
    /// versions, stopping once queue depth hits the high-water mark.
    fn fanout_dependencies(
        &self,
        fullname: &str,
        dependencies: &BTreeSet<String>,
        high_water: usize,
        log: &mut TaskLogBuffer,
    ) -> Result<()> {
        for dep in dependencies {
            if self.ctx.coordinator.queue_len(TaskKind::SyncPackage)? >= high_water {
                log.push(format!(
                    "queue at high-water mark; skipping remaining dependency fan-out of {fullname}"
                ));
                break;
            }
            let sync = Task::sync_package(
                dep,
                SyncPackagePayload {
                    tips: Some(format!("dependency of {fullname}")),
                    ..Default::default()
                },
            )?;
            self.ctx.coordinator.create_task(sync, false)?;
            log.push(format!("queued dependency {dep}"));
        }
        Ok(())
    }

    fn handle_removed(
        &self,
        fullname: &str,
        local: Option<&LocalPackage>,
        mode: SyncDeleteMode,
        reason: &str,
        log: &mut TaskLogBuffer,
    ) -> Result<SyncOutcome> {
        info!("Package {fullname} {reason}; delete_mode={mode:?}");
        match mode {
            SyncDeleteMode::Ignore => {
                log.push(format!("{fullname} {reason}; keeping local copy"));
            }
            SyncDeleteMode::Block if local.is_some() => {
                self.ctx.packages.block_package(fullname, reason)?;
                self.ctx.cache.invalidate(fullname)?;
                log.push(format!("{fullname} {reason}; blocked local copy"));
            }
            SyncDeleteMode::Delete if local.is_some() => {
                self.ctx.packages.unpublish_package(fullname)?;
                self.ctx.cache.invalidate(fullname)?;
                log.push(format!("{fullname} {reason}; removed local copy"));
            }
            _ => {
                log.push(format!("{fullname} {reason}; nothing held locally"));
            }
        }
        Ok(SyncOutcome::Removed(mode))
    }
}

/// Computes the metadata patch needed to converge a held version, if any.
fn version_drift(
    existing: &LocalVersion,
    upstream: &UpstreamVersion,
    manifest: &UpstreamManifest,
) -> Option<VersionPatch> {
    let mut patch = VersionPatch::default();
    let desired = upstream.meta();
    if existing.meta != desired {
        patch.meta = Some(desired);
    }
    if existing.has_readme && upstream.readme.is_none() && manifest.readme.is_none() {
        patch.remove_readme = true;
    }
    (patch.meta.is_some() || patch.remove_readme).then_some(patch)
}
