//! The task coordinator: creation with merge/idempotency rules, optimistic
//! claims, retries, finalization and the stale-task sweep.
//!
//! Multiple worker processes share one coordinator configuration; the
//! serialization points between them are [`TaskStore::save_if_absent`]
//! (one active task per `(target_name, kind)`) and
//! [`TaskStore::save_if_state`] (a claim is granted to at most one worker
//! regardless of how many race on the same queue).

use std::sync::Arc;

use chrono::{Duration, Utc};
use mirra_config::ConfigHandle;
use tracing::{debug, warn};

use crate::{
    error::Result,
    store::{LogStore, TaskQueue, TaskStore},
    task::{Task, TaskKind, TaskState},
};

/// How long a Processing task may sit untouched before the sweep acts.
const PROCESSING_STALE_MINUTES: i64 = 10;
/// How long a Waiting task may sit untouched; symptomatic of a dead consumer.
const WAITING_STALE_MINUTES: i64 = 30;
/// Attempts after which a stale Processing task is finalized as Timeout.
const MAX_TIMEOUT_ATTEMPTS: u32 = 3;
/// Bound on how many stale tasks one sweep handles per bucket.
const SWEEP_BATCH: usize = 1000;

/// Counts returned by [`TaskCoordinator::retry_execute_timeout_tasks`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSweep {
    /// Stale Processing tasks requeued for another attempt.
    pub processing_requeued: usize,
    /// Stale Processing tasks finalized as Timeout.
    pub processing_timed_out: usize,
    /// Stale Waiting tasks requeued.
    pub waiting_requeued: usize,
}

/// Owns the task state machine on top of the store and queue gateways.
pub struct TaskCoordinator {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    logs: Arc<dyn LogStore>,
    config: ConfigHandle,
}

impl TaskCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskQueue>,
        logs: Arc<dyn LogStore>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            queue,
            logs,
            config,
        }
    }

    /// Creates a task, or merges into / returns an existing active one.
    ///
    /// `(target_name, kind)` is unique among active tasks. If an active
    /// task exists and is still Waiting, a merge-eligible kind folds the
    /// new payload in; `enqueue_if_exists` re-pushes the existing id to
    /// raise its queue priority, but only while queue depth stays below
    /// the configured high-water mark. An existing task that is already
    /// claimed swallows the request and is returned as-is — callers must
    /// not assume a fresh task was created.
    pub fn create_task(&self, task: Task, enqueue_if_exists: bool) -> Result<Task> {
        // The insert decides existence atomically; check-then-act would
        // let two racing creates both insert.
        let Some(mut existing) = self.store.save_if_absent(&task)? else {
            self.queue.push(task.kind, &task.task_id)?;
            debug!(
                "Created {} task {} for {}",
                task.kind, task.task_id, task.target_name
            );
            return Ok(task);
        };

        if existing.state != TaskState::Waiting {
            // Already claimed; the duplicate request is dropped.
            return Ok(existing);
        }

        if task.kind.is_merge_eligible() {
            let mut payload = existing.sync_payload()?;
            payload.merge(&task.sync_payload()?);
            existing.set_sync_payload(&payload)?;
            existing.updated_at = Utc::now();
            self.store.save(&existing)?;
        }

        if enqueue_if_exists {
            let high_water = self.config.snapshot().sync.high_water_mark();
            if self.queue.len(task.kind)? < high_water {
                self.queue.push(existing.kind, &existing.task_id)?;
            }
        }

        Ok(existing)
    }

    /// Pops the queue until a claimable task is found, then claims it with
    /// an optimistic conditional save. Returns `None` when the queue is
    /// exhausted. Ids that are missing or already claimed are a normal
    /// race under multi-worker pop and are skipped silently.
    pub fn find_execute_task(&self, kind: TaskKind) -> Result<Option<Task>> {
        while let Some(task_id) = self.queue.pop(kind)? {
            let Some(mut task) = self.store.get(&task_id)? else {
                continue;
            };
            if task.state != TaskState::Waiting {
                continue;
            }

            task.state = TaskState::Processing;
            task.attempts += 1;
            task.updated_at = Utc::now();
            if self.store.save_if_state(&task, TaskState::Waiting)? {
                debug!(
                    "Claimed {} task {} (attempt {})",
                    kind, task.task_id, task.attempts
                );
                return Ok(Some(task));
            }
            // Lost the claim race to another worker.
        }
        Ok(None)
    }

    /// Puts a task back to Waiting and re-pushes it.
    pub fn retry_task(&self, task: &mut Task, append_log: Option<&str>) -> Result<()> {
        if let Some(text) = append_log {
            self.append_task_log(task, text)?;
        }
        if task.attempts >= 1 {
            // Each new attempt starts a fresh log object.
            task.log_store_position = None;
        }
        task.state = TaskState::Waiting;
        task.updated_at = Utc::now();
        self.store.save(task)?;
        self.queue.push(task.kind, &task.task_id)
    }

    /// Appends final log text, sets a terminal state, and moves the record
    /// to the history store.
    pub fn finish_task(
        &self,
        task: &mut Task,
        state: TaskState,
        append_log: Option<&str>,
    ) -> Result<()> {
        debug_assert!(state.is_terminal());
        if let Some(text) = append_log {
            self.append_task_log(task, text)?;
        }
        task.state = state;
        task.updated_at = Utc::now();
        self.store.move_to_history(task)?;
        debug!(
            "Finished {} task {} for {} as {:?}",
            task.kind, task.task_id, task.target_name, state
        );
        Ok(())
    }

    /// Appends human-readable log text to the task's log object, falling
    /// back to a full overwrite when the object changed concurrently.
    pub fn append_task_log(&self, task: &mut Task, text: &str) -> Result<()> {
        let mut bytes = text.as_bytes().to_vec();
        if !text.ends_with('\n') {
            bytes.push(b'\n');
        }
        let offset = task.log_store_position.unwrap_or(0);
        match self.logs.append(&task.log_path, &bytes, offset) {
            Ok(next_offset) => task.log_store_position = Some(next_offset),
            Err(err) if err.is_append_fallback() => {
                warn!("Log append to {} failed ({err}), overwriting", task.log_path);
                self.logs.upload(&task.log_path, &bytes)?;
                task.log_store_position = Some(bytes.len() as u64);
            }
            Err(err) => return Err(err),
        }
        self.store.save(task)
    }

    /// Recovers stuck tasks. Safe to call repeatedly; once nothing is
    /// stale it is a no-op.
    ///
    /// Processing tasks untouched for 10 minutes are requeued, or
    /// finalized as Timeout once they have burned three attempts — except
    /// the continuously-running ChangesStream kind, which never times out.
    /// Waiting tasks untouched for 30 minutes were lost by a dead consumer
    /// and are requeued.
    pub fn retry_execute_timeout_tasks(&self) -> Result<TimeoutSweep> {
        let mut sweep = TimeoutSweep::default();

        let stuck = self.store.find_stale(
            TaskState::Processing,
            Duration::minutes(PROCESSING_STALE_MINUTES),
            SWEEP_BATCH,
        )?;
        for mut task in stuck {
            if task.kind != TaskKind::ChangesStream && task.attempts >= MAX_TIMEOUT_ATTEMPTS {
                task.error = Some(format!("timeout after {} attempts", task.attempts));
                let line = format!(
                    "[{}] task timed out after {} attempts",
                    Utc::now().to_rfc3339(),
                    task.attempts
                );
                self.finish_task(&mut task, TaskState::Timeout, Some(&line))?;
                sweep.processing_timed_out += 1;
            } else {
                warn!(
                    "Requeueing stuck {} task {} for {} (attempt {})",
                    task.kind, task.task_id, task.target_name, task.attempts
                );
                self.retry_task(&mut task, None)?;
                sweep.processing_requeued += 1;
            }
        }

        let lost = self.store.find_stale(
            TaskState::Waiting,
            Duration::minutes(WAITING_STALE_MINUTES),
            SWEEP_BATCH,
        )?;
        for mut task in lost {
            self.retry_task(&mut task, None)?;
            sweep.waiting_requeued += 1;
        }

        Ok(sweep)
    }

    pub fn queue_len(&self, kind: TaskKind) -> Result<usize> {
        self.queue.len(kind)
    }

    pub fn high_water_mark(&self) -> usize {
        self.config.snapshot().sync.high_water_mark()
    }
}
