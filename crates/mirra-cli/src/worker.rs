//! Worker loops: one pool per task kind plus the stale-task sweeper.

use std::{sync::Arc, thread, time::Duration};

use chrono::Utc;
use mirra_core::{Task, TaskCoordinator, TaskKind, TaskState, TaskStore};
use mirra_feed::{execute_changes_task, SubscriptionContext, SubscriptionMode};
use mirra_sync::Reconciler;
use tracing::{error, info};

const IDLE_POLL: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Claims and executes sync tasks until the queue drains (`once`) or
/// forever.
pub fn sync_worker(coordinator: Arc<TaskCoordinator>, reconciler: Arc<Reconciler>, once: bool) {
    loop {
        match coordinator.find_execute_task(TaskKind::SyncPackage) {
            Ok(Some(mut task)) => {
                if let Err(err) = reconciler.execute_sync_task(&mut task) {
                    error!("Could not finalize sync task {}: {err}", task.task_id);
                }
            }
            Ok(None) => {
                if once {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
            Err(err) => {
                error!("Sync queue pop failed: {err}");
                thread::sleep(IDLE_POLL);
            }
        }
    }
}

/// Claims changes-stream tasks and hands each one to a driver.
///
/// A continuous subscription blocks for the life of the process, so
/// every claimed task gets its own thread; otherwise one registry's
/// stream would starve the rest. A bounded run drives the tasks inline,
/// one after another, and returns once the queue is empty.
pub fn changes_worker(ctx: SubscriptionContext, once: bool) {
    let mode = if once {
        SubscriptionMode::Bounded
    } else {
        SubscriptionMode::Continuous
    };
    loop {
        match ctx.coordinator.find_execute_task(TaskKind::ChangesStream) {
            Ok(Some(task)) => {
                if once {
                    drive_changes_task(&ctx, task, mode);
                } else {
                    let ctx = ctx.clone();
                    thread::spawn(move || drive_changes_task(&ctx, task, mode));
                }
            }
            Ok(None) => {
                if once {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
            Err(err) => {
                error!("Changes queue pop failed: {err}");
                thread::sleep(IDLE_POLL);
            }
        }
    }
}

fn drive_changes_task(ctx: &SubscriptionContext, mut task: Task, mode: SubscriptionMode) {
    match execute_changes_task(ctx, &mut task, mode) {
        Ok(()) => {
            if task.state == TaskState::Processing {
                // The driver returned without suspending (bounded run,
                // or the stream was disabled). Park the task as Waiting
                // without requeueing it, so the claim loop does not
                // spin on it; the next `run` picks it up.
                task.state = TaskState::Waiting;
                task.updated_at = Utc::now();
                if let Err(err) = ctx.tasks.save(&task) {
                    error!("Could not park changes task {}: {err}", task.task_id);
                }
            }
        }
        Err(err) => {
            error!("Changes task {} failed: {err}", task.task_id);
            task.error = Some(err.to_string());
            let message = err.to_string();
            if let Err(err) = ctx
                .coordinator
                .finish_task(&mut task, TaskState::Fail, Some(&message))
            {
                error!("Could not finalize changes task {}: {err}", task.task_id);
            }
        }
    }
}

/// Periodically recovers stuck tasks. Runs for the life of the process.
pub fn sweeper(coordinator: Arc<TaskCoordinator>) {
    loop {
        thread::sleep(SWEEP_INTERVAL);
        match coordinator.retry_execute_timeout_tasks() {
            Ok(sweep) => {
                if sweep.processing_requeued > 0
                    || sweep.processing_timed_out > 0
                    || sweep.waiting_requeued > 0
                {
                    info!(
                        "Sweep: requeued {} stuck, timed out {}, recovered {} waiting",
                        sweep.processing_requeued,
                        sweep.processing_timed_out,
                        sweep.waiting_requeued
                    );
                }
            }
            Err(err) => error!("Timeout sweep failed: {err}"),
        }
    }
}
