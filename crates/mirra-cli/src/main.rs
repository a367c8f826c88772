use std::{sync::Arc, thread, time::Duration};

use clap::Parser;
use cli::{Args, Commands};
use logging::setup_logging;
use mirra_config::{Config, ConfigHandle};
use mirra_core::{
    MemoryLogStore, MemoryManifestCache, MemoryPackageStore, MemoryTaskQueue, MemoryTaskStore,
    SyncPackagePayload, Task, TaskCoordinator,
};
use mirra_feed::SubscriptionContext;
use mirra_fetch::configure_http_client;
use mirra_sync::{HttpClient, Reconciler, SyncContext};
use tracing::info;
use ureq::Proxy;

mod cli;
mod logging;
mod worker;

struct App {
    config: ConfigHandle,
    coordinator: Arc<TaskCoordinator>,
    reconciler: Arc<Reconciler>,
    subscription: SubscriptionContext,
}

fn build_app(config: Config) -> App {
    let handle = ConfigHandle::new(config);
    let tasks = Arc::new(MemoryTaskStore::default());
    let queue = Arc::new(MemoryTaskQueue::default());
    let packages = Arc::new(MemoryPackageStore::new());
    let coordinator = Arc::new(TaskCoordinator::new(
        tasks.clone(),
        queue,
        Arc::new(MemoryLogStore::new()),
        handle.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        SyncContext {
            coordinator: coordinator.clone(),
            packages: packages.clone(),
            cache: Arc::new(MemoryManifestCache::default()),
            config: handle.clone(),
        },
        Arc::new(HttpClient::new()),
    ));
    let subscription = SubscriptionContext {
        coordinator: coordinator.clone(),
        tasks,
        packages,
        config: handle.clone(),
    };
    App {
        config: handle,
        coordinator,
        reconciler,
        subscription,
    }
}

fn run(app: &App, once: bool) -> miette::Result<()> {
    let config = app.config.snapshot();

    if config.sync.enable_changes_stream() {
        for registry in &config.registries {
            app.coordinator
                .create_task(Task::changes_stream(&registry.name)?, true)?;
        }
    }

    let workers = config.sync.workers_per_kind();
    info!("Starting sync engine: {workers} sync workers, once={once}");

    if once {
        // Deterministic drain: consume the feeds first so every spawned
        // sync task is queued before the workers start.
        worker::changes_worker(app.subscription.clone(), true);
    } else {
        let subscription = app.subscription.clone();
        thread::spawn(move || worker::changes_worker(subscription, false));
        let coordinator = app.coordinator.clone();
        thread::spawn(move || worker::sweeper(coordinator));
    }

    let mut handles = Vec::new();
    for _ in 0..workers {
        let coordinator = app.coordinator.clone();
        let reconciler = app.reconciler.clone();
        handles.push(thread::spawn(move || {
            worker::sync_worker(coordinator, reconciler, once)
        }));
    }
    // In continuous mode the workers never return; the process runs
    // until killed.
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    let config = Config::load(&args.config)?;

    let proxy = match &args.proxy {
        Some(raw) => Some(
            Proxy::new(raw).map_err(|err| miette::miette!("invalid proxy '{raw}': {err}"))?,
        ),
        None => None,
    };
    let timeout = config.sync.http_timeout_secs();
    let user_agent = args.user_agent.clone();
    configure_http_client(move |client| {
        client.timeout = Some(Duration::from_secs(timeout));
        if proxy.is_some() {
            client.proxy = proxy;
        }
        if user_agent.is_some() {
            client.user_agent = user_agent;
        }
    });

    let app = build_app(config);
    match args.command {
        Commands::Run { once } => run(&app, once)?,
        Commands::Sweep => {
            let sweep = app.coordinator.retry_execute_timeout_tasks()?;
            info!(
                "Sweep: requeued {} stuck, timed out {}, recovered {} waiting",
                sweep.processing_requeued, sweep.processing_timed_out, sweep.waiting_requeued
            );
        }
        Commands::Enqueue {
            package,
            versions,
            force,
            registry,
        } => {
            let payload = SyncPackagePayload {
                specific_versions: (!versions.is_empty()).then_some(versions),
                force_sync_history: force,
                registry_name: registry,
                tips: Some("manual enqueue".to_string()),
                ..Default::default()
            };
            let task = app
                .coordinator
                .create_task(Task::sync_package(&package, payload)?, true)?;
            info!("Queued {package} as task {}", task.task_id);
        }
    }
    Ok(())
}
