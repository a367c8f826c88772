//! Core task machinery for the mirra registry mirror.
//!
//! This crate owns the [`Task`](task::Task) data model and state machine,
//! the gateway traits every storage backend implements, in-memory reference
//! backends, and the [`TaskCoordinator`](coordinator::TaskCoordinator) that
//! every producer and worker goes through.

pub mod coordinator;
pub mod error;
pub mod store;
pub mod task;

pub use coordinator::{TaskCoordinator, TimeoutSweep};
pub use error::{CoreError, Result};
pub use store::{
    memory::{
        MemoryLogStore, MemoryManifestCache, MemoryPackageStore, MemoryTaskQueue, MemoryTaskStore,
    },
    LocalPackage, LocalVersion, LogStore, ManifestCache, PackageStore, PublishOutcome,
    PublishVersion, TaskQueue, TaskStore, VersionMeta, VersionPatch,
};
pub use task::{ChangesStreamPayload, SyncPackagePayload, Task, TaskKind, TaskState};
