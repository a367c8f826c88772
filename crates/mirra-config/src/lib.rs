//! Configuration for the mirra registry mirror.
//!
//! Configuration is loaded from a TOML file into an immutable [`Config`]
//! snapshot. Long-running loops hold a [`ConfigHandle`] and take a fresh
//! snapshot once per iteration, so operators can swap settings at runtime
//! without ambient global state.

pub mod config;
pub mod error;
pub mod registry;

pub use config::{Config, ConfigHandle, SyncDeleteMode, SyncMode, SyncPolicy};
pub use error::{ConfigError, Result};
pub use registry::{scope_of, Registry, RegistryKind};
